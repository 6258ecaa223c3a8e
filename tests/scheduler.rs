mod common;

use std::time::Duration;

use chrono::Utc;
use common::{Failure, Harness, Item};
use feedhoard::config::{ReportConfig, SchedulerConfig};
use feedhoard::models::SortKey;
use feedhoard::report::Reporter;
use feedhoard::scheduler::{RunOutcome, Scheduler};

fn quick(retry_limit: u32) -> SchedulerConfig {
    SchedulerConfig {
        post_delay_secs: 0,
        subscription_delay_secs: 0,
        retry_limit,
        rate_limit_backoff_min_secs: 0,
        rate_limit_backoff_max_secs: 0,
        ..Default::default()
    }
}

fn outcome<'a>(outcomes: &'a [(String, RunOutcome)], key: &str) -> &'a RunOutcome {
    &outcomes
        .iter()
        .find(|(k, _)| k == key)
        .unwrap_or_else(|| panic!("no outcome for {}", key))
        .1
}

#[tokio::test]
async fn rate_limits_are_retried_in_place() {
    let h = Harness::new().await;
    h.script.push(Item::post(2));
    h.script.push(Item::post(1));
    h.script.fail("1", Failure::RateLimitedOnce);
    let sub = h.subscribe("busy").await;

    let config = quick(1);
    let mut reporter = Reporter::new(ReportConfig::default());
    let summary = Scheduler::new(&h.store, &h.registry, &h.downloader, &config)
        .run(&mut reporter)
        .await
        .unwrap();

    assert_eq!(
        outcome(&summary.outcomes, "scripted:busy"),
        &RunOutcome::Updated { posts: 2 }
    );
    assert!(reporter.failures().is_empty());
    assert_eq!(h.post_count().await, 2);

    let sub = h.reload(sub.id).await;
    assert!(sub.last_feed_update_time.is_some());
    assert_eq!(sub.cursor().head, Some(SortKey(2)));
    assert_eq!(sub.cursor().tail, Some(SortKey(1)));

    // just updated, so not due again
    let summary = Scheduler::new(&h.store, &h.registry, &h.downloader, &config)
        .run(&mut reporter)
        .await
        .unwrap();
    assert_eq!(summary.skipped(), 1);
    assert_eq!(summary.updated(), 0);
}

#[tokio::test]
async fn exhausted_retries_fail_without_touching_state() {
    let h = Harness::new().await;
    h.script.push(Item::post(1));
    h.script.fail("1", Failure::RateLimitedOnce);
    let sub = h.subscribe("stubborn").await;

    let config = quick(0);
    let mut reporter = Reporter::new(ReportConfig::default());
    let summary = Scheduler::new(&h.store, &h.registry, &h.downloader, &config)
        .run(&mut reporter)
        .await
        .unwrap();

    assert_eq!(summary.failed(), 1);
    let sub = h.reload(sub.id).await;
    assert!(sub.state.is_empty());
    assert!(sub.last_feed_update_time.is_none());
}

#[tokio::test]
async fn one_failing_subscription_does_not_stop_the_rest() {
    let h = Harness::new().await;
    h.script.push(Item::post(10).only_in("broken"));
    h.script.push(Item::post(20).only_in("healthy"));
    h.script.fail("10", Failure::Permanent);
    let broken = h.subscribe("broken").await;
    let healthy = h.subscribe("healthy").await;

    let dir = tempfile::tempdir().unwrap();
    let mut reporter = Reporter::new(ReportConfig {
        error_directory: Some(dir.path().to_path_buf()),
        ..Default::default()
    });
    let config = quick(3);
    let summary = Scheduler::new(&h.store, &h.registry, &h.downloader, &config)
        .run(&mut reporter)
        .await
        .unwrap();

    assert_eq!(summary.due_per_source.get("scripted"), Some(&2));
    assert!(matches!(
        outcome(&summary.outcomes, "scripted:broken"),
        RunOutcome::Failed { .. }
    ));
    assert_eq!(
        outcome(&summary.outcomes, "scripted:healthy"),
        &RunOutcome::Updated { posts: 1 }
    );

    assert_eq!(reporter.failures().len(), 1);
    assert!(dir.path().join("scripted-broken.txt").exists());
    assert_eq!(h.post_count().await, 1);
    assert!(h.reload(broken.id).await.last_feed_update_time.is_none());
    assert!(h.reload(healthy.id).await.last_feed_update_time.is_some());
}

#[tokio::test]
async fn disabled_subscriptions_are_not_scheduled() {
    let h = Harness::new().await;
    h.script.push(Item::post(1));
    let mut sub = h.subscribe("off").await;

    let mut session = h.store.session().await.unwrap();
    feedhoard::sync::set_enabled(&session, &mut sub, false).await.unwrap();
    session.commit().await.unwrap();
    session.close().await.unwrap();

    let config = quick(0);
    let mut reporter = Reporter::new(ReportConfig::default());
    let summary = Scheduler::new(&h.store, &h.registry, &h.downloader, &config)
        .run(&mut reporter)
        .await
        .unwrap();
    assert!(summary.outcomes.is_empty());
    assert_eq!(h.post_count().await, 0);
}

#[tokio::test]
async fn stalest_subscriptions_go_first() {
    let h = Harness::new().await;
    let fresh = h.subscribe("fresh").await;
    let stale = h.subscribe("stale").await;
    h.subscribe("never").await;
    let staler = h.subscribe("staler").await;

    let now = Utc::now();
    let mut session = h.store.session().await.unwrap();
    for (sub, ago) in [
        (&fresh, chrono::Duration::minutes(30)),
        (&stale, chrono::Duration::hours(3)),
        (&staler, chrono::Duration::hours(5)),
    ] {
        session
            .repo()
            .touch_feed_update(sub.id, now - ago)
            .await
            .unwrap();
    }
    // shorter than the daily default, so only the source interval makes these due
    session
        .repo()
        .set_source_update_interval(fresh.source_id, Some(Duration::from_secs(2 * 3600)))
        .await
        .unwrap();
    session.commit().await.unwrap();
    session.close().await.unwrap();

    let config = quick(0);
    let mut reporter = Reporter::new(ReportConfig::default());
    let summary = Scheduler::new(&h.store, &h.registry, &h.downloader, &config)
        .run(&mut reporter)
        .await
        .unwrap();

    let order: Vec<&str> = summary
        .outcomes
        .iter()
        .filter(|(_, outcome)| matches!(outcome, RunOutcome::Updated { .. }))
        .map(|(key, _)| key.as_str())
        .collect();
    assert_eq!(order, vec!["scripted:never", "scripted:staler", "scripted:stale"]);
    assert_eq!(
        outcome(&summary.outcomes, "scripted:fresh"),
        &RunOutcome::SkippedNotDue
    );
    assert_eq!(summary.due_per_source.get("scripted"), Some(&3));
}
