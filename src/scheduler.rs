use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{error, info, warn};

use crate::adapter::{AdapterRegistry, Direction};
use crate::config::SchedulerConfig;
use crate::db::ScheduledSubscription;
use crate::download::Downloader;
use crate::error::Result;
use crate::report::{Failure, Reporter};
use crate::session::{Session, Store};
use crate::sync::{traverse, CommitPolicy, TraversalOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Updated { posts: usize },
    Failed { error: String },
    SkippedNotDue,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    /// Due subscriptions per source, as selected before processing.
    pub due_per_source: BTreeMap<String, usize>,
    /// `source:name` and what happened to it.
    pub outcomes: Vec<(String, RunOutcome)>,
}

impl RunSummary {
    pub fn updated(&self) -> usize {
        self.count(|o| matches!(o, RunOutcome::Updated { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, RunOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, RunOutcome::SkippedNotDue))
    }

    fn count(&self, pred: impl Fn(&RunOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}

/// Unattended driver: updates every due subscription once, one at a time.
pub struct Scheduler<'a> {
    store: &'a Store,
    registry: &'a AdapterRegistry,
    downloader: &'a Downloader,
    config: &'a SchedulerConfig,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        store: &'a Store,
        registry: &'a AdapterRegistry,
        downloader: &'a Downloader,
        config: &'a SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            downloader,
            config,
        }
    }

    pub async fn run(&self, reporter: &mut Reporter) -> Result<RunSummary> {
        let candidates = {
            let session = self.store.session().await?;
            let candidates = session.repo().schedulable_subscriptions().await?;
            session.close().await?;
            candidates
        };

        let now = Utc::now();
        let fallback = self.config.default_update_interval();
        let mut summary = RunSummary::default();
        let mut due = Vec::new();
        for candidate in candidates {
            let key = format!(
                "{}:{}",
                candidate.source_name, candidate.subscription.name
            );
            if candidate
                .subscription
                .is_due(candidate.source_interval, fallback, now)
            {
                *summary
                    .due_per_source
                    .entry(candidate.source_name.clone())
                    .or_default() += 1;
                due.push((key, candidate));
            } else {
                summary.outcomes.push((key, RunOutcome::SkippedNotDue));
            }
        }

        for (source, count) in &summary.due_per_source {
            info!(source = %source, due = count, "subscriptions to update");
        }

        for (i, (key, candidate)) in due.into_iter().enumerate() {
            if i > 0 && !self.config.subscription_delay().is_zero() {
                tokio::time::sleep(self.config.subscription_delay()).await;
            }

            let outcome = match self.update_one(&candidate).await {
                Ok(posts) => {
                    info!(subscription = %key, posts, "updated");
                    RunOutcome::Updated { posts }
                }
                Err(e) => {
                    reporter
                        .record(Failure::new(
                            &candidate.plugin_name,
                            &candidate.subscription.name,
                            &e,
                        ))
                        .await;
                    RunOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            summary.outcomes.push((key, outcome));
        }

        info!(
            updated = summary.updated(),
            failed = summary.failed(),
            skipped = summary.skipped(),
            "scheduler run finished"
        );
        Ok(summary)
    }

    async fn update_one(&self, candidate: &ScheduledSubscription) -> Result<usize> {
        let mut session = self.store.session().await?;
        match self.update_in(&mut session, candidate).await {
            Ok(posts) => {
                session.commit().await?;
                Ok(posts)
            }
            Err(e) => {
                if let Err(rb) = session.rollback().await {
                    error!(error = %rb, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn update_in(
        &self,
        session: &mut Session,
        candidate: &ScheduledSubscription,
    ) -> Result<usize> {
        let loaded = self.registry.load(session, &candidate.plugin_name).await?;
        let mut subscription = candidate.subscription.clone();
        let options = TraversalOptions::new(Direction::Newer)
            .with_policy(CommitPolicy::PerTraversal)
            .with_post_delay(self.config.post_delay());

        let mut attempt = 0;
        loop {
            match traverse(session, self.downloader, &loaded, &mut subscription, &options).await {
                Ok(report) => {
                    session
                        .repo()
                        .touch_feed_update(subscription.id, Utc::now())
                        .await?;
                    return Ok(report.posts.len());
                }
                Err(e) if e.is_rate_limited() && attempt < self.config.retry_limit => {
                    attempt += 1;
                    // cursor state is untouched and written rows stay in the open
                    // transaction, so the retry resumes from the same head
                    let wait = self.backoff();
                    warn!(
                        subscription = %subscription.name,
                        attempt,
                        wait_secs = wait.as_secs(),
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self) -> Duration {
        let min = self.config.rate_limit_backoff_min_secs;
        let max = self.config.rate_limit_backoff_max_secs.max(min);
        Duration::from_secs(rand::thread_rng().gen_range(min..=max))
    }
}
