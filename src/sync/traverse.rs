use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::adapter::{CursorEntry, Direction, LoadedAdapter, RemoteCursor, ResumePoint};
use crate::download::Downloader;
use crate::error::Result;
use crate::models::{SortKey, Subscription};
use crate::session::Session;

use super::ingest::Ingestor;

/// Where a traversal commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Commit after every page. A failure loses at most the current page and
    /// still records the progress of committed pages.
    PerPage,
    /// Leave committing to the caller. A failure leaves the subscription
    /// state untouched so the same traversal can be retried.
    PerTraversal,
}

#[derive(Debug, Clone)]
pub struct TraversalOptions {
    pub direction: Direction,
    pub policy: CommitPolicy,
    /// Stop after this many ingested posts.
    pub limit: Option<usize>,
    /// Pause after each ingested post.
    pub post_delay: Duration,
}

impl TraversalOptions {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            policy: CommitPolicy::PerPage,
            limit: None,
            post_delay: Duration::ZERO,
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_policy(mut self, policy: CommitPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_post_delay(mut self, delay: Duration) -> Self {
        self.post_delay = delay;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TraversalReport {
    /// Ids of the posts ingested, in traversal order.
    pub posts: Vec<i64>,
    /// Posts that were not in the feed before.
    pub added_to_feed: usize,
    /// Positions the adapter marked as not downloadable.
    pub skipped: usize,
    pub first: Option<SortKey>,
    pub last: Option<SortKey>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    first: Option<SortKey>,
    last: Option<SortKey>,
}

impl Progress {
    fn observe(&mut self, key: SortKey) {
        self.first.get_or_insert(key);
        self.last = Some(key);
    }

    fn absorb(&mut self, later: Progress) {
        if self.first.is_none() {
            self.first = later.first;
        }
        if later.last.is_some() {
            self.last = later.last;
        }
    }
}

/// How a walk over the cursor ended.
enum Finish {
    /// Feed exhausted or known territory reached.
    Complete,
    /// Stopped by the post limit.
    Limited,
}

struct Walk<'a> {
    session: &'a mut Session,
    downloader: &'a Downloader,
    loaded: &'a LoadedAdapter,
    subscription_id: i64,
    options: &'a TraversalOptions,
    head: Option<SortKey>,
    tail: Option<SortKey>,
    report: TraversalReport,
    done: Progress,
}

impl Walk<'_> {
    async fn run(&mut self, cursor: &mut dyn RemoteCursor) -> Result<Finish> {
        let newer = self.options.direction.is_newer();
        loop {
            let Some(page) = cursor.next_page().await? else {
                return Ok(Finish::Complete);
            };

            let mut page_progress = Progress::default();
            let mut finish = None;
            for entry in page {
                if newer && self.head.is_some_and(|head| entry.sort_key <= head) {
                    debug!(sort_key = %entry.sort_key, "reached known head");
                    finish = Some(Finish::Complete);
                    break;
                }
                if !newer && self.tail.is_some_and(|tail| entry.sort_key >= tail) {
                    continue;
                }
                if self
                    .options
                    .limit
                    .is_some_and(|limit| self.report.posts.len() >= limit)
                {
                    finish = Some(Finish::Limited);
                    break;
                }

                page_progress.observe(entry.sort_key);
                self.process(entry).await?;
            }

            if self.options.policy == CommitPolicy::PerPage {
                self.session.commit().await?;
            }
            self.done.absorb(page_progress);

            if let Some(finish) = finish {
                return Ok(finish);
            }
        }
    }

    async fn process(&mut self, entry: CursorEntry) -> Result<()> {
        let Some(original_id) = entry.original_id else {
            debug!(sort_key = %entry.sort_key, "skipping restricted entry");
            self.report.skipped += 1;
            return Ok(());
        };

        let desc = self
            .loaded
            .adapter
            .download(&original_id, entry.payload.as_ref())
            .await?;
        let post = Ingestor::new(self.session, self.downloader, self.loaded.source.id)
            .ingest(Some(original_id), desc)
            .await?;

        if self
            .session
            .repo()
            .add_feed_entry(self.subscription_id, post.id, entry.sort_key.0)
            .await?
        {
            self.report.added_to_feed += 1;
        }
        self.report.posts.push(post.id);

        if !self.options.post_delay.is_zero() {
            tokio::time::sleep(self.options.post_delay).await;
        }
        Ok(())
    }
}

/// Runs one traversal of a subscription's remote feed and records the
/// resulting head/tail cursors in its state.
pub async fn traverse(
    session: &mut Session,
    downloader: &Downloader,
    loaded: &LoadedAdapter,
    subscription: &mut Subscription,
    options: &TraversalOptions,
) -> Result<TraversalReport> {
    let newer = options.direction.is_newer();
    let mut state = subscription.cursor();

    if subscription.plugin_id != Some(loaded.plugin.id) {
        session
            .repo()
            .set_subscription_plugin(subscription.id, Some(loaded.plugin.id))
            .await?;
        subscription.plugin_id = Some(loaded.plugin.id);
    }

    let resume = ResumePoint {
        begin_at: if newer { state.head } else { state.tail },
        state: state.custom.clone(),
    };
    info!(
        subscription = %subscription.name,
        direction = ?options.direction,
        begin_at = ?resume.begin_at,
        "starting traversal"
    );

    let mut cursor = loaded
        .adapter
        .iterate_query(&subscription.options, options.direction, resume)
        .await?;

    let mut walk = Walk {
        session: &mut *session,
        downloader,
        loaded,
        subscription_id: subscription.id,
        options,
        head: state.head,
        tail: state.tail,
        report: TraversalReport::default(),
        done: Progress::default(),
    };
    let outcome = walk.run(cursor.as_mut()).await;
    let Walk {
        mut report, done, ..
    } = walk;
    report.first = done.first;
    report.last = done.last;

    match outcome {
        Ok(finish) => {
            let clean = matches!(finish, Finish::Complete) || !newer;
            state.record_traversal(newer, done.first, done.last, clean);
            let custom = cursor.state();
            if !custom.is_empty() {
                state.custom = custom;
            }
            save_state(session, subscription, state.to_blob()).await?;
            if options.policy == CommitPolicy::PerPage {
                session.commit().await?;
            }
            info!(
                subscription = %subscription.name,
                posts = report.posts.len(),
                skipped = report.skipped,
                head = ?state.head,
                tail = ?state.tail,
                "traversal finished"
            );
            Ok(report)
        }
        Err(e) if options.policy == CommitPolicy::PerPage => {
            warn!(subscription = %subscription.name, error = %e, "traversal interrupted");
            if let Err(rb) = session.rollback().await {
                error!(error = %rb, "rollback failed");
            }
            state.record_traversal(newer, done.first, done.last, false);
            save_state(session, subscription, state.to_blob()).await?;
            session.commit().await?;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

async fn save_state(
    session: &Session,
    subscription: &mut Subscription,
    blob: crate::models::JsonMap,
) -> Result<()> {
    session
        .repo()
        .update_subscription_state(subscription.id, &blob)
        .await?;
    subscription.state = blob;
    Ok(())
}
