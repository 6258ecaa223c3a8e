use std::io::{BufRead, IsTerminal, Write};
use std::time::Duration;

use feedhoard::adapter::{AdapterRegistry, Direction, LoadedAdapter, SetupStatus, UrlMatch};
use feedhoard::config::Config;
use feedhoard::download::{build_client, Downloader};
use feedhoard::error::{AppError, Result};
use feedhoard::models::{JsonMap, Subscription};
use feedhoard::report::Reporter;
use feedhoard::scheduler::{RunOutcome, Scheduler};
use feedhoard::session::{Session, Store};
use feedhoard::storage::FileStore;
use feedhoard::sync::{self, TraversalOptions};

pub enum Command {
    Setup { plugin: String, values: JsonMap },
    Subscribe { plugin: String, name: String, url: String },
    List { source: String, disabled: bool },
    Enable { target: String, enabled: bool },
    Interval { target: String, minutes: Option<u64> },
    Traverse { target: String, direction: Direction, limit: Option<usize> },
    Download { urls: Vec<String> },
    Files { post_id: i64 },
    Delete { post_id: i64 },
    Schedule,
    Audit { apply: bool },
}

/// What to do after an interactive traversal fails.
enum Recovery {
    Retry,
    Disable,
    Skip,
}

pub struct App {
    config: Config,
    store: Store,
    registry: AdapterRegistry,
    downloader: Downloader,
}

impl App {
    pub async fn new(config: Config) -> Result<Self> {
        let files = FileStore::new(&config.base_path, config.files_bucket_size);
        let store = Store::open(&config.db_path, files).await?;
        let client = build_client(&config.user_agent)?;
        let registry = AdapterRegistry::with_builtins(client.clone());
        let downloader = Downloader::new(client);

        Ok(Self {
            config,
            store,
            registry,
            downloader,
        })
    }

    pub async fn run(&self, command: Command) -> Result<()> {
        match command {
            Command::Setup { plugin, values } => self.setup(&plugin, values).await,
            Command::Subscribe { plugin, name, url } => self.subscribe(&plugin, &name, &url).await,
            Command::List { source, disabled } => self.list(&source, disabled).await,
            Command::Enable { target, enabled } => self.set_enabled(&target, enabled).await,
            Command::Interval { target, minutes } => self.set_interval(&target, minutes).await,
            Command::Traverse {
                target,
                direction,
                limit,
            } => self.traverse(&target, direction, limit).await,
            Command::Download { urls } => self.download(&urls).await,
            Command::Files { post_id } => self.files(post_id).await,
            Command::Delete { post_id } => self.delete(post_id).await,
            Command::Schedule => self.schedule().await,
            Command::Audit { apply } => self.audit(apply).await,
        }
    }

    async fn setup(&self, plugin: &str, values: JsonMap) -> Result<()> {
        let mut session = self.store.session().await?;
        let id = self.registry.resolve(&session, plugin).await?;
        let status = self.registry.setup(&session, &id, values).await?;
        session.commit().await?;

        match status {
            SetupStatus::Ready => println!("{} is ready", id),
            SetupStatus::MissingFields(fields) => {
                println!("{} needs: {}", id, fields.join(", "));
            }
        }
        Ok(())
    }

    async fn subscribe(&self, plugin: &str, name: &str, url: &str) -> Result<()> {
        let mut session = self.store.session().await?;
        let id = self.registry.resolve(&session, plugin).await?;
        let loaded = self.registry.load(&session, &id).await?;
        let subscription = sync::subscribe_url(&session, &loaded, name, url).await?;
        session.commit().await?;
        println!(
            "subscribed to {}:{} ({})",
            loaded.source.name,
            subscription.name,
            subscription.repr.as_deref().unwrap_or("-")
        );
        Ok(())
    }

    async fn list(&self, source: &str, disabled: bool) -> Result<()> {
        let session = self.store.session().await?;
        let source = session
            .repo()
            .get_source_by_name(source)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("source {}", source)))?;
        let enabled = if disabled { Some(false) } else { Some(true) };
        for sub in session.repo().list_subscriptions(source.id, enabled).await? {
            let state = sub.cursor();
            println!(
                "{}\thead={}\ttail={}\tlast update={}",
                sub.name,
                state.head.map(|k| k.to_string()).unwrap_or_default(),
                state.tail.map(|k| k.to_string()).unwrap_or_default(),
                sub.last_feed_update_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".into())
            );
        }
        session.close().await
    }

    /// Resolves `source:name` to a subscription and the adapter to drive it.
    async fn target(&self, session: &Session, target: &str) -> Result<(Subscription, LoadedAdapter)> {
        let (source_name, name) = target
            .split_once(':')
            .ok_or_else(|| AppError::Config(format!("expected <source>:<name>, got {}", target)))?;
        let source = session
            .repo()
            .get_source_by_name(source_name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("source {}", source_name)))?;
        let subscription = session
            .repo()
            .find_subscription(source.id, name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("subscription {}", target)))?;

        let plugin_id = match subscription.plugin_id {
            Some(id) => session.repo().get_plugin(id).await?.map(|p| p.name),
            None => None,
        };
        let plugin_id = match plugin_id {
            Some(id) => id,
            None => self.registry.resolve(session, source_name).await?,
        };
        let loaded = self.registry.load(session, &plugin_id).await?;
        Ok((subscription, loaded))
    }

    async fn set_enabled(&self, target: &str, enabled: bool) -> Result<()> {
        let mut session = self.store.session().await?;
        let (mut subscription, _) = self.target(&session, target).await?;
        sync::set_enabled(&session, &mut subscription, enabled).await?;
        session.commit().await?;
        println!(
            "{} {}",
            target,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// `source` sets the source default, `source:name` overrides it for one subscription.
    async fn set_interval(&self, target: &str, minutes: Option<u64>) -> Result<()> {
        let interval = minutes.map(|m| Duration::from_secs(m * 60));
        let mut session = self.store.session().await?;
        if target.contains(':') {
            let (subscription, _) = self.target(&session, target).await?;
            session
                .repo()
                .set_subscription_update_interval(subscription.id, interval)
                .await?;
        } else {
            let source = session
                .repo()
                .get_source_by_name(target)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("source {}", target)))?;
            session
                .repo()
                .set_source_update_interval(source.id, interval)
                .await?;
        }
        session.commit().await?;
        match minutes {
            Some(m) => println!("{} updates every {} minute(s)", target, m),
            None => println!("{} uses the default interval", target),
        }
        Ok(())
    }

    async fn traverse(&self, target: &str, direction: Direction, limit: Option<usize>) -> Result<()> {
        let mut session = self.store.session().await?;
        let (mut subscription, loaded) = self.target(&session, target).await?;
        session.commit().await?;
        let options = TraversalOptions::new(direction).with_limit(limit);

        loop {
            match sync::traverse(
                &mut session,
                &self.downloader,
                &loaded,
                &mut subscription,
                &options,
            )
            .await
            {
                Ok(report) => {
                    println!(
                        "{}: {} post(s), {} new in feed, {} skipped",
                        target,
                        report.posts.len(),
                        report.added_to_feed,
                        report.skipped
                    );
                    return session.close().await;
                }
                Err(e) => {
                    eprintln!("{}: {}", target, e);
                    if e.is_transient() {
                        eprintln!("the error looks temporary, retrying may help");
                    }
                    match ask_recovery()? {
                        Recovery::Retry => continue,
                        Recovery::Disable => {
                            sync::set_enabled(&session, &mut subscription, false).await?;
                            session.commit().await?;
                            println!("{} disabled", target);
                            return Ok(());
                        }
                        Recovery::Skip => return Err(e),
                    }
                }
            }
        }
    }

    async fn download(&self, urls: &[String]) -> Result<()> {
        let mut session = self.store.session().await?;
        for url in urls {
            let Some(loaded) = self.adapter_for_post(&session, url).await else {
                eprintln!("no plugin understands {}", url);
                continue;
            };
            match sync::download_url(&mut session, &self.downloader, &loaded, url).await {
                Ok(post) => {
                    session.commit().await?;
                    println!("{} -> post {}", url, post.id);
                }
                Err(e) => {
                    session.rollback().await?;
                    eprintln!("{}: {}", url, e);
                }
            }
        }
        session.close().await
    }

    /// First adapter that recognises `url` as a single post.
    async fn adapter_for_post(&self, session: &Session, url: &str) -> Option<LoadedAdapter> {
        for id in self.registry.ids() {
            // adapters that are not set up cannot download anyway
            let Ok(loaded) = self.registry.load(session, id).await else {
                continue;
            };
            if matches!(loaded.adapter.parse_url(url), Some(UrlMatch::Post(_))) {
                return Some(loaded);
            }
        }
        None
    }

    async fn files(&self, post_id: i64) -> Result<()> {
        let session = self.store.session().await?;
        let post = session
            .repo()
            .get_post(post_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("post {}", post_id)))?;
        println!(
            "post {} ({})",
            post.id,
            post.original_id.as_deref().unwrap_or("local")
        );
        for tag in session.repo().post_tags(post.id).await? {
            println!("  tag {}", tag);
        }
        for file in session.repo().post_files(post.id).await? {
            let location = if file.is_present() {
                self.store.files().file_path(&file).display().to_string()
            } else {
                "missing".to_string()
            };
            println!(
                "  [{}] file {} {} {}",
                file.remote_order,
                file.id,
                file.filename.as_deref().unwrap_or("-"),
                location
            );
        }
        session.close().await
    }

    async fn delete(&self, post_id: i64) -> Result<()> {
        let mut session = self.store.session().await?;
        if !session.delete_remote_post(post_id).await? {
            session.close().await?;
            return Err(AppError::NotFound(format!("post {}", post_id)));
        }
        session.commit().await?;
        println!("deleted post {}", post_id);
        Ok(())
    }

    async fn schedule(&self) -> Result<()> {
        let mut reporter = Reporter::new(self.config.report.clone());
        let scheduler = Scheduler::new(
            &self.store,
            &self.registry,
            &self.downloader,
            &self.config.scheduler,
        );
        let summary = scheduler.run(&mut reporter).await?;

        for (source, count) in &summary.due_per_source {
            println!("{}: {} due", source, count);
        }
        for (key, outcome) in &summary.outcomes {
            match outcome {
                RunOutcome::Updated { posts } => println!("{}: updated ({} posts)", key, posts),
                RunOutcome::Failed { error } => println!("{}: failed: {}", key, error),
                RunOutcome::SkippedNotDue => {}
            }
        }
        println!(
            "updated {}, failed {}, not due {}",
            summary.updated(),
            summary.failed(),
            summary.skipped()
        );
        reporter.send().await
    }

    async fn audit(&self, apply: bool) -> Result<()> {
        let session = self.store.session().await?;
        let report = self.store.files().audit(session.repo(), apply).await?;
        session.close().await?;

        let verb = if apply { "removed" } else { "would remove" };
        for path in report.unknown.iter().chain(report.orphaned.iter()) {
            println!("{} {}", verb, path.display());
        }
        let verb = if apply { "moved" } else { "would move" };
        for (from, to) in &report.misplaced {
            println!("{} {} -> {}", verb, from.display(), to.display());
        }
        if report.is_clean() {
            println!("scanned {} entries, all in place", report.scanned);
        } else {
            println!("scanned {} entries", report.scanned);
        }
        Ok(())
    }
}

fn ask_recovery() -> Result<Recovery> {
    if !std::io::stdin().is_terminal() {
        return Ok(Recovery::Skip);
    }
    loop {
        print!("[r]etry, [d]isable or [s]kip? ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if std::io::stdin().lock().read_line(&mut line)? == 0 {
            return Ok(Recovery::Skip);
        }
        match line.trim() {
            "r" | "retry" => return Ok(Recovery::Retry),
            "d" | "disable" => return Ok(Recovery::Disable),
            "s" | "skip" => return Ok(Recovery::Skip),
            _ => continue,
        }
    }
}
