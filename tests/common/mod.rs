#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use feedhoard::adapter::{
    AdapterContext, AdapterFactory, AdapterRegistry, CursorEntry, Direction, FileDescription,
    LoadedAdapter, PostDescription, QueryProbe, RemoteCursor, ResumePoint, SourceAdapter,
    TagDescription, UrlMatch, VecCursor,
};
use feedhoard::download::{build_client, Downloader};
use feedhoard::error::{AppError, RemoteErrorKind, Result};
use feedhoard::models::{JsonMap, Subscription, TagCategory};
use feedhoard::session::{Session, Store};
use feedhoard::storage::FileStore;
use feedhoard::sync::{self, TraversalOptions, TraversalReport};

pub const PLUGIN: &str = "scripted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    RateLimitedOnce,
    Permanent,
}

#[derive(Debug, Clone)]
pub struct Item {
    pub sort_key: i64,
    pub original_id: Option<String>,
    pub files: Vec<FileDescription>,
    /// Only listed by subscriptions whose `q` matches.
    pub query: Option<String>,
}

impl Item {
    pub fn post(sort_key: i64) -> Self {
        Self {
            sort_key,
            original_id: Some(sort_key.to_string()),
            files: Vec::new(),
            query: None,
        }
    }

    pub fn restricted(sort_key: i64) -> Self {
        Self {
            sort_key,
            original_id: None,
            files: Vec::new(),
            query: None,
        }
    }

    pub fn with_file(mut self, url: impl Into<String>) -> Self {
        let order = self.files.len() as i64;
        self.files.push(FileDescription {
            url: Some(url.into()),
            order: Some(order),
            ..Default::default()
        });
        self
    }

    pub fn only_in(mut self, query: &str) -> Self {
        self.query = Some(query.to_string());
        self
    }
}

/// Remote feed contents shared between a test and its adapter instances.
#[derive(Default)]
pub struct Script {
    items: Mutex<Vec<Item>>,
    failures: Mutex<HashMap<String, Failure>>,
    page_size: Mutex<usize>,
    cursor_state: Mutex<JsonMap>,
    resumed_with: Mutex<Vec<JsonMap>>,
    pub downloads: AtomicUsize,
    pub iterations: AtomicUsize,
}

impl Script {
    pub fn push(&self, item: Item) {
        self.items.lock().unwrap().push(item);
    }

    pub fn fail(&self, original_id: &str, failure: Failure) {
        self.failures
            .lock()
            .unwrap()
            .insert(original_id.to_string(), failure);
    }

    pub fn heal(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn set_page_size(&self, size: usize) {
        *self.page_size.lock().unwrap() = size;
    }

    /// Bookkeeping the next cursor reports back to the engine.
    pub fn set_cursor_state(&self, state: JsonMap) {
        *self.cursor_state.lock().unwrap() = state;
    }

    /// Adapter state handed to each `iterate_query` call so far.
    pub fn resumed_with(&self) -> Vec<JsonMap> {
        self.resumed_with.lock().unwrap().clone()
    }

    fn item(&self, original_id: &str) -> Option<Item> {
        self.items
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.original_id.as_deref() == Some(original_id))
            .cloned()
    }
}

pub struct ScriptedFactory(pub Arc<Script>);

impl AdapterFactory for ScriptedFactory {
    fn id(&self) -> &str {
        PLUGIN
    }

    fn source(&self) -> &str {
        "scripted"
    }

    fn create(&self, _ctx: AdapterContext) -> Result<Box<dyn SourceAdapter>> {
        Ok(Box::new(ScriptedAdapter(Arc::clone(&self.0))))
    }
}

pub struct ScriptedAdapter(Arc<Script>);

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn parse_url(&self, url: &str) -> Option<UrlMatch> {
        let id = url.strip_prefix("scripted://post/")?;
        Some(UrlMatch::Post(id.to_string()))
    }

    async fn download(&self, original_id: &str, _payload: Option<&Value>) -> Result<PostDescription> {
        let failure = self.0.failures.lock().unwrap().get(original_id).copied();
        match failure {
            Some(Failure::RateLimitedOnce) => {
                self.0.failures.lock().unwrap().remove(original_id);
                return Err(AppError::remote(
                    RemoteErrorKind::RateLimited,
                    "rate limit reached",
                ));
            }
            Some(Failure::Permanent) => {
                return Err(AppError::remote(RemoteErrorKind::Permanent, "post is gone"));
            }
            None => {}
        }

        let item = self
            .0
            .item(original_id)
            .ok_or_else(|| AppError::NotFound(format!("post {}", original_id)))?;
        self.0.downloads.fetch_add(1, Ordering::SeqCst);

        Ok(PostDescription {
            url: Some(format!("scripted://post/{}", original_id)),
            title: Some(format!("post {}", original_id)),
            tags: vec![
                TagDescription::new(TagCategory::Artist, "someone"),
                TagDescription::new(TagCategory::General, "thing"),
            ],
            files: item.files,
            ..Default::default()
        })
    }

    async fn iterate_query(
        &self,
        query: &JsonMap,
        direction: Direction,
        resume: ResumePoint,
    ) -> Result<Box<dyn RemoteCursor>> {
        self.0.iterations.fetch_add(1, Ordering::SeqCst);
        self.0.resumed_with.lock().unwrap().push(resume.state.clone());
        let mut items = self.0.items.lock().unwrap().clone();
        items.sort_by(|a, b| b.sort_key.cmp(&a.sort_key));

        let q = query.get("q").and_then(Value::as_str);
        let entries = items
            .into_iter()
            .filter(|i| i.query.is_none() || i.query.as_deref() == q)
            .filter(|i| match (direction, resume.begin_at) {
                (Direction::Older, Some(tail)) => i.sort_key < tail.0,
                _ => true,
            })
            .map(|i| match i.original_id {
                Some(id) => CursorEntry::new(i.sort_key, id),
                None => CursorEntry::skipped(i.sort_key),
            })
            .collect();

        let page_size = match *self.0.page_size.lock().unwrap() {
            0 => 100,
            n => n,
        };
        let state = self.0.cursor_state.lock().unwrap().clone();
        Ok(Box::new(VecCursor::paged(entries, page_size).with_state(state)))
    }

    async fn probe_query(&self, query: &JsonMap) -> Result<Option<QueryProbe>> {
        Ok(query.get("q").and_then(Value::as_str).map(|q| QueryProbe {
            repr: format!("q:{}", q),
            metadata: JsonMap::new(),
        }))
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Store,
    pub registry: AdapterRegistry,
    pub downloader: Downloader,
    pub script: Arc<Script>,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("hoard.db");
        let files = FileStore::new(dir.path().join("data"), 4);
        let store = Store::open(db.to_str().unwrap(), files).await.unwrap();

        let client = build_client("feedhoard-tests").unwrap();
        let script = Arc::new(Script::default());
        let mut registry = AdapterRegistry::new(client.clone());
        registry.register(ScriptedFactory(Arc::clone(&script)));

        Self {
            dir,
            store,
            registry,
            downloader: Downloader::new(client),
            script,
        }
    }

    pub async fn load(&self, session: &Session) -> LoadedAdapter {
        self.registry.load(session, PLUGIN).await.unwrap()
    }

    pub async fn subscribe(&self, name: &str) -> Subscription {
        let mut session = self.store.session().await.unwrap();
        let loaded = self.load(&session).await;
        let mut query = JsonMap::new();
        query.insert("q".into(), Value::from(name));
        let sub = sync::subscribe(&session, &loaded, name, query).await.unwrap();
        session.commit().await.unwrap();
        sub
    }

    /// Runs one committed-per-page traversal and reloads the subscription.
    pub async fn traverse(
        &self,
        sub: &mut Subscription,
        options: TraversalOptions,
    ) -> Result<TraversalReport> {
        let mut session = self.store.session().await?;
        let loaded = self.load(&session).await;
        session.commit().await?;
        let result = sync::traverse(&mut session, &self.downloader, &loaded, sub, &options).await;
        session.close().await?;
        *sub = self.reload(sub.id).await;
        result
    }

    pub async fn update(&self, sub: &mut Subscription) -> Result<TraversalReport> {
        self.traverse(sub, TraversalOptions::new(Direction::Newer))
            .await
    }

    pub async fn backfill(&self, sub: &mut Subscription) -> Result<TraversalReport> {
        self.traverse(sub, TraversalOptions::new(Direction::Older))
            .await
    }

    pub async fn reload(&self, id: i64) -> Subscription {
        let session = self.store.session().await.unwrap();
        let sub = session.repo().get_subscription(id).await.unwrap().unwrap();
        session.close().await.unwrap();
        sub
    }

    pub async fn post_count(&self) -> i64 {
        let session = self.store.session().await.unwrap();
        let source = session
            .repo()
            .get_source_by_name("scripted")
            .await
            .unwrap()
            .unwrap();
        let count = session.repo().count_posts(source.id).await.unwrap();
        session.close().await.unwrap();
        count
    }
}
