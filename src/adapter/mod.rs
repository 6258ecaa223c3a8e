//! Source adapters: the site-specific half of synchronization.
//!
//! An adapter knows how to recognise URLs of its source, describe a single
//! remote post, and walk a remote query page by page. Everything it produces
//! is plain data; persistence is handled by [`crate::sync`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::models::{JsonMap, PostKind, SortKey, TagCategory};
use crate::session::CredentialWriter;

pub mod feed;
pub mod filesystem;
mod registry;

pub use registry::{AdapterRegistry, LoadedAdapter};

/// What a URL points at.
#[derive(Debug, Clone, PartialEq)]
pub enum UrlMatch {
    /// A single post, by its original id.
    Post(String),
    /// A query that can back a subscription.
    Query(JsonMap),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Newer,
    Older,
}

impl Direction {
    pub fn is_newer(self) -> bool {
        self == Direction::Newer
    }
}

/// Where a traversal starts. `begin_at` is the head for newer passes and the
/// tail for older ones; the engine never ingests it again.
#[derive(Debug, Clone, Default)]
pub struct ResumePoint {
    pub begin_at: Option<SortKey>,
    /// Adapter bookkeeping from the previous traversal.
    pub state: JsonMap,
}

/// One position in a remote feed.
#[derive(Debug, Clone)]
pub struct CursorEntry {
    pub sort_key: SortKey,
    /// `None` marks an item that exists but must not be downloaded.
    pub original_id: Option<String>,
    /// Already-fetched data handed back to [`SourceAdapter::download`].
    pub payload: Option<Value>,
}

impl CursorEntry {
    pub fn new(sort_key: i64, original_id: impl Into<String>) -> Self {
        Self {
            sort_key: SortKey(sort_key),
            original_id: Some(original_id.into()),
            payload: None,
        }
    }

    pub fn skipped(sort_key: i64) -> Self {
        Self {
            sort_key: SortKey(sort_key),
            original_id: None,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Pull-based walk over a remote query, newest to oldest.
#[async_trait]
pub trait RemoteCursor: Send {
    /// The next page, or `None` when the feed is exhausted.
    async fn next_page(&mut self) -> Result<Option<Vec<CursorEntry>>>;

    /// Adapter bookkeeping to persist once the traversal completes.
    fn state(&self) -> JsonMap {
        JsonMap::new()
    }
}

/// Cursor over pages computed up front.
pub struct VecCursor {
    pages: std::vec::IntoIter<Vec<CursorEntry>>,
    state: JsonMap,
}

impl VecCursor {
    pub fn new(pages: Vec<Vec<CursorEntry>>) -> Self {
        Self {
            pages: pages.into_iter(),
            state: JsonMap::new(),
        }
    }

    /// Splits a flat list into pages of `page_size` entries.
    pub fn paged(entries: Vec<CursorEntry>, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        let mut pages = Vec::new();
        let mut iter = entries.into_iter().peekable();
        while iter.peek().is_some() {
            pages.push(iter.by_ref().take(page_size).collect());
        }
        Self::new(pages)
    }

    pub fn with_state(mut self, state: JsonMap) -> Self {
        self.state = state;
        self
    }
}

#[async_trait]
impl RemoteCursor for VecCursor {
    async fn next_page(&mut self) -> Result<Option<Vec<CursorEntry>>> {
        Ok(self.pages.next())
    }

    fn state(&self) -> JsonMap {
        self.state.clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TagDescription {
    pub category: TagCategory,
    pub tag: String,
    pub metadata: JsonMap,
}

impl TagDescription {
    pub fn new(category: TagCategory, tag: impl Into<String>) -> Self {
        Self {
            category,
            tag: tag.into(),
            metadata: JsonMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileDescription {
    /// `http(s)://`, `file://` or `data:` URL. `None` when the bytes are unreachable.
    pub url: Option<String>,
    /// Position within the post. Defaults to the index in the list.
    pub order: Option<i64>,
    pub filename: Option<String>,
    /// Stable remote id used to re-match files across ingestions.
    pub identifier: Option<String>,
    pub metadata: JsonMap,
}

impl FileDescription {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum RelatedDescription {
    Url(String),
    /// A post to ingest alongside the one that links to it.
    Post {
        original_id: String,
        post: Box<PostDescription>,
    },
}

/// Canonical, source-independent description of one remote post.
#[derive(Debug, Clone, Default)]
pub struct PostDescription {
    pub url: Option<String>,
    pub title: Option<String>,
    pub comment: Option<String>,
    pub kind: PostKind,
    pub post_time: Option<DateTime<Utc>>,
    pub favorite: bool,
    pub hidden: bool,
    pub removed: bool,
    /// Store the post without its original id, e.g. local files.
    pub omit_original_id: bool,
    pub metadata: JsonMap,
    pub tags: Vec<TagDescription>,
    pub related: Vec<RelatedDescription>,
    pub files: Vec<FileDescription>,
}

/// Result of probing a query before subscribing to it.
#[derive(Debug, Clone)]
pub struct QueryProbe {
    /// Stable identity of the query, stored as the subscription repr.
    pub repr: String,
    pub metadata: JsonMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupStatus {
    Ready,
    MissingFields(Vec<String>),
}

/// Everything an adapter instance is built from.
#[derive(Clone)]
pub struct AdapterContext {
    pub config: JsonMap,
    pub credentials: CredentialWriter,
    pub http: reqwest::Client,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn parse_url(&self, url: &str) -> Option<UrlMatch>;

    async fn download(&self, original_id: &str, payload: Option<&Value>) -> Result<PostDescription>;

    async fn iterate_query(
        &self,
        query: &JsonMap,
        direction: Direction,
        resume: ResumePoint,
    ) -> Result<Box<dyn RemoteCursor>>;

    /// `None` when the query cannot back a subscription.
    async fn probe_query(&self, query: &JsonMap) -> Result<Option<QueryProbe>>;
}

/// Registration entry for an adapter: identity, versioning and construction.
pub trait AdapterFactory: Send + Sync {
    /// Plugin name, unique across sources.
    fn id(&self) -> &str;

    /// Name of the source this adapter talks to.
    fn source(&self) -> &str;

    fn version(&self) -> i64 {
        1
    }

    /// Upgrades a stored config written by an older version.
    fn migrate(&self, _from_version: i64, _config: &mut JsonMap) -> Result<()> {
        Ok(())
    }

    fn setup(&self, _config: &JsonMap) -> SetupStatus {
        SetupStatus::Ready
    }

    fn create(&self, ctx: AdapterContext) -> Result<Box<dyn SourceAdapter>>;
}

/// Reads a string option from a query or config blob.
pub fn str_option<'a>(map: &'a JsonMap, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paged_cursor_splits_entries() {
        let entries = (1..=5).rev().map(|k| CursorEntry::new(k, k.to_string())).collect();
        let mut cursor = VecCursor::paged(entries, 2);

        let mut sizes = Vec::new();
        while let Some(page) = cursor.next_page().await.unwrap() {
            sizes.push(page.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }
}
