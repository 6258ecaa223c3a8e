use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_rs::model::Entry;
use feed_rs::parser;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    str_option, AdapterContext, AdapterFactory, CursorEntry, Direction, FileDescription,
    PostDescription, QueryProbe, RemoteCursor, ResumePoint, SourceAdapter, TagDescription,
    UrlMatch, VecCursor,
};
use crate::error::{AppError, Result};
use crate::models::{JsonMap, PostKind, TagCategory};

pub const PLUGIN_ID: &str = "feed";
const URL_KEY: &str = "url";
const HEAD_SECOND_KEY: &str = "head_second";
const HEAD_IDS_KEY: &str = "head_ids";
/// Room for entries sharing one publication second.
const RANKS_PER_SECOND: i64 = 1_000_000;

/// RSS and Atom feeds. Entries are keyed by their publication time, ranked
/// within the second they share.
pub struct FeedFactory;

impl AdapterFactory for FeedFactory {
    fn id(&self) -> &str {
        PLUGIN_ID
    }

    fn source(&self) -> &str {
        "feed"
    }

    fn create(&self, ctx: AdapterContext) -> Result<Box<dyn SourceAdapter>> {
        Ok(Box::new(FeedAdapter { client: ctx.http }))
    }
}

pub struct FeedAdapter {
    client: Client,
}

impl FeedAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn fetch(&self, url: &str) -> Result<feed_rs::model::Feed> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(AppError::from_status(response.status(), url));
        }

        let bytes = response.bytes().await?;
        Ok(parser::parse(&bytes[..])?)
    }
}

fn query_url(query: &JsonMap) -> Result<&str> {
    str_option(query, URL_KEY)
        .ok_or_else(|| AppError::Adapter("feed query needs a url".into()))
}

fn entry_time(entry: &Entry) -> Option<DateTime<Utc>> {
    entry.published.or(entry.updated)
}

/// Flattens a parsed entry into the payload handed back to `download`.
fn entry_payload(entry: &Entry) -> Value {
    // Try content first, then fall back to summary
    let body = entry
        .content
        .as_ref()
        .and_then(|c| c.body.clone())
        .or_else(|| entry.summary.as_ref().map(|s| s.content.clone()));

    let media: Vec<Value> = entry
        .media
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|c| c.url.as_ref())
        .map(|u| Value::from(u.to_string()))
        .collect();

    json!({
        "url": entry.links.first().map(|l| l.href.clone()),
        "title": entry.title.as_ref().map(|t| t.content.clone()),
        "body": body,
        "time": entry_time(entry).map(|t| t.to_rfc3339()),
        "authors": entry.authors.iter().map(|a| a.name.clone()).collect::<Vec<_>>(),
        "categories": entry.categories.iter().map(|c| c.term.clone()).collect::<Vec<_>>(),
        "media": media,
    })
}

/// Gives every dated entry a distinct sort key: the publication second scaled
/// by [`RANKS_PER_SECOND`] plus a rank within that second.
///
/// Ranks handed out for the newest second are kept in the cursor state. An
/// entry that appears later with that same timestamp is ranked after them, so
/// it sorts above the stored head.
fn rank_entries<'e>(
    dated: Vec<(i64, &'e Entry)>,
    state: &JsonMap,
) -> (Vec<CursorEntry>, JsonMap) {
    let known_second = state.get(HEAD_SECOND_KEY).and_then(Value::as_i64);
    let known_ids = strings_in(state.get(HEAD_IDS_KEY));

    let mut by_second: BTreeMap<i64, HashMap<&'e str, &'e Entry>> = BTreeMap::new();
    for (second, entry) in dated {
        by_second
            .entry(second)
            .or_default()
            .insert(entry.id.as_str(), entry);
    }

    let newest = by_second.keys().next_back().copied();
    let mut next_state = state.clone();
    let mut entries = Vec::new();
    for (second, group) in by_second {
        let mut ranked: Vec<String> = if Some(second) == known_second {
            known_ids.clone()
        } else {
            Vec::new()
        };
        let mut unseen: Vec<&str> = group
            .keys()
            .copied()
            .filter(|id| !ranked.iter().any(|known| known.as_str() == *id))
            .collect();
        unseen.sort_unstable();
        ranked.extend(unseen.into_iter().map(str::to_string));

        for (rank, id) in ranked.iter().enumerate() {
            if let Some(entry) = group.get(id.as_str()) {
                let rank = (rank as i64).min(RANKS_PER_SECOND - 1);
                entries.push(
                    CursorEntry::new(second * RANKS_PER_SECOND + rank, id.clone())
                        .with_payload(entry_payload(entry)),
                );
            }
        }

        if Some(second) == newest && known_second.map_or(true, |known| second >= known) {
            next_state.insert(HEAD_SECOND_KEY.into(), Value::from(second));
            next_state.insert(HEAD_IDS_KEY.into(), Value::from(ranked));
        }
    }
    entries.sort_by(|a, b| b.sort_key.cmp(&a.sort_key));
    (entries, next_state)
}

fn strings_in(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn strings(payload: &Value, key: &str) -> Vec<String> {
    strings_in(payload.get(key))
}

fn text(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    fn parse_url(&self, url: &str) -> Option<UrlMatch> {
        let parsed = url::Url::parse(url).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }
        let mut query = JsonMap::new();
        query.insert(URL_KEY.into(), Value::from(parsed.to_string()));
        Some(UrlMatch::Query(query))
    }

    async fn download(&self, original_id: &str, payload: Option<&Value>) -> Result<PostDescription> {
        let payload = payload.ok_or_else(|| {
            AppError::Adapter(format!(
                "feed entry {} can only be stored while iterating its feed",
                original_id
            ))
        })?;

        let files = strings(payload, "media")
            .into_iter()
            .enumerate()
            .map(|(i, url)| FileDescription {
                identifier: Some(url.clone()),
                url: Some(url),
                order: Some(i as i64),
                ..Default::default()
            })
            .collect();

        let tags = strings(payload, "authors")
            .into_iter()
            .map(|a| TagDescription::new(TagCategory::Artist, a))
            .chain(
                strings(payload, "categories")
                    .into_iter()
                    .map(|c| TagDescription::new(TagCategory::General, c)),
            )
            .collect();

        Ok(PostDescription {
            url: text(payload, "url"),
            title: text(payload, "title"),
            comment: text(payload, "body"),
            kind: PostKind::Blog,
            post_time: text(payload, "time")
                .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                .map(|t| t.with_timezone(&Utc)),
            tags,
            files,
            ..Default::default()
        })
    }

    async fn iterate_query(
        &self,
        query: &JsonMap,
        _direction: Direction,
        resume: ResumePoint,
    ) -> Result<Box<dyn RemoteCursor>> {
        let feed = self.fetch(query_url(query)?).await?;

        let dated = feed
            .entries
            .iter()
            .filter_map(|entry| match entry_time(entry) {
                Some(time) => Some((time.timestamp(), entry)),
                None => {
                    debug!(entry = %entry.id, "skipping undated feed entry");
                    None
                }
            })
            .collect();
        let (entries, state) = rank_entries(dated, &resume.state);

        Ok(Box::new(VecCursor::new(vec![entries]).with_state(state)))
    }

    async fn probe_query(&self, query: &JsonMap) -> Result<Option<QueryProbe>> {
        let url = query_url(query)?;
        let feed = self.fetch(url).await?;

        let mut metadata = JsonMap::new();
        if let Some(title) = feed.title {
            metadata.insert("title".into(), Value::from(title.content));
        }
        if let Some(description) = feed.description {
            metadata.insert("description".into(), Value::from(description.content));
        }
        if let Some(link) = feed.links.first() {
            metadata.insert("link".into(), Value::from(link.href.clone()));
        }

        Ok(Some(QueryProbe {
            repr: url.to_string(),
            metadata,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SortKey;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Example</title>
    <link>https://example.com/</link>
    <description>Things</description>
    <item>
      <guid>older</guid>
      <title>Older</title>
      <link>https://example.com/older</link>
      <pubDate>Mon, 05 Jan 2026 10:00:00 GMT</pubDate>
    </item>
    <item>
      <guid>newer</guid>
      <title>Newer</title>
      <link>https://example.com/newer</link>
      <category>news</category>
      <pubDate>Tue, 06 Jan 2026 10:00:00 GMT</pubDate>
      <enclosure url="https://example.com/a.mp3" length="3" type="audio/mpeg"/>
    </item>
  </channel>
</rss>"#;

    async fn serve() -> MockServer {
        let server = MockServer::start().await;
        publish(&server, RSS.to_string()).await;
        server
    }

    async fn publish(server: &MockServer, body: String) {
        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    /// A feed whose items all carry the same publication date.
    fn simultaneous(ids: &[&str]) -> String {
        let items: String = ids
            .iter()
            .map(|id| {
                format!(
                    "<item><guid>{id}</guid><title>{id}</title>\
                     <pubDate>Tue, 06 Jan 2026 10:00:00 GMT</pubDate></item>"
                )
            })
            .collect();
        format!(
            r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Same</title>{items}</channel></rss>"#
        )
    }

    async fn keys(
        adapter: &FeedAdapter,
        server: &MockServer,
        resume: ResumePoint,
    ) -> (Vec<(String, SortKey)>, JsonMap) {
        let mut cursor = adapter
            .iterate_query(&query(server), Direction::Newer, resume)
            .await
            .unwrap();
        let page = cursor.next_page().await.unwrap().unwrap();
        let keys = page
            .into_iter()
            .map(|e| (e.original_id.unwrap(), e.sort_key))
            .collect();
        (keys, cursor.state())
    }

    fn query(server: &MockServer) -> JsonMap {
        let mut query = JsonMap::new();
        query.insert(URL_KEY.into(), format!("{}/feed.xml", server.uri()).into());
        query
    }

    #[tokio::test]
    async fn entries_come_newest_first() {
        let server = serve().await;
        let adapter = FeedAdapter::new(Client::new());
        let mut cursor = adapter
            .iterate_query(&query(&server), Direction::Newer, ResumePoint::default())
            .await
            .unwrap();

        let page = cursor.next_page().await.unwrap().unwrap();
        let ids: Vec<_> = page.iter().map(|e| e.original_id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["newer", "older"]);
        assert!(page[0].sort_key > page[1].sort_key);
        assert!(cursor.next_page().await.unwrap().is_none());

        let post = adapter
            .download("newer", page[0].payload.as_ref())
            .await
            .unwrap();
        assert_eq!(post.title.as_deref(), Some("Newer"));
        assert_eq!(post.files.len(), 1);
        assert_eq!(post.tags[0].tag, "news");
    }

    #[tokio::test]
    async fn probe_uses_url_as_identity() {
        let server = serve().await;
        let adapter = FeedAdapter::new(Client::new());
        let probe = adapter.probe_query(&query(&server)).await.unwrap().unwrap();
        assert_eq!(probe.repr, format!("{}/feed.xml", server.uri()));
        assert_eq!(probe.metadata["title"], "Example");
    }

    #[tokio::test]
    async fn late_entries_in_the_head_second_rank_above_it() {
        let server = MockServer::start().await;
        publish(&server, simultaneous(&["b"])).await;
        let adapter = FeedAdapter::new(Client::new());

        let (first, state) = keys(&adapter, &server, ResumePoint::default()).await;
        assert_eq!(first.len(), 1);
        let head = first[0].1;
        assert_eq!(state[HEAD_IDS_KEY], serde_json::json!(["b"]));

        // "a" sorts before "b" but shows up later with the same timestamp
        publish(&server, simultaneous(&["a", "b"])).await;
        let resume = ResumePoint {
            begin_at: Some(head),
            state,
        };
        let (second, state) = keys(&adapter, &server, resume.clone()).await;
        assert_eq!(second[0].0, "a");
        assert!(second[0].1 > head);
        assert_eq!(second[1], ("b".to_string(), head));
        assert_eq!(state[HEAD_IDS_KEY], serde_json::json!(["b", "a"]));

        // the same call gives the same keys
        let (again, _) = keys(&adapter, &server, resume).await;
        assert_eq!(again, second);
    }

    #[tokio::test]
    async fn download_without_payload_fails() {
        let adapter = FeedAdapter::new(Client::new());
        assert!(adapter.download("x", None).await.is_err());
    }
}
