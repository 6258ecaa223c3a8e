//! Synchronization engine: ingestion of post descriptions and resumable
//! traversal of subscription feeds.

mod ingest;
mod traverse;

pub use ingest::Ingestor;
pub use traverse::{traverse, CommitPolicy, TraversalOptions, TraversalReport};

use tracing::info;

use crate::adapter::{LoadedAdapter, UrlMatch};
use crate::download::Downloader;
use crate::error::{AppError, Result};
use crate::models::{JsonMap, NewSubscription, RemotePost, Subscription, SubscriptionFlags};
use crate::session::Session;

/// Creates a subscription for a query the adapter can probe.
pub async fn subscribe(
    session: &Session,
    loaded: &LoadedAdapter,
    name: &str,
    query: JsonMap,
) -> Result<Subscription> {
    let probe = loaded.adapter.probe_query(&query).await?.ok_or_else(|| {
        AppError::Adapter(format!(
            "subscriptions are not supported for this query on {}",
            loaded.plugin.name
        ))
    })?;

    let subscription = session
        .repo()
        .insert_subscription(NewSubscription {
            source_id: loaded.source.id,
            plugin_id: Some(loaded.plugin.id),
            name: name.to_string(),
            repr: Some(probe.repr),
            options: query,
            state: JsonMap::new(),
            metadata: probe.metadata,
        })
        .await?;
    info!(source = %loaded.source.name, subscription = name, "subscribed");
    Ok(subscription)
}

/// Subscribes to whatever query `url` names.
pub async fn subscribe_url(
    session: &Session,
    loaded: &LoadedAdapter,
    name: &str,
    url: &str,
) -> Result<Subscription> {
    match loaded.adapter.parse_url(url) {
        Some(UrlMatch::Query(query)) => subscribe(session, loaded, name, query).await,
        Some(UrlMatch::Post(_)) => Err(AppError::Adapter(format!(
            "{} is a single post, not a query",
            url
        ))),
        None => Err(AppError::Adapter(format!(
            "{} does not understand {}",
            loaded.plugin.name, url
        ))),
    }
}

/// Downloads a single post by original id.
pub async fn download_post(
    session: &mut Session,
    downloader: &Downloader,
    loaded: &LoadedAdapter,
    original_id: &str,
) -> Result<RemotePost> {
    let desc = loaded.adapter.download(original_id, None).await?;
    Ingestor::new(session, downloader, loaded.source.id)
        .ingest(Some(original_id.to_string()), desc)
        .await
}

/// Downloads the post `url` points at.
pub async fn download_url(
    session: &mut Session,
    downloader: &Downloader,
    loaded: &LoadedAdapter,
    url: &str,
) -> Result<RemotePost> {
    match loaded.adapter.parse_url(url) {
        Some(UrlMatch::Post(id)) => download_post(session, downloader, loaded, &id).await,
        _ => Err(AppError::Adapter(format!("{} is not a post url", url))),
    }
}

/// Adds a post to a subscription's feed. Without an explicit sort index the
/// numeric original id is used. Returns false if the post was already there.
pub async fn add_to_feed(
    session: &Session,
    subscription: &Subscription,
    post: &RemotePost,
    sort_index: Option<i64>,
) -> Result<bool> {
    let sort_index = sort_index
        .or_else(|| post.numeric_original_id())
        .ok_or(AppError::MissingSortIndex(post.id))?;
    session
        .repo()
        .add_feed_entry(subscription.id, post.id, sort_index)
        .await
}

pub async fn set_enabled(
    session: &Session,
    subscription: &mut Subscription,
    enabled: bool,
) -> Result<()> {
    subscription.flags.set(SubscriptionFlags::ENABLED, enabled);
    session
        .repo()
        .set_subscription_flags(subscription.id, subscription.flags)
        .await
}
