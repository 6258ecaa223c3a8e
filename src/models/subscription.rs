use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JsonMap;

flag_set!(SubscriptionFlags {
    // disabled subscriptions are never picked up by the scheduler
    ENABLED = 1,
});

const HEAD_KEY: &str = "head";
const TAIL_KEY: &str = "tail";

/// Adapter-defined position in a remote feed. Larger keys are newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortKey(pub i64);

impl SortKey {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(SortKey),
            Value::String(s) => s.parse().ok().map(SortKey),
            _ => None,
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed view over a subscription's state blob.
///
/// `head` and `tail` are the only keys the engine owns; everything else is
/// adapter bookkeeping and is carried through untouched in `custom`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CursorState {
    pub head: Option<SortKey>,
    pub tail: Option<SortKey>,
    pub custom: JsonMap,
}

impl CursorState {
    pub fn from_blob(blob: &JsonMap) -> Self {
        let mut custom = blob.clone();
        let head = custom.remove(HEAD_KEY).as_ref().and_then(SortKey::from_value);
        let tail = custom.remove(TAIL_KEY).as_ref().and_then(SortKey::from_value);
        Self { head, tail, custom }
    }

    pub fn to_blob(&self) -> JsonMap {
        let mut blob = self.custom.clone();
        if let Some(head) = self.head {
            blob.insert(HEAD_KEY.to_string(), Value::from(head.0));
        }
        if let Some(tail) = self.tail {
            blob.insert(TAIL_KEY.to_string(), Value::from(tail.0));
        }
        blob
    }

    /// Applies the outcome of one traversal call.
    ///
    /// `head` moves only when it was never set, or when a newer-direction pass
    /// reached the end without error. `tail` is seeded on the first pass and
    /// afterwards follows older-direction passes and interrupted passes.
    /// Neither cursor ever moves backwards.
    pub fn record_traversal(
        &mut self,
        newer: bool,
        first: Option<SortKey>,
        last: Option<SortKey>,
        clean: bool,
    ) {
        if let Some(first) = first {
            if self.head.is_none() || (newer && clean) {
                self.head = Some(self.head.map_or(first, |head| head.max(first)));
            }
        }

        if let Some(last) = last {
            if self.tail.is_none() || !newer || !clean {
                self.tail = Some(self.tail.map_or(last, |tail| tail.min(last)));
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub source_id: i64,
    pub plugin_id: Option<i64>,
    pub name: String,
    /// Stable identity of the underlying query, unique per source.
    pub repr: Option<String>,
    pub options: JsonMap,
    pub state: JsonMap,
    pub metadata: JsonMap,
    pub flags: SubscriptionFlags,
    pub update_interval: Option<Duration>,
    pub last_feed_update_time: Option<DateTime<Utc>>,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
}

impl Subscription {
    pub fn is_enabled(&self) -> bool {
        self.flags.contains(SubscriptionFlags::ENABLED)
    }

    pub fn cursor(&self) -> CursorState {
        CursorState::from_blob(&self.state)
    }

    /// Whether enough time has passed since the last update. The subscription
    /// interval wins over the source interval, which wins over `fallback`.
    pub fn is_due(
        &self,
        source_interval: Option<Duration>,
        fallback: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(last) = self.last_feed_update_time else {
            return true;
        };
        let interval = self.update_interval.or(source_interval).unwrap_or(fallback);
        let interval =
            chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::days(36_500));
        match last.checked_add_signed(interval) {
            Some(due_at) => due_at <= now,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewSubscription {
    pub source_id: i64,
    pub plugin_id: Option<i64>,
    pub name: String,
    pub repr: Option<String>,
    pub options: JsonMap,
    pub state: JsonMap,
    pub metadata: JsonMap,
}

/// Membership of a post in a subscription's feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub subscription_id: i64,
    pub remote_post_id: i64,
    pub sort_index: i64,
}
