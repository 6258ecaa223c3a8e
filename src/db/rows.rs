use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Row;

use crate::models::{
    File, FileFlags, JsonMap, Plugin, PostFlags, PostKind, Related, RemotePost, RemoteTag, Source,
    Subscription, SubscriptionFlags, TagCategory, TagFlags,
};

pub const SOURCE_COLUMNS: &str = "id, name, config, metadata, preferred_plugin_id, \
    update_interval_secs, created_time, updated_time";

pub const PLUGIN_COLUMNS: &str = "id, source_id, name, version, config";

pub const POST_COLUMNS: &str = "id, source_id, original_id, url, title, comment, type, flags, \
    metadata, post_time, created_time, updated_time";

pub const TAG_COLUMNS: &str = "id, source_id, category, tag, metadata, flags";

pub const FILE_COLUMNS: &str = "id, local_id, remote_id, local_order, remote_order, hash, \
    filename, mime, ext, thumb_ext, remote_identifier, metadata, flags, created_time, updated_time";

pub const RELATED_COLUMNS: &str = "id, related_to_id, remote_id, url";

pub const SUBSCRIPTION_COLUMNS: &str = "id, source_id, plugin_id, name, repr, options, state, \
    metadata, flags, update_interval_secs, last_feed_update_time, created_time, updated_time";

pub fn now_text() -> String {
    to_text(Utc::now())
}

pub fn to_text(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Try RFC3339 first (e.g., "2026-01-11T12:34:56+00:00")
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Try SQLite datetime format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

pub fn json_text(map: &JsonMap) -> Option<String> {
    if map.is_empty() {
        None
    } else {
        serde_json::to_string(map).ok()
    }
}

fn json_column(row: &Row, idx: usize) -> rusqlite::Result<JsonMap> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) if !text.trim().is_empty() => serde_json::from_str(&text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        _ => Ok(JsonMap::new()),
    }
}

fn time_column(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<String>>(idx)?
        .and_then(|s| parse_datetime(&s)))
}

fn audit_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(time_column(row, idx)?.unwrap_or_else(Utc::now))
}

fn interval_column(row: &Row, idx: usize) -> rusqlite::Result<Option<Duration>> {
    Ok(row
        .get::<_, Option<i64>>(idx)?
        .and_then(|secs| u64::try_from(secs).ok())
        .map(Duration::from_secs))
}

fn invalid_code(idx: usize, what: &str, value: i64) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Integer,
        format!("invalid {} code {}", what, value).into(),
    )
}

pub fn source_from_row(row: &Row) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get(0)?,
        name: row.get(1)?,
        config: json_column(row, 2)?,
        metadata: json_column(row, 3)?,
        preferred_plugin_id: row.get(4)?,
        update_interval: interval_column(row, 5)?,
        created_time: audit_column(row, 6)?,
        updated_time: audit_column(row, 7)?,
    })
}

pub fn plugin_from_row(row: &Row) -> rusqlite::Result<Plugin> {
    Ok(Plugin {
        id: row.get(0)?,
        source_id: row.get(1)?,
        name: row.get(2)?,
        version: row.get(3)?,
        config: json_column(row, 4)?,
    })
}

pub fn post_from_row(row: &Row) -> rusqlite::Result<RemotePost> {
    let kind: i64 = row.get(6)?;
    Ok(RemotePost {
        id: row.get(0)?,
        source_id: row.get(1)?,
        original_id: row.get(2)?,
        url: row.get(3)?,
        title: row.get(4)?,
        comment: row.get(5)?,
        kind: PostKind::from_i64(kind).ok_or_else(|| invalid_code(6, "post type", kind))?,
        flags: PostFlags(row.get(7)?),
        metadata: json_column(row, 8)?,
        post_time: time_column(row, 9)?,
        created_time: audit_column(row, 10)?,
        updated_time: audit_column(row, 11)?,
    })
}

pub fn tag_from_row(row: &Row) -> rusqlite::Result<RemoteTag> {
    let category: i64 = row.get(2)?;
    Ok(RemoteTag {
        id: row.get(0)?,
        source_id: row.get(1)?,
        category: TagCategory::from_i64(category)
            .ok_or_else(|| invalid_code(2, "tag category", category))?,
        tag: row.get(3)?,
        metadata: json_column(row, 4)?,
        flags: TagFlags(row.get(5)?),
    })
}

pub fn file_from_row(row: &Row) -> rusqlite::Result<File> {
    Ok(File {
        id: row.get(0)?,
        local_id: row.get(1)?,
        remote_id: row.get(2)?,
        local_order: row.get(3)?,
        remote_order: row.get(4)?,
        hash: row.get(5)?,
        filename: row.get(6)?,
        mime: row.get(7)?,
        ext: row.get(8)?,
        thumb_ext: row.get(9)?,
        remote_identifier: row.get(10)?,
        metadata: json_column(row, 11)?,
        flags: FileFlags(row.get(12)?),
        created_time: audit_column(row, 13)?,
        updated_time: audit_column(row, 14)?,
    })
}

pub fn related_from_row(row: &Row) -> rusqlite::Result<Related> {
    Ok(Related {
        id: row.get(0)?,
        related_to_id: row.get(1)?,
        remote_id: row.get(2)?,
        url: row.get(3)?,
    })
}

pub fn subscription_from_row(row: &Row) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        id: row.get(0)?,
        source_id: row.get(1)?,
        plugin_id: row.get(2)?,
        name: row.get(3)?,
        repr: row.get(4)?,
        options: json_column(row, 5)?,
        state: json_column(row, 6)?,
        metadata: json_column(row, 7)?,
        flags: SubscriptionFlags(row.get(8)?),
        update_interval: interval_column(row, 9)?,
        last_feed_update_time: time_column(row, 10)?,
        created_time: audit_column(row, 11)?,
        updated_time: audit_column(row, 12)?,
    })
}
