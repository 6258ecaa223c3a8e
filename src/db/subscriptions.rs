use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::error::{AppError, Result};
use crate::models::{FeedEntry, JsonMap, NewSubscription, Subscription, SubscriptionFlags};

use super::repository::Repository;
use super::rows::{json_text, now_text, subscription_from_row, to_text, SUBSCRIPTION_COLUMNS};

/// Subscription joined with the fields of its source the scheduler needs.
#[derive(Debug, Clone)]
pub struct ScheduledSubscription {
    pub subscription: Subscription,
    pub source_name: String,
    pub plugin_name: String,
    pub source_interval: Option<Duration>,
}

impl Repository {
    pub async fn insert_subscription(&self, new: NewSubscription) -> Result<Subscription> {
        let options = json_text(&new.options);
        let state = json_text(&new.state);
        let metadata = json_text(&new.metadata);
        let flags = SubscriptionFlags::ENABLED;

        let subscription = self
            .conn
            .call(move |conn| {
                let now = now_text();
                conn.execute(
                    "INSERT INTO subscription (source_id, plugin_id, name, repr, options, state,
                     metadata, flags, created_time, updated_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                    params![
                        new.source_id,
                        new.plugin_id,
                        new.name,
                        new.repr,
                        options,
                        state,
                        metadata,
                        flags,
                        now
                    ],
                )?;
                let id = conn.last_insert_rowid();
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM subscription WHERE id = ?1",
                    SUBSCRIPTION_COLUMNS
                ))?;
                let subscription = stmt.query_row(params![id], subscription_from_row)?;
                Ok(subscription)
            })
            .await
            .map_err(|e| AppError::from(e).into_conflict("subscription"))?;
        Ok(subscription)
    }

    pub async fn get_subscription(&self, id: i64) -> Result<Option<Subscription>> {
        let subscription = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM subscription WHERE id = ?1",
                    SUBSCRIPTION_COLUMNS
                ))?;
                let subscription = stmt.query_row(params![id], subscription_from_row).optional()?;
                Ok(subscription)
            })
            .await?;
        Ok(subscription)
    }

    pub async fn find_subscription(
        &self,
        source_id: i64,
        name: &str,
    ) -> Result<Option<Subscription>> {
        let name = name.to_string();
        let subscription = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM subscription WHERE source_id = ?1 AND name = ?2",
                    SUBSCRIPTION_COLUMNS
                ))?;
                let subscription = stmt
                    .query_row(params![source_id, name], subscription_from_row)
                    .optional()?;
                Ok(subscription)
            })
            .await?;
        Ok(subscription)
    }

    /// Lists subscriptions of one source, optionally filtered by enabled state.
    pub async fn list_subscriptions(
        &self,
        source_id: i64,
        enabled: Option<bool>,
    ) -> Result<Vec<Subscription>> {
        let subscriptions = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM subscription WHERE source_id = ?1 ORDER BY name",
                    SUBSCRIPTION_COLUMNS
                ))?;
                let subscriptions = stmt
                    .query_map(params![source_id], subscription_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(subscriptions)
            })
            .await?;

        Ok(match enabled {
            Some(enabled) => subscriptions
                .into_iter()
                .filter(|s| s.is_enabled() == enabled)
                .collect(),
            None => subscriptions,
        })
    }

    /// Enabled subscriptions that still have a plugin, least recently updated first.
    pub async fn schedulable_subscriptions(&self) -> Result<Vec<ScheduledSubscription>> {
        let columns = SUBSCRIPTION_COLUMNS
            .split(", ")
            .map(|c| format!("s.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {}, src.name, p.name, src.update_interval_secs
             FROM subscription s
             JOIN source src ON src.id = s.source_id
             JOIN plugin p ON p.id = s.plugin_id
             WHERE s.flags & ?1 = ?1
             ORDER BY s.last_feed_update_time IS NOT NULL, s.last_feed_update_time, s.id",
            columns
        );

        let scheduled = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let scheduled = stmt
                    .query_map(params![SubscriptionFlags::ENABLED], |row| {
                        let secs: Option<i64> = row.get(15)?;
                        Ok(ScheduledSubscription {
                            subscription: subscription_from_row(row)?,
                            source_name: row.get(13)?,
                            plugin_name: row.get(14)?,
                            source_interval: secs
                                .and_then(|s| u64::try_from(s).ok())
                                .map(Duration::from_secs),
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(scheduled)
            })
            .await?;
        Ok(scheduled)
    }

    pub async fn update_subscription_state(&self, id: i64, state: &JsonMap) -> Result<()> {
        let state = json_text(state);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE subscription SET state = ?1, updated_time = ?2 WHERE id = ?3",
                    params![state, now_text(), id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn set_subscription_plugin(&self, id: i64, plugin_id: Option<i64>) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE subscription SET plugin_id = ?1, updated_time = ?2 WHERE id = ?3",
                    params![plugin_id, now_text(), id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn set_subscription_flags(&self, id: i64, flags: SubscriptionFlags) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE subscription SET flags = ?1, updated_time = ?2 WHERE id = ?3",
                    params![flags.0, now_text(), id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn set_subscription_update_interval(
        &self,
        id: i64,
        interval: Option<Duration>,
    ) -> Result<()> {
        let secs = interval.map(|d| d.as_secs() as i64);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE subscription SET update_interval_secs = ?1, updated_time = ?2
                     WHERE id = ?3",
                    params![secs, now_text(), id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn touch_feed_update(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let at = to_text(at);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE subscription SET last_feed_update_time = ?1, updated_time = ?2
                     WHERE id = ?3",
                    params![at, now_text(), id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // Feed operations

    /// Adds a post to a subscription's feed. Returns false when it was already there,
    /// in which case the stored sort index is left untouched.
    pub async fn add_feed_entry(
        &self,
        subscription_id: i64,
        remote_post_id: i64,
        sort_index: i64,
    ) -> Result<bool> {
        let inserted = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    "INSERT INTO feed (subscription_id, remote_post_id, sort_index)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(subscription_id, remote_post_id) DO NOTHING",
                    params![subscription_id, remote_post_id, sort_index],
                )?;
                Ok(count > 0)
            })
            .await
            .map_err(|e| AppError::from(e).into_conflict("feed entry"))?;
        Ok(inserted)
    }

    /// Feed entries ordered newest first.
    pub async fn feed_entries(
        &self,
        subscription_id: i64,
        limit: Option<usize>,
    ) -> Result<Vec<FeedEntry>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let entries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT subscription_id, remote_post_id, sort_index FROM feed
                     WHERE subscription_id = ?1
                     ORDER BY sort_index DESC
                     LIMIT ?2",
                )?;
                let entries = stmt
                    .query_map(params![subscription_id, limit], |row| {
                        Ok(FeedEntry {
                            subscription_id: row.get(0)?,
                            remote_post_id: row.get(1)?,
                            sort_index: row.get(2)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(entries)
            })
            .await?;
        Ok(entries)
    }
}
