use std::time::Duration;

use rusqlite::{params, OptionalExtension};
use tokio_rusqlite::Connection;

use crate::error::{AppError, Result};
use crate::models::{JsonMap, Plugin, Source};

use super::rows::{
    json_text, now_text, plugin_from_row, source_from_row, PLUGIN_COLUMNS, SOURCE_COLUMNS,
};
use super::schema::SCHEMA;

/// SQL access over a single connection.
///
/// Every method runs on the connection's worker thread, so statements issued
/// between `begin` and `commit`/`rollback` share one native transaction.
#[derive(Clone)]
pub struct Repository {
    pub(super) conn: Connection,
}

impl Repository {
    pub async fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.busy_timeout(Duration::from_secs(5))?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    pub async fn migrate(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // Transaction control

    pub async fn begin(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                if conn.is_autocommit() {
                    conn.execute_batch("BEGIN")?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn commit(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                if !conn.is_autocommit() {
                    conn.execute_batch("COMMIT")?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                if !conn.is_autocommit() {
                    conn.execute_batch("ROLLBACK")?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    // Source operations

    pub async fn get_source_by_name(&self, name: &str) -> Result<Option<Source>> {
        let name = name.to_string();
        let source = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM source WHERE name = ?1",
                    SOURCE_COLUMNS
                ))?;
                let source = stmt.query_row(params![name], source_from_row).optional()?;
                Ok(source)
            })
            .await?;
        Ok(source)
    }

    pub async fn get_source(&self, id: i64) -> Result<Option<Source>> {
        let source = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM source WHERE id = ?1",
                    SOURCE_COLUMNS
                ))?;
                let source = stmt.query_row(params![id], source_from_row).optional()?;
                Ok(source)
            })
            .await?;
        Ok(source)
    }

    /// Returns the named source, registering it on first use.
    pub async fn ensure_source(&self, name: &str) -> Result<Source> {
        let name = name.to_string();
        let source = self
            .conn
            .call(move |conn| {
                let now = now_text();
                conn.execute(
                    "INSERT INTO source (name, created_time, updated_time) VALUES (?1, ?2, ?2)
                     ON CONFLICT(name) DO NOTHING",
                    params![name, now],
                )?;
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM source WHERE name = ?1",
                    SOURCE_COLUMNS
                ))?;
                let source = stmt.query_row(params![name], source_from_row)?;
                Ok(source)
            })
            .await?;
        Ok(source)
    }

    pub async fn set_preferred_plugin(&self, source_id: i64, plugin_id: Option<i64>) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE source SET preferred_plugin_id = ?1, updated_time = ?2 WHERE id = ?3",
                    params![plugin_id, now_text(), source_id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn set_source_update_interval(
        &self,
        source_id: i64,
        interval: Option<Duration>,
    ) -> Result<()> {
        let secs = interval.map(|d| d.as_secs() as i64);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE source SET update_interval_secs = ?1, updated_time = ?2 WHERE id = ?3",
                    params![secs, now_text(), source_id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // Plugin operations

    pub async fn get_plugin_by_name(&self, name: &str) -> Result<Option<Plugin>> {
        let name = name.to_string();
        let plugin = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM plugin WHERE name = ?1",
                    PLUGIN_COLUMNS
                ))?;
                let plugin = stmt.query_row(params![name], plugin_from_row).optional()?;
                Ok(plugin)
            })
            .await?;
        Ok(plugin)
    }

    pub async fn get_plugin(&self, id: i64) -> Result<Option<Plugin>> {
        let plugin = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM plugin WHERE id = ?1",
                    PLUGIN_COLUMNS
                ))?;
                let plugin = stmt.query_row(params![id], plugin_from_row).optional()?;
                Ok(plugin)
            })
            .await?;
        Ok(plugin)
    }

    pub async fn insert_plugin(
        &self,
        source_id: i64,
        name: &str,
        version: i64,
        config: JsonMap,
    ) -> Result<Plugin> {
        let plugin_name = name.to_string();
        let config_json = json_text(&config);
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO plugin (source_id, name, version, config) VALUES (?1, ?2, ?3, ?4)",
                    params![source_id, plugin_name, version, config_json],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(|e| AppError::from(e).into_conflict("plugin"))?;

        Ok(Plugin {
            id,
            source_id,
            name: name.to_string(),
            version,
            config,
        })
    }

    pub async fn update_plugin(&self, id: i64, version: i64, config: &JsonMap) -> Result<()> {
        let config_json = json_text(config);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE plugin SET version = ?1, config = ?2 WHERE id = ?3",
                    params![version, config_json, id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn update_plugin_config(&self, id: i64, config: &JsonMap) -> Result<()> {
        let config_json = json_text(config);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE plugin SET config = ?1 WHERE id = ?2",
                    params![config_json, id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

