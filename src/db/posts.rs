use std::collections::HashSet;

use rusqlite::{params, OptionalExtension};

use crate::error::{AppError, Result};
use crate::models::{
    File, JsonMap, NewFile, PostKind, Related, RemotePost, RemoteTag, TagCategory,
};

use super::repository::Repository;
use super::rows::{
    file_from_row, json_text, now_text, post_from_row, related_from_row, tag_from_row, to_text,
    FILE_COLUMNS, POST_COLUMNS, RELATED_COLUMNS, TAG_COLUMNS,
};

impl Repository {
    // Remote post operations

    pub async fn get_post(&self, id: i64) -> Result<Option<RemotePost>> {
        let post = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM remote_post WHERE id = ?1",
                    POST_COLUMNS
                ))?;
                let post = stmt.query_row(params![id], post_from_row).optional()?;
                Ok(post)
            })
            .await?;
        Ok(post)
    }

    pub async fn find_post(&self, source_id: i64, original_id: &str) -> Result<Option<RemotePost>> {
        let original_id = original_id.to_string();
        let post = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM remote_post WHERE source_id = ?1 AND original_id = ?2",
                    POST_COLUMNS
                ))?;
                let post = stmt
                    .query_row(params![source_id, original_id], post_from_row)
                    .optional()?;
                Ok(post)
            })
            .await?;
        Ok(post)
    }

    /// Inserts an empty post so it has an id before files are attached to it.
    pub async fn insert_post(&self, source_id: i64, original_id: Option<&str>) -> Result<RemotePost> {
        let original_id = original_id.map(str::to_string);
        let post = self
            .conn
            .call(move |conn| {
                let now = now_text();
                conn.execute(
                    "INSERT INTO remote_post (source_id, original_id, type, created_time, updated_time)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![source_id, original_id, PostKind::Set.as_i64(), now],
                )?;
                let id = conn.last_insert_rowid();
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM remote_post WHERE id = ?1",
                    POST_COLUMNS
                ))?;
                let post = stmt.query_row(params![id], post_from_row)?;
                Ok(post)
            })
            .await
            .map_err(|e| AppError::from(e).into_conflict("remote post"))?;
        Ok(post)
    }

    pub async fn update_post(&self, post: &RemotePost) -> Result<()> {
        let id = post.id;
        let url = post.url.clone();
        let title = post.title.clone();
        let comment = post.comment.clone();
        let kind = post.kind.as_i64();
        let flags = post.flags.0;
        let metadata = json_text(&post.metadata);
        let post_time = post.post_time.map(to_text);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE remote_post SET url = ?1, title = ?2, comment = ?3, type = ?4,
                     flags = ?5, metadata = ?6, post_time = ?7, updated_time = ?8
                     WHERE id = ?9",
                    params![url, title, comment, kind, flags, metadata, post_time, now_text(), id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Deletes a post row. Tags links, feed entries and related edges cascade;
    /// the caller is responsible for the post's files.
    pub async fn delete_post_row(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .call(move |conn| {
                let count = conn.execute("DELETE FROM remote_post WHERE id = ?1", params![id])?;
                Ok(count > 0)
            })
            .await?;
        Ok(deleted)
    }

    pub async fn count_posts(&self, source_id: i64) -> Result<i64> {
        let count = self
            .conn
            .call(move |conn| {
                let count = conn.query_row(
                    "SELECT COUNT(*) FROM remote_post WHERE source_id = ?1",
                    params![source_id],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await?;
        Ok(count)
    }

    // Tag operations

    /// Looks up a tag by its natural key, creating it when missing.
    pub async fn ensure_tag(
        &self,
        source_id: i64,
        category: TagCategory,
        tag: &str,
    ) -> Result<RemoteTag> {
        let tag = tag.to_string();
        let remote_tag = self
            .conn
            .call(move |conn| {
                let now = now_text();
                conn.execute(
                    "INSERT INTO remote_tag (source_id, category, tag, created_time, updated_time)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(source_id, category, tag) DO NOTHING",
                    params![source_id, category.as_i64(), tag, now],
                )?;
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM remote_tag WHERE source_id = ?1 AND category = ?2 AND tag = ?3",
                    TAG_COLUMNS
                ))?;
                let remote_tag =
                    stmt.query_row(params![source_id, category.as_i64(), tag], tag_from_row)?;
                Ok(remote_tag)
            })
            .await?;
        Ok(remote_tag)
    }

    pub async fn update_tag_metadata(&self, tag_id: i64, metadata: &JsonMap) -> Result<()> {
        let metadata = json_text(metadata);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE remote_tag SET metadata = ?1, updated_time = ?2 WHERE id = ?3",
                    params![metadata, now_text(), tag_id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn post_tag_ids(&self, post_id: i64) -> Result<HashSet<i64>> {
        let ids = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT tag_id FROM remote_post_tag WHERE post_id = ?1")?;
                let ids = stmt
                    .query_map(params![post_id], |row| row.get(0))?
                    .collect::<std::result::Result<HashSet<i64>, _>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    pub async fn add_post_tag(&self, post_id: i64, tag_id: i64) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO remote_post_tag (post_id, tag_id) VALUES (?1, ?2)",
                    params![post_id, tag_id],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| AppError::from(e).into_conflict("post tag"))?;
        Ok(())
    }

    pub async fn post_tags(&self, post_id: i64) -> Result<Vec<RemoteTag>> {
        let tags = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT t.id, t.source_id, t.category, t.tag, t.metadata, t.flags
                     FROM remote_tag t
                     JOIN remote_post_tag pt ON pt.tag_id = t.id
                     WHERE pt.post_id = ?1
                     ORDER BY t.category, t.tag",
                )?;
                let tags = stmt
                    .query_map(params![post_id], tag_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(tags)
            })
            .await?;
        Ok(tags)
    }

    // File operations

    pub async fn get_file(&self, id: i64) -> Result<Option<File>> {
        let file = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {} FROM file WHERE id = ?1", FILE_COLUMNS))?;
                let file = stmt.query_row(params![id], file_from_row).optional()?;
                Ok(file)
            })
            .await?;
        Ok(file)
    }

    pub async fn post_files(&self, post_id: i64) -> Result<Vec<File>> {
        let files = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM file WHERE remote_id = ?1 ORDER BY remote_order, id",
                    FILE_COLUMNS
                ))?;
                let files = stmt
                    .query_map(params![post_id], file_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(files)
            })
            .await?;
        Ok(files)
    }

    pub async fn insert_file(&self, new: NewFile) -> Result<File> {
        let metadata = json_text(&new.metadata);
        let file = self
            .conn
            .call(move |conn| {
                let now = now_text();
                conn.execute(
                    "INSERT INTO file (remote_id, remote_order, filename, remote_identifier,
                     metadata, created_time, updated_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        new.remote_id,
                        new.remote_order,
                        new.filename,
                        new.remote_identifier,
                        metadata,
                        now
                    ],
                )?;
                let id = conn.last_insert_rowid();
                let mut stmt =
                    conn.prepare(&format!("SELECT {} FROM file WHERE id = ?1", FILE_COLUMNS))?;
                let file = stmt.query_row(params![id], file_from_row)?;
                Ok(file)
            })
            .await?;
        Ok(file)
    }

    pub async fn update_file(&self, file: &File) -> Result<()> {
        let id = file.id;
        let remote_order = file.remote_order;
        let hash = file.hash.clone();
        let filename = file.filename.clone();
        let mime = file.mime.clone();
        let ext = file.ext.clone();
        let thumb_ext = file.thumb_ext.clone();
        let remote_identifier = file.remote_identifier.clone();
        let metadata = json_text(&file.metadata);
        let flags = file.flags.0;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE file SET remote_order = ?1, hash = ?2, filename = ?3, mime = ?4,
                     ext = ?5, thumb_ext = ?6, remote_identifier = ?7, metadata = ?8,
                     flags = ?9, updated_time = ?10
                     WHERE id = ?11",
                    params![
                        remote_order,
                        hash,
                        filename,
                        mime,
                        ext,
                        thumb_ext,
                        remote_identifier,
                        metadata,
                        flags,
                        now_text(),
                        id
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn delete_file_row(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .call(move |conn| {
                let count = conn.execute("DELETE FROM file WHERE id = ?1", params![id])?;
                Ok(count > 0)
            })
            .await?;
        Ok(deleted)
    }

    /// Ids of the given candidates that have a file row.
    pub async fn existing_file_ids(&self, ids: Vec<i64>) -> Result<HashSet<i64>> {
        let found = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT id FROM file WHERE id = ?1")?;
                let mut found = HashSet::new();
                for id in ids {
                    if stmt.exists(params![id])? {
                        found.insert(id);
                    }
                }
                Ok(found)
            })
            .await?;
        Ok(found)
    }

    // Related operations

    pub async fn post_related(&self, post_id: i64) -> Result<Vec<Related>> {
        let related = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM related WHERE related_to_id = ?1 ORDER BY id",
                    RELATED_COLUMNS
                ))?;
                let related = stmt
                    .query_map(params![post_id], related_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(related)
            })
            .await?;
        Ok(related)
    }

    pub async fn insert_related(
        &self,
        post_id: i64,
        url: Option<&str>,
        remote_id: Option<i64>,
    ) -> Result<Related> {
        let url = url.map(str::to_string);
        let related = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO related (related_to_id, remote_id, url) VALUES (?1, ?2, ?3)",
                    params![post_id, remote_id, url],
                )?;
                Ok(Related {
                    id: conn.last_insert_rowid(),
                    related_to_id: post_id,
                    remote_id,
                    url,
                })
            })
            .await?;
        Ok(related)
    }
}
