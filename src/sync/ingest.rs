use std::collections::{HashMap, HashSet};

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, info};

use crate::adapter::{FileDescription, PostDescription, RelatedDescription, TagDescription};
use crate::download::Downloader;
use crate::error::Result;
use crate::models::{File, FileFlags, NewFile, PostFlags, RemotePost};
use crate::session::Session;
use crate::storage::remove_if_exists;

/// Turns post descriptions into stored posts for one source.
pub struct Ingestor<'a> {
    session: &'a mut Session,
    downloader: &'a Downloader,
    source_id: i64,
}

/// Dedup state for the post being ingested. Dropped with the post.
struct PostContext {
    post: RemotePost,
    tag_ids: HashSet<i64>,
    related_urls: HashSet<String>,
    related_posts: HashSet<i64>,
}

impl<'a> Ingestor<'a> {
    pub fn new(session: &'a mut Session, downloader: &'a Downloader, source_id: i64) -> Self {
        Self {
            session,
            downloader,
            source_id,
        }
    }

    /// Upserts a post and everything attached to it. Any error leaves the
    /// post half-written; the caller must roll the transaction back.
    pub fn ingest(
        &mut self,
        original_id: Option<String>,
        desc: PostDescription,
    ) -> BoxFuture<'_, Result<RemotePost>> {
        async move {
            let post = self.find_or_create(original_id.as_deref(), &desc).await?;
            info!(
                source_id = self.source_id,
                original_id = ?post.original_id,
                post_id = post.id,
                "ingesting post"
            );

            let repo = self.session.repo();
            let mut ctx = PostContext {
                tag_ids: repo.post_tag_ids(post.id).await?,
                related_urls: HashSet::new(),
                related_posts: HashSet::new(),
                post,
            };
            for related in repo.post_related(ctx.post.id).await? {
                if let Some(url) = related.url {
                    ctx.related_urls.insert(url);
                }
                if let Some(remote_id) = related.remote_id {
                    ctx.related_posts.insert(remote_id);
                }
            }

            let PostDescription {
                url,
                title,
                comment,
                kind,
                post_time,
                favorite,
                hidden,
                removed,
                omit_original_id: _,
                metadata,
                tags,
                related,
                files,
            } = desc;

            ctx.post.url = url;
            ctx.post.kind = kind;
            if title.is_some() {
                ctx.post.title = title;
            }
            if comment.is_some() {
                ctx.post.comment = comment;
            }
            if post_time.is_some() {
                ctx.post.post_time = post_time;
            }
            ctx.post.flags.set(PostFlags::FAVORITE, favorite);
            ctx.post.flags.set(PostFlags::HIDDEN, hidden);
            ctx.post.flags.set(PostFlags::REMOVED, removed);
            ctx.post.metadata = metadata;
            self.session.repo().update_post(&ctx.post).await?;

            for tag in tags {
                self.add_tag(&mut ctx, tag).await?;
            }
            self.reconcile_files(&ctx.post, files).await?;
            for item in related {
                self.add_related(&mut ctx, item).await?;
            }

            Ok(ctx.post)
        }
        .boxed()
    }

    async fn find_or_create(
        &self,
        original_id: Option<&str>,
        desc: &PostDescription,
    ) -> Result<RemotePost> {
        let repo = self.session.repo();
        match original_id.filter(|_| !desc.omit_original_id) {
            Some(id) => match repo.find_post(self.source_id, id).await? {
                Some(post) => Ok(post),
                None => repo.insert_post(self.source_id, Some(id)).await,
            },
            None => repo.insert_post(self.source_id, None).await,
        }
    }

    async fn add_tag(&mut self, ctx: &mut PostContext, desc: TagDescription) -> Result<()> {
        let repo = self.session.repo();
        let mut tag = repo
            .ensure_tag(self.source_id, desc.category, &desc.tag)
            .await?;

        let mut changed = false;
        for (key, value) in desc.metadata {
            if tag.metadata.get(&key) != Some(&value) {
                tag.metadata.insert(key, value);
                changed = true;
            }
        }
        if changed {
            repo.update_tag_metadata(tag.id, &tag.metadata).await?;
        }

        if ctx.tag_ids.insert(tag.id) {
            repo.add_post_tag(ctx.post.id, tag.id).await?;
        }
        Ok(())
    }

    async fn reconcile_files(&mut self, post: &RemotePost, files: Vec<FileDescription>) -> Result<()> {
        let existing = self.session.repo().post_files(post.id).await?;
        let mut by_identifier: HashMap<String, File> = HashMap::new();
        let mut by_order: HashMap<i64, File> = HashMap::new();
        let mut unmatched: HashSet<i64> = existing.iter().map(|f| f.id).collect();
        for file in existing {
            if let Some(identifier) = file.remote_identifier.clone() {
                by_identifier.insert(identifier, file.clone());
            }
            by_order.entry(file.remote_order).or_insert(file);
        }

        for (i, desc) in files.into_iter().enumerate() {
            let order = desc.order.unwrap_or(i as i64);
            let found = match &desc.identifier {
                Some(identifier) => by_identifier.get(identifier),
                None => by_order.get(&order),
            };

            let mut file = match found {
                Some(file) if unmatched.remove(&file.id) => file.clone(),
                _ => {
                    debug!(post_id = post.id, order, "creating file");
                    self.session
                        .repo()
                        .insert_file(NewFile {
                            remote_id: post.id,
                            remote_order: order,
                            filename: desc.filename.clone(),
                            remote_identifier: desc.identifier.clone(),
                            metadata: desc.metadata.clone(),
                        })
                        .await?
                }
            };

            file.remote_order = order;
            if desc.filename.is_some() {
                file.filename = desc.filename;
            }
            if !desc.metadata.is_empty() {
                file.metadata = desc.metadata;
            }
            file.flags.set(FileFlags::REMOVED, false);

            if !file.is_present() {
                if let Some(url) = desc.url.as_deref() {
                    self.fetch_file(&mut file, url).await?;
                }
            }
            self.session.repo().update_file(&file).await?;
        }

        for id in unmatched {
            if let Some(mut file) = self.session.repo().get_file(id).await? {
                debug!(post_id = post.id, file_id = id, "file no longer reported");
                file.flags.set(FileFlags::REMOVED, true);
                self.session.repo().update_file(&file).await?;
            }
        }
        Ok(())
    }

    /// Downloads and imports a file's bytes. `present` is set only once the
    /// bytes are synced at their final path.
    async fn fetch_file(&mut self, file: &mut File, url: &str) -> Result<()> {
        info!(file_id = file.id, order = file.remote_order, url, "fetching file");
        let staging = self.session.files().staging_dir().await?;
        let downloaded = self.downloader.fetch(url, &staging).await?;

        file.ext = downloaded.ext.clone();
        file.mime = downloaded.mime.clone();
        file.hash = Some(downloaded.hash.clone());
        if file.filename.is_none() {
            file.filename = downloaded.filename.clone();
        }

        let target = match self.session.files().import(file, &downloaded.path).await {
            Ok(target) => target,
            Err(e) => {
                downloaded.discard().await;
                return Err(e);
            }
        };
        let undo = target.clone();
        self.session
            .on_rollback(format!("remove imported file {}", file.id), move || {
                remove_if_exists(&undo)?;
                Ok(())
            });

        file.flags.set(FileFlags::PRESENT, true);
        debug!(file_id = file.id, path = %target.display(), "file present");
        Ok(())
    }

    async fn add_related(&mut self, ctx: &mut PostContext, item: RelatedDescription) -> Result<()> {
        match item {
            RelatedDescription::Url(url) => {
                if ctx.related_urls.insert(url.clone()) {
                    self.session
                        .repo()
                        .insert_related(ctx.post.id, Some(&url), None)
                        .await?;
                }
            }
            RelatedDescription::Post { original_id, post } => {
                let related = self.ingest(Some(original_id), *post).await?;
                if ctx.related_posts.insert(related.id) {
                    self.session
                        .repo()
                        .insert_related(ctx.post.id, None, Some(related.id))
                        .await?;
                }
            }
        }
        Ok(())
    }
}
