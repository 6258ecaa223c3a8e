use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info, warn};

use crate::db::Repository;
use crate::error::Result;
use crate::models::{File, JsonMap};
use crate::storage::{remove_if_exists, FileStore};

/// Entry point to the archive: the database location plus the file root.
#[derive(Debug, Clone)]
pub struct Store {
    db_path: String,
    files: FileStore,
}

impl Store {
    /// Opens the database, creating the schema if needed.
    pub async fn open(db_path: &str, files: FileStore) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let repo = Repository::open(db_path).await?;
        repo.migrate().await?;
        Ok(Self {
            db_path: db_path.to_string(),
            files,
        })
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    /// Starts a session on its own connection, already inside a transaction.
    pub async fn session(&self) -> Result<Session> {
        let repo = Repository::open(&self.db_path).await?;
        repo.begin().await?;
        Ok(Session {
            repo,
            files: self.files.clone(),
            pending: Vec::new(),
            credentials: Arc::default(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Commit,
    Rollback,
}

type Action = Box<dyn FnOnce() -> anyhow::Result<()> + Send + Sync>;

struct PendingAction {
    on: Resolution,
    label: String,
    action: Action,
}

type StagedCredentials = Arc<Mutex<HashMap<i64, JsonMap>>>;

fn lock(staged: &StagedCredentials) -> MutexGuard<'_, HashMap<i64, JsonMap>> {
    staged.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle adapters use to persist refreshed credentials.
///
/// Saved configs are written in their own transaction as soon as the
/// session's current transaction resolves, whichever way it resolves.
#[derive(Clone)]
pub struct CredentialWriter {
    plugin_id: i64,
    staged: StagedCredentials,
}

impl CredentialWriter {
    /// Stages the full plugin config. A later save replaces an earlier one.
    pub fn save(&self, config: JsonMap) {
        debug!(plugin_id = self.plugin_id, "staging plugin credentials");
        lock(&self.staged).insert(self.plugin_id, config);
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.staged).contains_key(&self.plugin_id)
    }
}

/// One unit of work against the store.
///
/// Database writes go to a native transaction; filesystem side effects
/// register compensating actions that run once the transaction resolves.
/// Statements execute as they are issued, so there is no separate flush step:
/// new rows get their ids immediately and stay invisible until commit.
pub struct Session {
    repo: Repository,
    files: FileStore,
    pending: Vec<PendingAction>,
    credentials: StagedCredentials,
}

impl Session {
    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    pub fn credential_writer(&self, plugin_id: i64) -> CredentialWriter {
        CredentialWriter {
            plugin_id,
            staged: Arc::clone(&self.credentials),
        }
    }

    pub fn on_commit<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push(Resolution::Commit, label.into(), Box::new(action));
    }

    pub fn on_rollback<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push(Resolution::Rollback, label.into(), Box::new(action));
    }

    fn push(&mut self, on: Resolution, label: String, action: Action) {
        self.pending.push(PendingAction { on, label, action });
    }

    pub fn pending_actions(&self) -> usize {
        self.pending.len()
    }

    /// Commits the transaction and runs the on-commit actions. If the commit
    /// itself fails the transaction is rolled back instead.
    pub async fn commit(&mut self) -> Result<()> {
        if let Err(e) = self.repo.commit().await {
            error!(error = %e, "commit failed, rolling back");
            if let Err(rb) = self.repo.rollback().await {
                error!(error = %rb, "rollback after failed commit failed");
            }
            self.resolve(Resolution::Rollback).await;
            return Err(e);
        }
        self.resolve(Resolution::Commit).await;
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        let result = self.repo.rollback().await;
        self.resolve(Resolution::Rollback).await;
        result
    }

    /// Rolls back whatever is still open. Prefer this over dropping the session.
    pub async fn close(mut self) -> Result<()> {
        self.rollback().await
    }

    async fn resolve(&mut self, outcome: Resolution) {
        run_actions(std::mem::take(&mut self.pending), outcome);
        self.write_credentials().await;
        if let Err(e) = self.repo.begin().await {
            error!(error = %e, "failed to open the next transaction");
        }
    }

    async fn write_credentials(&self) {
        let staged: Vec<(i64, JsonMap)> = lock(&self.credentials).drain().collect();
        for (plugin_id, config) in staged {
            match self.repo.update_plugin_config(plugin_id, &config).await {
                Ok(()) => info!(plugin_id, "saved plugin credentials"),
                Err(e) => error!(plugin_id, error = %e, "failed to save plugin credentials"),
            }
        }
    }

    /// Deletes a file row; its bytes are removed only once the delete commits.
    pub async fn delete_file(&mut self, file: &File) -> Result<bool> {
        if !self.repo.delete_file_row(file.id).await? {
            return Ok(false);
        }
        let paths = [self.files.file_path(file), self.files.thumb_path(file)];
        let id = file.id;
        self.on_commit(format!("remove file {}", id), move || {
            for path in &paths {
                remove_if_exists(path)?;
            }
            Ok(())
        });
        Ok(true)
    }

    /// Deletes a remote post together with the files no local post claims.
    pub async fn delete_remote_post(&mut self, id: i64) -> Result<bool> {
        for file in self.repo.post_files(id).await? {
            if file.local_id.is_none() {
                self.delete_file(&file).await?;
            }
        }
        self.repo.delete_post_row(id).await
    }
}

fn run_actions(actions: Vec<PendingAction>, outcome: Resolution) {
    for pending in actions {
        if pending.on != outcome {
            continue;
        }
        if let Err(e) = (pending.action)() {
            error!(action = %pending.label, error = %e, "compensating action failed");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.pending.iter().any(|p| p.on == Resolution::Rollback) {
            warn!("session dropped with an open transaction, running rollback actions");
        }
        run_actions(std::mem::take(&mut self.pending), Resolution::Rollback);
        if !lock(&self.credentials).is_empty() {
            warn!("session dropped with unsaved plugin credentials");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db.sqlite");
        let files = FileStore::new(dir.path().join("data"), 16);
        let store = Store::open(db.to_str().unwrap(), files).await.unwrap();
        (dir, store)
    }

    fn counter(session: &mut Session, on: Resolution, hits: &Arc<AtomicUsize>) {
        let hits = Arc::clone(hits);
        let action = move || {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        match on {
            Resolution::Commit => session.on_commit("count", action),
            Resolution::Rollback => session.on_rollback("count", action),
        }
    }

    #[test]
    fn sessions_can_move_between_tasks() {
        fn shared<T: Send + Sync>() {}
        shared::<Store>();
        shared::<Session>();
        shared::<CredentialWriter>();
    }

    #[tokio::test]
    async fn actions_run_once_for_matching_outcome() {
        let (_dir, store) = store().await;
        let mut session = store.session().await.unwrap();
        let commits = Arc::new(AtomicUsize::new(0));
        let rollbacks = Arc::new(AtomicUsize::new(0));

        counter(&mut session, Resolution::Commit, &commits);
        counter(&mut session, Resolution::Rollback, &rollbacks);
        session.commit().await.unwrap();
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert_eq!(rollbacks.load(Ordering::SeqCst), 0);
        assert_eq!(session.pending_actions(), 0);

        counter(&mut session, Resolution::Commit, &commits);
        counter(&mut session, Resolution::Rollback, &rollbacks);
        session.rollback().await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_action_does_not_mask_commit() {
        let (_dir, store) = store().await;
        let mut session = store.session().await.unwrap();
        let source = session.repo().ensure_source("example").await.unwrap();
        session.on_commit("boom", || anyhow::bail!("boom"));
        session.commit().await.unwrap();

        let other = store.session().await.unwrap();
        assert!(other
            .repo()
            .get_source(source.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn credentials_survive_rollback() {
        let (_dir, store) = store().await;
        let mut session = store.session().await.unwrap();
        let source = session.repo().ensure_source("example").await.unwrap();
        let plugin = session
            .repo()
            .insert_plugin(source.id, "example", 1, JsonMap::new())
            .await
            .unwrap();
        session.commit().await.unwrap();

        session.repo().ensure_source("discarded").await.unwrap();
        let writer = session.credential_writer(plugin.id);
        let mut config = JsonMap::new();
        config.insert("token".into(), "fresh".into());
        writer.save(config);
        assert!(writer.is_pending());
        session.rollback().await.unwrap();
        assert!(!writer.is_pending());

        let stored = session.repo().get_plugin(plugin.id).await.unwrap().unwrap();
        assert_eq!(stored.config["token"], "fresh");
        assert!(session
            .repo()
            .get_source_by_name("discarded")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn deleted_file_bytes_go_on_commit_only() {
        let (_dir, store) = store().await;
        let mut session = store.session().await.unwrap();
        let source = session.repo().ensure_source("example").await.unwrap();
        let post = session.repo().insert_post(source.id, Some("1")).await.unwrap();
        let file = session
            .repo()
            .insert_file(crate::models::NewFile {
                remote_id: post.id,
                ..Default::default()
            })
            .await
            .unwrap();
        let path = store.files().file_path(&file);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"bytes").await.unwrap();
        session.commit().await.unwrap();

        assert!(session.delete_remote_post(post.id).await.unwrap());
        session.rollback().await.unwrap();
        assert!(path.exists());

        assert!(session.delete_remote_post(post.id).await.unwrap());
        session.commit().await.unwrap();
        assert!(!path.exists());
        assert!(session.repo().get_file(file.id).await.unwrap().is_none());
    }
}
