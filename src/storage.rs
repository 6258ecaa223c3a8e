use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::db::Repository;
use crate::error::Result;
use crate::models::File;

const FILES_DIR: &str = "files";
const THUMBS_DIR: &str = "thumbs";
const STAGING_DIR: &str = "tmp";

/// On-disk layout for imported files: `<base>/files/<bucket>/<id>.<ext>`.
#[derive(Debug, Clone)]
pub struct FileStore {
    base: PathBuf,
    bucket_size: i64,
}

impl FileStore {
    pub fn new(base: impl Into<PathBuf>, bucket_size: i64) -> Self {
        Self {
            base: base.into(),
            bucket_size: bucket_size.max(1),
        }
    }

    pub fn bucket(&self, id: i64) -> i64 {
        id / self.bucket_size
    }

    pub fn file_path(&self, file: &File) -> PathBuf {
        self.entry_path(FILES_DIR, file.id, file.ext.as_deref())
    }

    pub fn thumb_path(&self, file: &File) -> PathBuf {
        self.entry_path(THUMBS_DIR, file.id, file.thumb_ext.as_deref())
    }

    fn entry_path(&self, kind: &str, id: i64, ext: Option<&str>) -> PathBuf {
        let name = match ext {
            Some(ext) if !ext.is_empty() => format!("{}.{}", id, ext),
            _ => id.to_string(),
        };
        self.base
            .join(kind)
            .join(self.bucket(id).to_string())
            .join(name)
    }

    /// Directory for partial downloads. Lives under the base path so the final
    /// move stays on one filesystem.
    pub async fn staging_dir(&self) -> Result<PathBuf> {
        let dir = self.base.join(STAGING_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Moves a staged file into its final location and syncs it to disk.
    pub async fn import(&self, file: &File, staged: &Path) -> Result<PathBuf> {
        let target = self.file_path(file);
        place(staged, &target).await?;
        debug!(file_id = file.id, path = %target.display(), "imported file");
        Ok(target)
    }

    /// Walks `files/` and `thumbs/` and reports entries that do not match a
    /// file row. With `apply`, stray entries are deleted and misplaced ones moved.
    pub async fn audit(&self, repo: &Repository, apply: bool) -> Result<AuditReport> {
        let mut report = AuditReport::default();
        let mut candidates = Vec::new();

        for kind in [FILES_DIR, THUMBS_DIR] {
            let root = self.base.join(kind);
            if !tokio::fs::try_exists(&root).await? {
                continue;
            }
            let mut buckets = tokio::fs::read_dir(&root).await?;
            while let Some(bucket) = buckets.next_entry().await? {
                let bucket_path = bucket.path();
                if !bucket.file_type().await?.is_dir() {
                    report.unknown.push(bucket_path);
                    continue;
                }
                let mut entries = tokio::fs::read_dir(&bucket_path).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    match parse_entry_name(&path) {
                        Some((id, ext)) => candidates.push(AuditEntry {
                            kind,
                            id,
                            ext,
                            path,
                        }),
                        None => report.unknown.push(path),
                    }
                }
            }
        }

        let ids = candidates.iter().map(|c| c.id).collect();
        let existing = repo.existing_file_ids(ids).await?;
        report.scanned = candidates.len();

        for candidate in candidates {
            if !existing.contains(&candidate.id) {
                report.orphaned.push(candidate.path);
                continue;
            }
            let expected = self.entry_path(candidate.kind, candidate.id, candidate.ext.as_deref());
            if expected != candidate.path {
                report.misplaced.push((candidate.path, expected));
            }
        }

        if apply {
            for path in report.unknown.iter().chain(report.orphaned.iter()) {
                info!(path = %path.display(), "removing stray entry");
                remove_entry(path).await?;
            }
            for (from, to) in &report.misplaced {
                info!(from = %from.display(), to = %to.display(), "moving misplaced file");
                place(from, to).await?;
            }
        }

        Ok(report)
    }
}

struct AuditEntry {
    kind: &'static str,
    id: i64,
    ext: Option<String>,
    path: PathBuf,
}

#[derive(Debug, Default)]
pub struct AuditReport {
    pub scanned: usize,
    /// Entries whose name is not `<id>[.<ext>]`.
    pub unknown: Vec<PathBuf>,
    /// Entries with no file row.
    pub orphaned: Vec<PathBuf>,
    /// (current, expected) locations.
    pub misplaced: Vec<(PathBuf, PathBuf)>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.unknown.is_empty() && self.orphaned.is_empty() && self.misplaced.is_empty()
    }
}

fn parse_entry_name(path: &Path) -> Option<(i64, Option<String>)> {
    let name = path.file_name()?.to_str()?;
    let (stem, ext) = match name.split_once('.') {
        Some((stem, ext)) => (stem, Some(ext.to_string())),
        None => (name, None),
    };
    let id = stem.parse().ok()?;
    Some((id, ext))
}

async fn place(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(from, to).await.is_err() {
        // cross-device
        tokio::fs::copy(from, to).await?;
        tokio::fs::remove_file(from).await?;
    }
    let handle = tokio::fs::File::open(to).await?;
    handle.sync_all().await?;
    Ok(())
}

async fn remove_entry(path: &Path) -> Result<()> {
    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

/// Removes a file if it exists. Used by compensating actions, which run synchronously.
pub fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "file already gone");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileFlags, JsonMap};
    use chrono::Utc;

    fn file(id: i64, ext: Option<&str>) -> File {
        File {
            id,
            local_id: None,
            remote_id: Some(1),
            local_order: 0,
            remote_order: 0,
            hash: None,
            filename: None,
            mime: None,
            ext: ext.map(str::to_string),
            thumb_ext: Some("jpg".into()),
            remote_identifier: None,
            metadata: JsonMap::new(),
            flags: FileFlags::default(),
            created_time: Utc::now(),
            updated_time: Utc::now(),
        }
    }

    #[test]
    fn paths_are_bucketed_by_id() {
        let store = FileStore::new("/data", 2048);
        assert_eq!(
            store.file_path(&file(4100, Some("png"))),
            PathBuf::from("/data/files/2/4100.png")
        );
        assert_eq!(
            store.file_path(&file(7, None)),
            PathBuf::from("/data/files/0/7")
        );
        assert_eq!(
            store.thumb_path(&file(2048, None)),
            PathBuf::from("/data/thumbs/1/2048.jpg")
        );
    }

    #[test]
    fn entry_names_parse_to_ids() {
        assert_eq!(
            parse_entry_name(Path::new("files/0/12.tar.gz")),
            Some((12, Some("tar.gz".into())))
        );
        assert_eq!(parse_entry_name(Path::new("files/0/12")), Some((12, None)));
        assert_eq!(parse_entry_name(Path::new("files/0/notes.txt")), None);
    }

    #[tokio::test]
    async fn import_moves_staged_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), 10);
        let staged = store.staging_dir().await.unwrap().join("part");
        tokio::fs::write(&staged, b"hello").await.unwrap();

        let target = store.import(&file(15, Some("txt")), &staged).await.unwrap();
        assert_eq!(target, dir.path().join("files/1/15.txt"));
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"hello");
        assert!(!staged.exists());
    }
}
