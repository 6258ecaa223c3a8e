use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use url::Url;

use super::{
    str_option, AdapterContext, AdapterFactory, CursorEntry, Direction, FileDescription,
    PostDescription, QueryProbe, RemoteCursor, ResumePoint, SourceAdapter, UrlMatch, VecCursor,
};
use crate::error::{AppError, Result};
use crate::models::{JsonMap, PostKind};

pub const PLUGIN_ID: &str = "filesystem";
const PATH_KEY: &str = "path";
const PAGE_SIZE: usize = 50;

/// Local files. Posts are synthetic and stored without an original id.
pub struct FilesystemFactory;

impl AdapterFactory for FilesystemFactory {
    fn id(&self) -> &str {
        PLUGIN_ID
    }

    fn source(&self) -> &str {
        "filesystem"
    }

    fn create(&self, _ctx: AdapterContext) -> Result<Box<dyn SourceAdapter>> {
        Ok(Box::new(FilesystemAdapter))
    }
}

pub struct FilesystemAdapter;

fn local_path(url: &str) -> Option<PathBuf> {
    if let Ok(parsed) = Url::parse(url) {
        if parsed.scheme() == "file" {
            return parsed.to_file_path().ok();
        }
    }
    let path = PathBuf::from(url);
    path.is_absolute().then_some(path)
}

fn query_path(query: &JsonMap) -> Result<PathBuf> {
    str_option(query, PATH_KEY)
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .ok_or_else(|| AppError::Adapter("filesystem query needs an absolute path".into()))
}

/// Orders names with embedded numbers numerically, so `2.png` sorts before `10.png`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();
    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let take = |it: &mut std::iter::Peekable<std::str::Chars>| {
                    let mut digits = String::new();
                    while let Some(c) = it.peek().copied().filter(char::is_ascii_digit) {
                        digits.push(c);
                        it.next();
                    }
                    digits
                };
                let (x, y) = (take(&mut a), take(&mut b));
                let (xs, ys) = (x.trim_start_matches('0'), y.trim_start_matches('0'));
                let ord = xs.len().cmp(&ys.len()).then_with(|| xs.cmp(ys));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                let ord = x.to_lowercase().cmp(y.to_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                a.next();
                b.next();
            }
        }
    }
}

async fn modified_millis(path: &Path) -> Result<i64> {
    let modified = tokio::fs::metadata(path).await?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0))
}

/// All regular files under `root`, in natural order per directory.
async fn walk(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut children = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            children.push((entry.path(), entry.file_type().await?));
        }
        children.sort_by(|(a, _), (b, _)| {
            natural_cmp(&a.to_string_lossy(), &b.to_string_lossy())
        });
        for (path, kind) in children {
            if kind.is_dir() {
                pending.push(path);
            } else if kind.is_file() {
                files.push(path);
            }
        }
    }
    Ok(files)
}

#[async_trait]
impl SourceAdapter for FilesystemAdapter {
    fn parse_url(&self, url: &str) -> Option<UrlMatch> {
        let path = local_path(url)?;
        if path.is_dir() {
            let mut query = JsonMap::new();
            query.insert(PATH_KEY.into(), Value::from(path.to_string_lossy().into_owned()));
            Some(UrlMatch::Query(query))
        } else {
            Some(UrlMatch::Post(path.to_string_lossy().into_owned()))
        }
    }

    async fn download(&self, original_id: &str, _payload: Option<&Value>) -> Result<PostDescription> {
        let path = local_path(original_id)
            .ok_or_else(|| AppError::Adapter(format!("not an absolute path: {}", original_id)))?;
        let url = Url::from_file_path(&path)
            .map_err(|_| AppError::Adapter(format!("not an absolute path: {}", original_id)))?;
        let millis = modified_millis(&path).await?;

        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string);

        Ok(PostDescription {
            title: filename.clone(),
            kind: PostKind::Set,
            post_time: DateTime::<Utc>::from_timestamp_millis(millis),
            omit_original_id: true,
            files: vec![FileDescription {
                url: Some(url.to_string()),
                order: Some(0),
                filename,
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    async fn iterate_query(
        &self,
        query: &JsonMap,
        _direction: Direction,
        _resume: ResumePoint,
    ) -> Result<Box<dyn RemoteCursor>> {
        let root = query_path(query)?;
        let mut entries = Vec::new();
        for path in walk(&root).await? {
            let millis = modified_millis(&path).await?;
            entries.push(CursorEntry::new(millis, path.to_string_lossy().into_owned()));
        }
        // stable, so equal timestamps keep the natural order
        entries.sort_by(|a, b| b.sort_key.cmp(&a.sort_key));
        Ok(Box::new(VecCursor::paged(entries, PAGE_SIZE)))
    }

    async fn probe_query(&self, query: &JsonMap) -> Result<Option<QueryProbe>> {
        let root = query_path(query)?;
        if !tokio::fs::metadata(&root).await?.is_dir() {
            return Ok(None);
        }
        let canonical = tokio::fs::canonicalize(&root).await?;
        let mut metadata = JsonMap::new();
        metadata.insert(
            PATH_KEY.into(),
            Value::from(canonical.to_string_lossy().into_owned()),
        );
        Ok(Some(QueryProbe {
            repr: format!("dir:{}", canonical.display()),
            metadata,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_order_compares_numbers() {
        let mut names = vec!["img10.png", "img2.png", "Img1.png", "a.png"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["a.png", "Img1.png", "img2.png", "img10.png"]);
    }

    #[tokio::test]
    async fn directory_walk_yields_every_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("nested")).await.unwrap();
        tokio::fs::write(dir.path().join("1.txt"), b"a").await.unwrap();
        tokio::fs::write(dir.path().join("nested/2.txt"), b"b").await.unwrap();

        let adapter = FilesystemAdapter;
        let Some(UrlMatch::Query(query)) = adapter.parse_url(dir.path().to_str().unwrap()) else {
            panic!("directory should parse as a query");
        };
        let mut cursor = adapter
            .iterate_query(&query, Direction::Newer, ResumePoint::default())
            .await
            .unwrap();
        let page = cursor.next_page().await.unwrap().unwrap();
        assert_eq!(page.len(), 2);

        let post = adapter
            .download(page[0].original_id.as_deref().unwrap(), None)
            .await
            .unwrap();
        assert!(post.omit_original_id);
        assert!(post.files[0].url.as_deref().unwrap().starts_with("file://"));

        let probe = adapter.probe_query(&query).await.unwrap().unwrap();
        assert!(probe.repr.starts_with("dir:"));
    }
}
