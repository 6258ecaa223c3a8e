use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use base64::Engine;
use regex::Regex;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{AppError, Result};

/// Bytes fetched into the staging directory, not yet imported.
#[derive(Debug)]
pub struct Downloaded {
    pub path: PathBuf,
    pub filename: Option<String>,
    pub mime: Option<String>,
    pub ext: Option<String>,
    pub hash: Vec<u8>,
}

impl Downloaded {
    /// Removes the staged bytes if they were never imported.
    pub async fn discard(self) {
        remove_staged(&self.path).await;
    }
}

async fn remove_staged(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "failed to remove staged file");
    }
}

pub fn build_client(user_agent: &str) -> Result<Client> {
    let client = Client::builder()
        .timeout(Duration::from_secs(300))
        .connect_timeout(Duration::from_secs(10))
        .user_agent(user_agent)
        .cookie_store(true)
        .build()?;
    Ok(client)
}

/// Fetches file URLs (`http(s)`, `file`, `data`) into a staging directory.
#[derive(Clone)]
pub struct Downloader {
    client: Client,
}

impl Downloader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn fetch(&self, url: &str, staging: &Path) -> Result<Downloaded> {
        let parsed = Url::parse(url)
            .map_err(|e| AppError::Adapter(format!("invalid file url {}: {}", url, e)))?;

        match parsed.scheme() {
            "http" | "https" => self.fetch_http(parsed, staging).await,
            "file" => fetch_file(&parsed, staging).await,
            "data" => fetch_data(url, staging).await,
            scheme => Err(AppError::Adapter(format!(
                "unable to download file url with scheme {}: {}",
                scheme, url
            ))),
        }
    }

    async fn fetch_http(&self, url: Url, staging: &Path) -> Result<Downloaded> {
        info!(url = %url, "downloading file");
        let mut response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(AppError::from_status(response.status(), url.as_str()));
        }

        let filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_filename)
            .or_else(|| url_filename(&url));
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let path = staged_path(staging);
        let mut out = tokio::fs::File::create(&path).await?;
        let mut hasher = Sha256::new();
        let written: Result<()> = async {
            while let Some(chunk) = response.chunk().await? {
                hasher.update(&chunk);
                out.write_all(&chunk).await?;
            }
            out.flush().await?;
            out.sync_all().await?;
            Ok(())
        }
        .await;
        if let Err(e) = written {
            remove_staged(&path).await;
            return Err(e);
        }

        Ok(describe(path, filename, content_type, hasher.finalize().to_vec()))
    }
}

async fn fetch_file(url: &Url, staging: &Path) -> Result<Downloaded> {
    let source = url
        .to_file_path()
        .map_err(|_| AppError::Adapter(format!("not a local path: {}", url)))?;
    info!(path = %source.display(), "copying file");
    let bytes = tokio::fs::read(&source).await?;
    let filename = source
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string);
    write_staged(staging, &bytes, filename, None).await
}

async fn fetch_data(url: &str, staging: &Path) -> Result<Downloaded> {
    let (content_type, bytes) = decode_data_uri(url)?;
    write_staged(staging, &bytes, None, content_type).await
}

async fn write_staged(
    staging: &Path,
    bytes: &[u8],
    filename: Option<String>,
    content_type: Option<String>,
) -> Result<Downloaded> {
    let path = staged_path(staging);
    let mut out = tokio::fs::File::create(&path).await?;
    out.write_all(bytes).await?;
    out.sync_all().await?;
    let hash = Sha256::digest(bytes).to_vec();
    Ok(describe(path, filename, content_type, hash))
}

fn describe(
    path: PathBuf,
    filename: Option<String>,
    content_type: Option<String>,
    hash: Vec<u8>,
) -> Downloaded {
    let ext = filename
        .as_deref()
        .and_then(|name| Path::new(name).extension())
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .or_else(|| {
            content_type
                .as_deref()
                .and_then(|ct| mime_guess::get_mime_extensions_str(ct))
                .and_then(|exts| exts.first())
                .map(|e| e.to_string())
        });
    let mime = ext
        .as_deref()
        .and_then(|e| mime_guess::from_ext(e).first_raw())
        .map(str::to_string)
        .or(content_type);
    debug!(path = %path.display(), ?filename, ?mime, "staged file");
    Downloaded {
        path,
        filename,
        mime,
        ext,
        hash,
    }
}

fn staged_path(staging: &Path) -> PathBuf {
    staging.join(format!("{:016x}.part", rand::random::<u64>()))
}

fn disposition_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)filename\*?\s*=\s*(?:([\w-]+)'[\w-]*')?(?:"([^"]*)"|([^;\s]+))"#).ok()
    })
    .as_ref()
}

/// Extracts the filename from a `Content-Disposition` header, preferring the
/// RFC 5987 `filename*` form.
pub fn disposition_filename(header: &str) -> Option<String> {
    let mut plain = None;
    for caps in disposition_regex()?.captures_iter(header) {
        let whole = caps.get(0)?.as_str();
        let value = caps.get(2).or_else(|| caps.get(3))?.as_str();
        if whole.to_ascii_lowercase().starts_with("filename*") {
            if let Ok(decoded) = urlencoding::decode(value) {
                return sanitize(&decoded);
            }
        } else if plain.is_none() {
            plain = sanitize(value);
        }
    }
    plain
}

fn url_filename(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let decoded = urlencoding::decode(last).ok()?;
    sanitize(&decoded)
}

fn sanitize(name: &str) -> Option<String> {
    let name = name.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

/// Decodes `data:[<mediatype>][;base64],<data>`.
pub fn decode_data_uri(uri: &str) -> Result<(Option<String>, Vec<u8>)> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| AppError::Adapter("not a data uri".into()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| AppError::Adapter("data uri without payload".into()))?;

    let mut parts = header.split(';');
    let media_type = parts
        .next()
        .filter(|m| !m.is_empty())
        .map(|m| m.to_ascii_lowercase());
    let is_base64 = parts.any(|p| p.eq_ignore_ascii_case("base64"));

    let bytes = if is_base64 {
        base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| AppError::Adapter(format!("invalid base64 data uri: {}", e)))?
    } else {
        urlencoding::decode_binary(payload.as_bytes()).into_owned()
    };
    Ok((media_type, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn disposition_prefers_extended_filename() {
        assert_eq!(
            disposition_filename(r#"attachment; filename="a b.png""#).as_deref(),
            Some("a b.png")
        );
        assert_eq!(
            disposition_filename(
                r#"attachment; filename="fallback.png"; filename*=UTF-8''na%C3%AFve.png"#
            )
            .as_deref(),
            Some("naïve.png")
        );
        assert_eq!(
            disposition_filename("inline; filename=../../etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(disposition_filename("inline"), None);
    }

    #[test]
    fn data_uris_decode() {
        let (mime, bytes) = decode_data_uri("data:text/plain;base64,aGVsbG8=").unwrap();
        assert_eq!(mime.as_deref(), Some("text/plain"));
        assert_eq!(bytes, b"hello");

        let (mime, bytes) = decode_data_uri("data:,a%20b").unwrap();
        assert_eq!(mime, None);
        assert_eq!(bytes, b"a b");
    }

    #[tokio::test]
    async fn http_download_is_staged_and_hashed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/picture"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-disposition", "attachment; filename=\"cat.PNG\"")
                    .set_body_bytes(b"not really a png".to_vec()),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(build_client("test").unwrap());
        let got = downloader
            .fetch(&format!("{}/media/picture", server.uri()), dir.path())
            .await
            .unwrap();

        assert_eq!(got.filename.as_deref(), Some("cat.PNG"));
        assert_eq!(got.ext.as_deref(), Some("png"));
        assert_eq!(got.mime.as_deref(), Some("image/png"));
        assert_eq!(got.hash, Sha256::digest(b"not really a png").to_vec());
        assert_eq!(
            tokio::fs::read(&got.path).await.unwrap(),
            b"not really a png"
        );
    }

    #[tokio::test]
    async fn rate_limited_download_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(build_client("test").unwrap());
        let err = downloader
            .fetch(&format!("{}/x", server.uri()), dir.path())
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn discarded_downloads_leave_nothing_staged() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(build_client("test").unwrap());
        let got = downloader
            .fetch("data:text/plain;base64,aGVsbG8=", dir.path())
            .await
            .unwrap();
        let path = got.path.clone();
        assert!(path.exists());

        got.discard().await;
        assert!(!path.exists());
        // a second removal only logs
        remove_staged(&path).await;
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(build_client("test").unwrap());
        assert!(downloader
            .fetch("ftp://example.com/a", dir.path())
            .await
            .is_err());
    }
}
