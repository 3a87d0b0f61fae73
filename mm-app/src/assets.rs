use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_FILE_NAME_CHARS: usize = 128;

#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

#[derive(Clone)]
pub struct HttpAssetFetcher {
    http: reqwest::Client,
}

impl HttpAssetFetcher {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self { http }
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(anyhow!("asset url must be http(s), got {url:?}"));
        }
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("asset fetch status={status} url={url}"));
        }
        Ok(response.bytes().await?)
    }
}

/// Flat directory of downloaded images, served back under `/pic/<name>`.
#[derive(Debug, Clone)]
pub struct AssetDir {
    root: PathBuf,
}

impl AssetDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("create asset dir {}", self.root.display()))
    }

    /// Writes `bytes` under the sanitized form of `name`; returns the stored name.
    pub async fn save(&self, name: &str, bytes: &[u8]) -> Result<String> {
        let file_name = sanitize_file_name(name)
            .ok_or_else(|| anyhow!("unusable asset file name {name:?}"))?;
        self.ensure().await?;
        let path = self.root.join(&file_name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("write asset {}", path.display()))?;
        Ok(file_name)
    }

    /// Path of a stored asset, if `name` is already in sanitized form and exists.
    pub async fn locate(&self, name: &str) -> Option<PathBuf> {
        let file_name = sanitize_file_name(name)?;
        if file_name != name {
            return None;
        }
        let path = self.root.join(file_name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(path),
            _ => None,
        }
    }
}

/// Keeps the last path component and maps anything outside `[A-Za-z0-9._-]` to `_`.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name
        .trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILE_NAME_CHARS)
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '_') {
        return None;
    }
    Some(cleaned)
}

pub fn content_type_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}
