//! memento configuration loader.
//!
//! TOML file, then `.env`, then environment overrides, then validation.

use mm_titler::Provider;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct MementoConfig {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub titles: TitlesConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    /// Receives the startup greeting and fatal startup notices.
    #[serde(default)]
    pub admin_user_id: String,
    #[serde(default = "default_greeting")]
    pub greeting: String,
    #[serde(default = "default_call_timeout_seconds")]
    pub call_timeout_seconds: u64,
}

fn default_greeting() -> String {
    "memento is online".to_string()
}

fn default_call_timeout_seconds() -> u64 {
    200
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default = "default_assets_dir")]
    pub assets_dir: String,
}

fn default_sqlite_path() -> String {
    "~/.memento/data/memento.sqlite3".to_string()
}

fn default_assets_dir() -> String {
    "~/.memento/data/pics".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            assets_dir: default_assets_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TitleProviderKind {
    Http,
    Openai,
}

impl From<TitleProviderKind> for Provider {
    fn from(kind: TitleProviderKind) -> Self {
        match kind {
            TitleProviderKind::Http => Provider::Http,
            TitleProviderKind::Openai => Provider::OpenAi,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TitlesConfig {
    #[serde(default = "default_title_provider")]
    pub provider: TitleProviderKind,
    /// Title service url (`provider = "http"`).
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_title_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_lock_ttl_seconds")]
    pub lock_ttl_seconds: u64,
    /// Group that receives workflow notices and pushed conversations.
    #[serde(default)]
    pub inform_group: String,
    #[serde(default = "default_sweep_on_startup")]
    pub sweep_on_startup: bool,
}

fn default_title_provider() -> TitleProviderKind {
    TitleProviderKind::Http
}

fn default_title_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_lock_ttl_seconds() -> u64 {
    300
}

fn default_sweep_on_startup() -> bool {
    true
}

impl Default for TitlesConfig {
    fn default() -> Self {
        Self {
            provider: default_title_provider(),
            endpoint: String::new(),
            model: default_title_model(),
            api_key: None,
            base_url: None,
            lock_ttl_seconds: default_lock_ttl_seconds(),
            inform_group: String::new(),
            sweep_on_startup: default_sweep_on_startup(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_max_forward_depth")]
    pub max_forward_depth: usize,
    #[serde(default = "default_asset_timeout_seconds")]
    pub asset_timeout_seconds: u64,
}

fn default_max_forward_depth() -> usize {
    8
}

fn default_asset_timeout_seconds() -> u64 {
    30
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_forward_depth: default_max_forward_depth(),
            asset_timeout_seconds: default_asset_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Externally reachable base url; pushed images link to `<base>/pic/<file>`.
    #[serde(default)]
    pub public_base_url: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    64
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            public_base_url: String::new(),
            timeout_seconds: default_http_timeout_seconds(),
            max_in_flight: default_http_max_in_flight(),
        }
    }
}

impl MementoConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::from_toml(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        match dotenvy::dotenv() {
            Ok(env_path) => tracing::debug!(path = %env_path.display(), ".env loaded"),
            Err(e) if e.not_found() => {}
            Err(e) => tracing::warn!(%e, ".env could not be loaded"),
        }
        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("MEMENTO_GATEWAY_URL") {
            self.gateway.url = v;
        }
        if let Some(v) = non_empty("MEMENTO_GATEWAY_TOKEN") {
            self.gateway.access_token = Some(v);
        }
        if let Some(v) = non_empty("MEMENTO_ADMIN_USER_ID") {
            self.gateway.admin_user_id = v;
        }
        if let Some(v) = non_empty("MEMENTO_INFORM_GROUP") {
            self.titles.inform_group = v;
        }
        if let Some(v) = non_empty("MEMENTO_TITLE_ENDPOINT") {
            self.titles.endpoint = v;
        }
        if let Some(v) = non_empty("MEMENTO_DB_PATH") {
            self.storage.sqlite_path = v;
        }
        if let Some(v) = non_empty("OPENAI_API_KEY") {
            self.titles.api_key = Some(v);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let url = self.gateway.url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "gateway.url must be a ws:// or wss:// url, got {url:?}"
            ));
        }
        if self.gateway.call_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("gateway.call_timeout_seconds must be > 0"));
        }
        if self.titles.lock_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("titles.lock_ttl_seconds must be > 0"));
        }
        if self.titles.inform_group.trim().is_empty() {
            return Err(anyhow::anyhow!("titles.inform_group is required"));
        }
        match self.titles.provider {
            TitleProviderKind::Http if self.titles.endpoint.trim().is_empty() => {
                return Err(anyhow::anyhow!(
                    "titles.endpoint is required when titles.provider = \"http\""
                ));
            }
            TitleProviderKind::Openai
                if self
                    .titles
                    .api_key
                    .as_deref()
                    .is_none_or(|k| k.trim().is_empty()) =>
            {
                return Err(anyhow::anyhow!(
                    "titles.api_key (or OPENAI_API_KEY) is required when titles.provider = \"openai\""
                ));
            }
            _ => {}
        }
        if self.http.timeout_seconds == 0 || self.http.max_in_flight == 0 {
            return Err(anyhow::anyhow!(
                "http.timeout_seconds and http.max_in_flight must be > 0"
            ));
        }
        if self.ingest.max_forward_depth == 0 {
            return Err(anyhow::anyhow!("ingest.max_forward_depth must be > 0"));
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.http
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("http.bind_addr {:?}: {e}", self.http.bind_addr))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.call_timeout_seconds)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.titles.lock_ttl_seconds)
    }

    /// Base for pushed image links; falls back to the bind address.
    pub fn public_base_url(&self) -> String {
        let base = self.http.public_base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return format!("http://{}", self.http.bind_addr.trim());
        }
        base.to_string()
    }

    pub fn sqlite_path(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.storage.sqlite_path)
    }

    pub fn assets_dir(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.storage.assets_dir)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".memento").join("config.toml")
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim().to_string();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen("~", &home, 1)))
}
