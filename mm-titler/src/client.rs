use crate::error::{Result, TitleError};
use crate::types::TitleReply;
use async_trait::async_trait;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// External title service: POST the view record, read `{success, title, error}`.
    Http,
    /// OpenAI-compatible chat completions endpoint.
    OpenAi,
}

impl FromStr for Provider {
    type Err = TitleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "openai" => Ok(Self::OpenAi),
            other => Err(TitleError::InvalidInput(format!(
                "unknown title provider {other:?} (expected \"http\" or \"openai\")"
            ))),
        }
    }
}

/// Produces a short title for an archived conversation.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// `view` is the full view record as stored (`messages`, `count`, `sender`, ...).
    async fn summarize(&self, view: &Value) -> Result<String>;
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(%e, "reqwest client build failed; falling back to default client");
            reqwest::Client::new()
        })
}

#[derive(Clone)]
pub struct HttpSummarizer {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpSummarizer {
    pub fn new(endpoint: &str) -> Result<Self> {
        Self::with_timeout(endpoint, Duration::from_secs(120))
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub fn with_timeout(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(TitleError::InvalidInput(format!(
                "title endpoint must be an http(s) url, got {endpoint:?}"
            )));
        }
        Ok(Self {
            http: http_client(timeout),
            endpoint: endpoint.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    #[tracing::instrument(level = "info", skip_all, fields(endpoint = %self.endpoint))]
    async fn summarize(&self, view: &Value) -> Result<String> {
        let response = self.http.post(&self.endpoint).json(view).send().await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(TitleError::Http(format!(
                "title service status={status} body={body}"
            )));
        }

        let reply: TitleReply = serde_json::from_str(&body)?;
        title_from_reply(reply)
    }
}

fn title_from_reply(reply: TitleReply) -> Result<String> {
    if !reply.success {
        return Err(TitleError::Rejected(
            reply
                .error
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| "no error given".to_string()),
        ));
    }
    let title = reply.title.as_deref().map(str::trim).unwrap_or_default();
    if title.is_empty() {
        return Err(TitleError::ResponseFormat(
            "title service reported success without a title".to_string(),
        ));
    }
    Ok(title.to_string())
}
