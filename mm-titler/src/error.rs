use thiserror::Error;

pub type Result<T> = std::result::Result<T, TitleError>;

#[derive(Debug, Error)]
pub enum TitleError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("summarizer rejected the request: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for TitleError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for TitleError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}
