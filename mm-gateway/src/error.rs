use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("gateway connection closed")]
    Closed,

    #[error("echo {0} is already outstanding")]
    DuplicateEcho(String),

    #[error("{action} rejected: status={status} retcode={retcode} message={message}")]
    Rejected {
        action: &'static str,
        status: String,
        retcode: i64,
        message: String,
    },
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Write(e.to_string())
    }
}
