pub mod actions;
pub mod health;
pub mod pics;
pub mod views;

use crate::store::StoreError;
use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use serde_json::{Value, json};

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(views::router())
        .merge(pics::router())
        .merge(actions::router())
}

pub(crate) type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// Whether any cause in the chain is a missing document.
pub(crate) fn is_not_found(e: &anyhow::Error) -> bool {
    e.chain()
        .any(|cause| matches!(cause.downcast_ref::<StoreError>(), Some(StoreError::NotFound { .. })))
}
