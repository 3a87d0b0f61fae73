use crate::records::{FORWARD_VIEWS, ListEntry, list_entries};
use crate::routes::{ApiError, api_error};
use crate::server::AppState;
use crate::store::{Filter, StoreError};
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use serde_json::Value;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/message_list", get(list_views))
        .route("/messages/{id}", get(get_view))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_views(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<ListEntry>>, ApiError> {
    let views = state
        .store
        .find_many(FORWARD_VIEWS, Filter::All)
        .await
        .map_err(|e| {
            tracing::error!(%e, "view listing failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to query messages")
        })?;
    Ok(Json(list_entries(&views)))
}

#[tracing::instrument(level = "debug", skip_all, fields(view_id = %id))]
async fn get_view(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.store.find_one(FORWARD_VIEWS, Filter::id(&id)).await {
        Ok(view) => Ok(Json(view)),
        Err(StoreError::NotFound { .. }) => {
            Err(api_error(StatusCode::NOT_FOUND, "message not found"))
        }
        Err(e) => {
            tracing::error!(%e, "view lookup failed");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to query messages",
            ))
        }
    }
}
