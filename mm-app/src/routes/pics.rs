use crate::assets::content_type_for;
use crate::routes::{ApiError, api_error};
use crate::server::AppState;
use axum::Extension;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/pic/{filename}", get(get_pic))
}

#[tracing::instrument(level = "debug", skip_all, fields(filename = %filename))]
async fn get_pic(
    Extension(state): Extension<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(path) = state.assets.locate(&filename).await else {
        return Err(api_error(StatusCode::NOT_FOUND, "file not found"));
    };
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        tracing::error!(%e, path = %path.display(), "asset read failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to read file")
    })?;
    Ok(([(CONTENT_TYPE, content_type_for(&filename))], bytes))
}
