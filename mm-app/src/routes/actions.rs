use crate::records::FORWARD_VIEWS;
use crate::routes::{ApiError, api_error, is_not_found};
use crate::server::AppState;
use crate::store::{Filter, StoreError};
use crate::titles::{TitleOutcome, TitleTrigger};
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
struct ActorQuery {
    #[serde(default)]
    user: Option<String>,
}

impl ActorQuery {
    fn user(&self) -> Option<String> {
        self.user
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
    }
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/rebuild_title/{id}", get(rebuild_title))
        .route("/push_to_qq/{id}", get(push_to_qq))
}

/// Starts a rename in the background; the outcome is announced in the inform group.
#[tracing::instrument(level = "info", skip_all, fields(view_id = %id))]
async fn rebuild_title(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ActorQuery>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    match state.store.find_one(FORWARD_VIEWS, Filter::id(&id)).await {
        Ok(_) => {}
        Err(StoreError::NotFound { .. }) => {
            return Err(api_error(StatusCode::NOT_FOUND, "message not found"));
        }
        Err(e) => {
            tracing::error!(%e, "view lookup failed");
            return Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to query messages",
            ));
        }
    }

    let in_progress = state.titles.in_progress(&id);
    let titles = state.titles.clone();
    let trigger = TitleTrigger::Rebuild {
        requested_by: query.user(),
    };
    let view_id = id.clone();
    tokio::spawn(async move {
        match titles.request_title(&view_id, trigger).await {
            Ok(TitleOutcome::Generated(title)) => {
                tracing::info!(view_id = %view_id, title = %title, "title rebuilt");
            }
            Ok(TitleOutcome::Busy) => {}
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), view_id = %view_id, "title rebuild failed");
            }
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "id": id, "in_progress": in_progress })),
    ))
}

#[tracing::instrument(level = "info", skip_all, fields(view_id = %id))]
async fn push_to_qq(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ActorQuery>,
) -> Result<Json<Value>, ApiError> {
    let Some(user) = query.user() else {
        return Err(api_error(StatusCode::BAD_REQUEST, "user is required"));
    };
    match state.push.push_view(&id, &user).await {
        Ok(report) => Ok(Json(json!({
            "status": "ok",
            "title": report.title,
            "messages": report.messages,
        }))),
        Err(e) if is_not_found(&e) => Err(api_error(StatusCode::NOT_FOUND, "message not found")),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "push failed");
            Err(api_error(StatusCode::BAD_GATEWAY, format!("push failed: {e:#}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::records::{
        FORWARD_MESSAGES, FORWARD_VIEWS, MESSAGE_RELATIONS, TITLE_FIELD, raw_record,
        relation_record, string_field,
    };
    use crate::routes::test_support::TestApp;
    use crate::store::{DocumentStore, Filter};
    use crate::testing::message_json;
    use axum::http::StatusCode;
    use mm_gateway::Action;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn rebuild_is_accepted_and_runs_in_background() {
        let app = TestApp::new();
        let id = app
            .store
            .insert(FORWARD_VIEWS, json!({ "messages": [], "count": 0, "title": "Old" }))
            .await
            .expect("insert");

        let (status, body) = app.get_json(&format!("/rebuild_title/{id}?user=dave")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["in_progress"], false);

        let mut title = None;
        for _ in 0..100 {
            let view = app
                .store
                .find_one(FORWARD_VIEWS, Filter::id(&id))
                .await
                .expect("view");
            title = string_field(&view, TITLE_FIELD).map(str::to_string);
            if title.as_deref() == Some("Fresh Title") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(title.as_deref(), Some("Fresh Title"));
        assert!(app
            .gateway
            .group_texts()
            .iter()
            .any(|n| n.contains("dave started renaming \"Old\"")));
    }

    #[tokio::test]
    async fn rebuild_of_unknown_view_is_404() {
        let app = TestApp::new();
        let (status, _) = app.get_json("/rebuild_title/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(app.summarizer.calls(), 0);
    }

    #[tokio::test]
    async fn push_requires_a_user() {
        let app = TestApp::new();
        let (status, body) = app.get_json("/push_to_qq/whatever").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "user is required");
        assert!(app.gateway.sent().is_empty());
    }

    #[tokio::test]
    async fn push_sends_the_archived_conversation() {
        let app = TestApp::new();
        let raw_id = app
            .store
            .insert(
                FORWARD_MESSAGES,
                raw_record(&[message_json(
                    10,
                    "bob",
                    json!([{ "type": "text", "data": { "text": "hello" } }]),
                    "hello",
                )]),
            )
            .await
            .expect("raw");
        let view_id = app
            .store
            .insert(FORWARD_VIEWS, json!({ "messages": [], "count": 1, "title": "Grape Star" }))
            .await
            .expect("view");
        app.store
            .insert(MESSAGE_RELATIONS, relation_record(&raw_id, &view_id))
            .await
            .expect("relation");

        let (status, body) = app
            .get_json(&format!("/push_to_qq/{view_id}?user=dave"))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "Grape Star");
        assert_eq!(body["messages"], 1);
        assert!(matches!(
            app.gateway.sent().first(),
            Some(Action::SendForwardMsg { .. })
        ));

        let (status, _) = app.get_json("/push_to_qq/missing?user=dave").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
