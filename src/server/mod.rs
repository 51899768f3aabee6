//! Server surface: shared context, route table, and the serve loop.
//!
//! Three front ends share one [`AppContext`]:
//! - a JSON session API under `/api/session` and `/api/poems` ([`http`]),
//! - a chat-bridge webhook at `/chat/update` ([`chat`]),
//! - HTML pages for saved poems at `/` and `/poems/{slug}` ([`views`]).
//!
//! All of them drive the same [`PoemPipeline`] and [`PoemRepo`], so a poem
//! photographed over chat shows up on the web index the moment it is saved.

pub mod auth;
pub mod chat;
pub mod http;
pub mod views;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::PoemError;
use crate::finalize::PoemPipeline;
use crate::store::PoemRepo;

pub use auth::AllowList;

/// Shared state handed to every handler. Cloning is cheap; fields are Arcs.
#[derive(Clone)]
pub struct AppContext {
    pub pipeline: Arc<PoemPipeline>,
    pub repo: Arc<PoemRepo>,
    pub allow_list: Arc<AllowList>,
}

impl AppContext {
    pub fn new(pipeline: PoemPipeline, repo: PoemRepo, allow_list: AllowList) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            repo: Arc::new(repo),
            allow_list: Arc::new(allow_list),
        }
    }
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Build the full route table over a shared context.
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        // Web views
        .route("/", get(views::poem_index))
        .route("/poems/{slug}", get(views::poem_page))
        // Session API
        .route("/api/session/open", post(http::open_session))
        .route("/api/session/images", post(http::append_images))
        .route("/api/session/finalize", post(http::finalize_session))
        .route("/api/session/reset", post(http::reset_session))
        .route("/api/session/artifact", get(http::session_artifact))
        .route("/api/session", get(http::session_status))
        // Saved-poem API
        .route(
            "/api/poems",
            post(http::save_poem)
                .get(http::list_poems)
                .delete(http::delete_owned_poems),
        )
        .route("/api/poems/{slug}", delete(http::delete_poem))
        // Chat bridge webhook
        .route("/chat/update", post(chat::chat_update))
        // Health
        .route("/ping", get(ping))
        .fallback(views::not_found)
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve until the process is stopped.
pub async fn serve(addr: SocketAddr, ctx: AppContext) -> Result<(), PoemError> {
    let app = router(ctx);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| PoemError::Internal(format!("Failed to bind {addr}: {e}")))?;
    info!("Listening on {}", addr);
    axum::serve(listener, app)
        .await
        .map_err(|e| PoemError::Internal(format!("Server error: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::pipeline::client::testing::ScriptedModel;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_ctx(responses: Vec<Result<String, crate::error::ModelError>>) -> (AppContext, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let config = PipelineConfig::builder().build().unwrap();
        let pipeline = PoemPipeline::with_model(config, Arc::new(ScriptedModel::new(responses)));
        let repo = PoemRepo::new(dir.path().join("poems.json"));
        let ctx = AppContext::new(pipeline, repo, AllowList::from_csv("alice"));
        (ctx, dir)
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        String::from_utf8(bytes.to_vec()).expect("utf8 body")
    }

    #[tokio::test]
    async fn ping_reports_ok() {
        let (ctx, _dir) = test_ctx(vec![]);
        let response = router(ctx)
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains(r#""status":"ok""#));
    }

    #[tokio::test]
    async fn session_api_requires_the_user_header() {
        let (ctx, _dir) = test_ctx(vec![]);
        let response = router(ctx)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/session/open")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_string(response).await.contains("Missing x-user-id"));
    }

    #[tokio::test]
    async fn unlisted_user_is_refused() {
        let (ctx, _dir) = test_ctx(vec![]);
        let response = router(ctx)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/session/open")
                    .header(auth::USER_HEADER, "mallory")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(
            body_string(response)
                .await
                .contains("Unauthorized: Invalid User ID")
        );
    }

    #[tokio::test]
    async fn open_session_returns_a_fresh_view() {
        let (ctx, _dir) = test_ctx(vec![]);
        let response = router(ctx)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/session/open")
                    .header(auth::USER_HEADER, "alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains(r#""owner":"alice""#));
        assert!(body.contains(r#""state":"open""#));
        assert!(body.contains(r#""images":0"#));
    }

    #[tokio::test]
    async fn unknown_routes_serve_the_fallback_poem() {
        let (ctx, _dir) = test_ctx(vec![]);
        let response = router(ctx)
            .oneshot(
                Request::builder()
                    .uri("/no/such/page")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_string(response).await.contains("No, no, no"));
    }

    #[tokio::test]
    async fn chat_webhook_answers_in_channel() {
        let (ctx, _dir) = test_ctx(vec![]);
        let response = router(ctx)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat/update")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"user_id": "alice", "text": "/help"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("/done"));
    }
}
