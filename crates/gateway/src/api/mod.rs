pub mod conversations;
pub mod health;
pub mod todo;
pub mod turns;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;

use cf_domain::error::Error;

use crate::state::AppState;

/// Build the full API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/health", get(health::health))
        // Conversations
        .route("/v1/conversations", post(conversations::create_conversation))
        .route("/v1/conversations/:id", get(conversations::get_conversation))
        .route(
            "/v1/conversations/:id/messages",
            post(conversations::post_message),
        )
        .route(
            "/v1/conversations/:id/actions",
            get(conversations::list_actions),
        )
        // Turns
        .route("/v1/turns/:id", get(turns::get_turn))
        .route("/v1/turns/:id/events", get(turns::turn_events_sse))
        .route("/v1/turns/:id/abort", post(turns::abort_turn))
        // Todo processing
        .route("/v1/todo-lists/:id/process", post(todo::process_list))
        .route("/v1/todo-runs/:id/cancel", post(todo::cancel_run))
}

// ── Error helpers ─────────────────────────────────────────────────────

pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Map a domain error onto an HTTP response.
pub(crate) fn domain_error(err: Error) -> Response {
    let status = match &err {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Tool { .. } | Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    api_error(status, err.to_string())
}
