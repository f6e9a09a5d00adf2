//! Background todo processing.
//!
//! - `POST /v1/todo-lists/:id/process`  : start a run over a list
//! - `POST /v1/todo-runs/:id/cancel`    : cancel a running run

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use uuid::Uuid;

use crate::state::AppState;

use super::{api_error, domain_error};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/todo-lists/:id/process
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Deserialize)]
pub struct ProcessListBody {
    /// Keep running and pick up items added later.
    #[serde(default)]
    pub watch: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

pub async fn process_list(
    State(state): State<AppState>,
    Path(list_id): Path<Uuid>,
    body: Option<Json<ProcessListBody>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let list = match state.store.get_todo_list(list_id).await {
        Ok(Some(l)) => l,
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "todo list not found"),
        Err(e) => return domain_error(e),
    };

    let permit = match state.conversation_locks.try_acquire(list.conversation_id) {
        Ok(p) => p,
        Err(busy) => return api_error(StatusCode::CONFLICT, busy.to_string()),
    };

    let run = match state
        .todo
        .start_background(list_id, body.watch, body.timeout_secs)
        .await
    {
        Ok(r) => r,
        Err(e) => return domain_error(e),
    };
    let run_id = run.run_id;
    let conversation_id = run.conversation_id;
    tracing::info!(%run_id, %list_id, watch = body.watch, "todo run started");

    tokio::spawn(async move {
        let _permit = permit;
        match run.handle.await {
            Ok(Ok(report)) => tracing::info!(
                %run_id,
                status = ?report.status,
                completed = report.completed_tasks.len(),
                failed = report.failed_tasks.len(),
                "todo run finished"
            ),
            Ok(Err(e)) => tracing::warn!(%run_id, error = %e, "todo run failed"),
            Err(e) => tracing::error!(%run_id, error = %e, "todo run task failed"),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "run_id": run_id,
            "conversation_id": conversation_id,
        })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/todo-runs/:id/cancel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn cancel_run(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> Response {
    if !state.cancel_map.cancel(run_id) {
        return api_error(StatusCode::NOT_FOUND, "todo run not running");
    }
    tracing::info!(%run_id, "todo run cancel requested");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": run_id, "cancelled": true })),
    )
        .into_response()
}
