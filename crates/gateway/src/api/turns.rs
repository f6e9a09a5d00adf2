//! Turn endpoints.
//!
//! - `GET  /v1/turns/:id`         : turn plus its live chunks
//! - `GET  /v1/turns/:id/events`  : SSE of turn updates and new chunks
//! - `POST /v1/turns/:id/abort`   : abort a pending turn

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_util::stream::{Stream, StreamExt};
use uuid::Uuid;

use cf_domain::model::{Turn, TurnPatch, TurnStatus};
use cf_domain::stream::BoxStream;
use cf_store::Store;

use crate::state::AppState;

use super::{api_error, domain_error};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/turns/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_turn(State(state): State<AppState>, Path(turn_id): Path<Uuid>) -> Response {
    let turn = match state.store.get_turn(turn_id).await {
        Ok(Some(t)) => t,
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "turn not found"),
        Err(e) => return domain_error(e),
    };
    let chunks = match state.store.list_chunks(turn_id).await {
        Ok(c) => c,
        Err(e) => return domain_error(e),
    };

    Json(serde_json::json!({
        "turn": turn,
        "chunks": chunks,
        "running": state.cancel_map.is_running(turn_id),
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/turns/:id/events (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn turn_events_sse(
    State(state): State<AppState>,
    Path(turn_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.store.get_turn(turn_id).await {
        Ok(Some(_)) => {}
        _ => {
            let stream = futures_util::stream::once(async {
                Ok::<_, Infallible>(
                    Event::default()
                        .event("error")
                        .data(r#"{"error":"turn not found"}"#),
                )
            });
            return Sse::new(stream)
                .keep_alive(KeepAlive::default())
                .into_response();
        }
    }

    let poll = state.config.engine.flush_interval();
    let updates = state.subs.watch_turn(turn_id);
    let stream = make_turn_event_stream(state.store.clone(), updates, turn_id, poll);

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Merge turn row updates with newly flushed chunks.
///
/// Chunks are polled at the flush cadence; the stream ends after the
/// first terminal turn update.
fn make_turn_event_stream(
    store: Arc<dyn Store>,
    mut updates: BoxStream<'static, Option<Turn>>,
    turn_id: Uuid,
    poll: std::time::Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let mut next_seq: u64 = 0;
        let mut tick = tokio::time::interval(poll);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let update = tokio::select! {
                update = updates.next() => Some(update),
                _ = tick.tick() => None,
            };

            // Drain chunks first so a terminal update is the last event.
            for chunk in new_chunks(store.as_ref(), turn_id, &mut next_seq).await {
                yield Ok(chunk);
            }

            match update {
                None => {}
                Some(Some(Some(turn))) => {
                    let data = serde_json::to_string(&turn).unwrap_or_default();
                    yield Ok(Event::default().event("turn").data(data));
                    if turn.status.is_terminal() {
                        break;
                    }
                }
                Some(_) => {
                    yield Ok(Event::default().event("error").data(r#"{"error":"turn removed"}"#));
                    break;
                }
            }
        }
    }
}

async fn new_chunks(store: &dyn Store, turn_id: Uuid, next_seq: &mut u64) -> Vec<Event> {
    let chunks = match store.list_chunks(turn_id).await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(%turn_id, error = %e, "chunk poll failed");
            return Vec::new();
        }
    };
    let mut events = Vec::new();
    for chunk in chunks {
        if chunk.seq < *next_seq {
            continue;
        }
        *next_seq = chunk.seq + 1;
        let data = serde_json::to_string(&chunk).unwrap_or_default();
        events.push(Event::default().event("chunk").data(data));
    }
    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/turns/:id/abort
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn abort_turn(State(state): State<AppState>, Path(turn_id): Path<Uuid>) -> Response {
    match state.store.get_turn(turn_id).await {
        Ok(Some(t)) if t.status.is_terminal() => {
            let status = format!("{:?}", t.status).to_lowercase();
            return api_error(StatusCode::CONFLICT, format!("turn already {status}"));
        }
        Ok(Some(_)) => {}
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "turn not found"),
        Err(e) => return domain_error(e),
    }

    // The durable status is what a running turn watches for; the token
    // short-circuits the wait.
    if let Err(e) = state
        .store
        .update_turn(turn_id, TurnPatch::status(TurnStatus::Aborted))
        .await
    {
        return domain_error(e);
    }
    let signalled = state.cancel_map.cancel(turn_id);
    tracing::info!(%turn_id, signalled, "turn aborted");

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "turn_id": turn_id, "signalled": signalled })),
    )
        .into_response()
}
