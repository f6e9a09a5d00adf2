//! Conversation endpoints.
//!
//! - `POST /v1/conversations`               : create a conversation
//! - `GET  /v1/conversations/:id`           : conversation with messages and turns
//! - `POST /v1/conversations/:id/messages`  : post a message and start a turn
//! - `GET  /v1/conversations/:id/actions`   : recent action records

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use uuid::Uuid;

use cf_domain::error::{Error, Result};
use cf_domain::model::{ChatMessage, Conversation, HistoryEntry, Turn, TurnPatch, TurnStatus};
use cf_store::Store;

use crate::runtime::TurnRequest;
use crate::state::AppState;

use super::{api_error, domain_error};

/// Most recent history entries handed to a new turn.
const HISTORY_LIMIT: usize = 50;
const MAX_ACTIONS_LIMIT: usize = 500;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/conversations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Deserialize)]
pub struct CreateConversationBody {
    #[serde(default)]
    pub name: Option<String>,
}

pub async fn create_conversation(
    State(state): State<AppState>,
    Json(body): Json<CreateConversationBody>,
) -> Response {
    let name = body
        .name
        .map(|n| n.trim().to_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "New conversation".into());

    match state.store.create_conversation(Conversation::new(name)).await {
        Ok(conv) => {
            tracing::info!(conversation_id = %conv.id, "conversation created");
            (StatusCode::CREATED, Json(conv)).into_response()
        }
        Err(e) => domain_error(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/conversations/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    let conv = match state.store.get_conversation(id).await {
        Ok(Some(c)) => c,
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "conversation not found"),
        Err(e) => return domain_error(e),
    };
    let messages = match state.store.list_messages(id).await {
        Ok(m) => m,
        Err(e) => return domain_error(e),
    };
    let turns = match state.store.list_turns(id).await {
        Ok(t) => t,
        Err(e) => return domain_error(e),
    };

    Json(serde_json::json!({
        "conversation": conv,
        "messages": messages,
        "turns": turns,
        "busy": state.conversation_locks.is_busy(id),
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/conversations/:id/messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct PostMessageBody {
    #[serde(default = "default_author")]
    pub author: String,
    pub content: String,
}

fn default_author() -> String {
    "user".into()
}

pub async fn post_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Json(body): Json<PostMessageBody>,
) -> Response {
    if body.content.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "content must not be empty");
    }
    match state.store.get_conversation(conversation_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "conversation not found"),
        Err(e) => return domain_error(e),
    }

    let permit = match state.conversation_locks.try_acquire(conversation_id) {
        Ok(p) => p,
        Err(busy) => return api_error(StatusCode::CONFLICT, busy.to_string()),
    };

    let message = ChatMessage::new(conversation_id, body.author, body.content);
    if let Err(e) = state.store.append_message(message).await {
        return domain_error(e);
    }

    let history = match load_history(state.store.as_ref(), conversation_id).await {
        Ok(h) => h,
        Err(e) => return domain_error(e),
    };

    let turn = Turn::pending(conversation_id);
    let turn_id = turn.id;
    if let Err(e) = state.store.insert_turn(turn).await {
        return domain_error(e);
    }

    let handle = state
        .engine
        .spawn_turn(TurnRequest::new(conversation_id, turn_id, history));

    // The permit lives until the turn task ends, however it ends.
    let store = state.store.clone();
    tokio::spawn(async move {
        let _permit = permit;
        if let Err(e) = handle.await {
            tracing::error!(%turn_id, error = %e, "turn task failed");
            let patch = TurnPatch {
                status: Some(TurnStatus::Completed),
                content: Some("Something went wrong: the turn stopped unexpectedly".into()),
                thinking_text: Some(String::new()),
            };
            if let Err(e) = store.update_turn(turn_id, patch).await {
                tracing::warn!(%turn_id, error = %e, "turn recovery write failed");
            }
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "turn_id": turn_id })),
    )
        .into_response()
}

/// Interleave chat messages and finished replies in creation order.
async fn load_history(store: &dyn Store, conversation_id: Uuid) -> Result<Vec<HistoryEntry>> {
    let messages = store.list_messages(conversation_id).await?;
    let turns = store.list_turns(conversation_id).await?;

    let mut timeline: Vec<(chrono::DateTime<chrono::Utc>, HistoryEntry)> = messages
        .into_iter()
        .map(|m| (m.created_at, HistoryEntry::user(m.author, m.content)))
        .collect();
    timeline.extend(
        turns
            .into_iter()
            .filter(|t| t.status.is_terminal() && !t.content.is_empty())
            .map(|t| (t.created_at, HistoryEntry::assistant(t.content))),
    );
    timeline.sort_by_key(|(at, _)| *at);

    let skip = timeline.len().saturating_sub(HISTORY_LIMIT);
    Ok(timeline.into_iter().skip(skip).map(|(_, e)| e).collect())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/conversations/:id/actions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListActionsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn list_actions(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(q): Query<ListActionsQuery>,
) -> Response {
    match state.store.get_conversation(conversation_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return domain_error(Error::not_found("conversation", conversation_id));
        }
        Err(e) => return domain_error(e),
    }

    let limit = q.limit.min(MAX_ACTIONS_LIMIT);
    match state.engine.action_log().recent(conversation_id, limit).await {
        Ok(actions) => Json(serde_json::json!({
            "actions": actions,
            "count": actions.len(),
        }))
        .into_response(),
        Err(e) => domain_error(e),
    }
}
