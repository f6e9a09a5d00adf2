//! HTTP surface exercised in-process with `tower::ServiceExt::oneshot`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use cf_domain::config::Config;
use cf_domain::model::{Conversation, TodoList, Turn, TurnStatus};
use cf_gateway::api;
use cf_gateway::state::AppState;
use cf_store::{MemoryStore, Store};
use cf_tools::ToolRegistry;

use common::*;

fn app(provider: ScriptedProvider) -> (Router, AppState) {
    app_with(provider, test_config())
}

fn app_with(provider: ScriptedProvider, config: Config) -> (Router, AppState) {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(
        Arc::new(config),
        store.clone(),
        store,
        Arc::new(provider),
        ToolRegistry::builtin(),
    );
    (api::router().with_state(state.clone()), state)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn id_of(v: &Value) -> Uuid {
    v["id"].as_str().unwrap().parse().unwrap()
}

async fn wait_terminal(state: &AppState, turn_id: Uuid) -> Turn {
    for _ in 0..200 {
        let turn = state.store.get_turn(turn_id).await.unwrap().unwrap();
        if turn.status.is_terminal() && !state.cancel_map.is_running(turn_id) {
            return turn;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("turn {turn_id} never finished");
}

#[tokio::test]
async fn health_reports_ok() {
    let (app, _) = app(ScriptedProvider::new(Vec::new()));
    let (status, body) = send(&app, "GET", "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["running"], 0);
}

#[tokio::test]
async fn posting_a_message_runs_a_turn() {
    let (app, state) = app(ScriptedProvider::new(vec![level(vec![token("Hi Alice!")])]));

    let (status, conv) = send(&app, "POST", "/v1/conversations", Some(json!({ "name": "hello" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    let conv_id = conv["id"].as_str().unwrap().to_owned();

    let (status, body) = send(
        &app,
        "POST",
        &format!("/v1/conversations/{conv_id}/messages"),
        Some(json!({ "author": "alice", "content": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let turn_id: Uuid = body["turn_id"].as_str().unwrap().parse().unwrap();

    let turn = wait_terminal(&state, turn_id).await;
    assert_eq!(turn.status, TurnStatus::Completed);
    assert_eq!(turn.content, "Hi Alice!");

    let (status, body) = send(&app, "GET", &format!("/v1/turns/{turn_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["turn"]["status"], "completed");

    let (_, body) = send(&app, "GET", &format!("/v1/conversations/{conv_id}"), None).await;
    assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    assert_eq!(body["turns"].as_array().unwrap().len(), 1);
}

/// Split an SSE body into `(event, data)` pairs, skipping keep-alives.
fn sse_events(body: &str) -> Vec<(String, Value)> {
    body.split("\n\n")
        .filter_map(|block| {
            let mut event = None;
            let mut data = String::new();
            for line in block.lines() {
                if let Some(name) = line.strip_prefix("event:") {
                    event = Some(name.trim().to_owned());
                } else if let Some(payload) = line.strip_prefix("data:") {
                    data.push_str(payload.trim_start());
                }
            }
            let value = serde_json::from_str(&data).unwrap_or(Value::Null);
            event.map(|e| (e, value))
        })
        .collect()
}

#[tokio::test]
async fn turn_events_stream_chunks_then_ends_on_terminal_turn() {
    let mut config = test_config();
    // Every fragment becomes its own chunk.
    config.engine.flush_threshold_chars = 1;
    let script = vec![level(vec![token("Hel"), token("lo "), token("world")])];
    let (app, state) = app_with(ScriptedProvider::new(script), config);

    let conv = state
        .store
        .create_conversation(Conversation::new("sse"))
        .await
        .unwrap();
    let (status, body) = send(
        &app,
        "POST",
        &format!("/v1/conversations/{}/messages", conv.id),
        Some(json!({ "content": "greet me" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let turn_id: Uuid = body["turn_id"].as_str().unwrap().parse().unwrap();
    wait_terminal(&state, turn_id).await;

    let req = Request::builder()
        .uri(format!("/v1/turns/{turn_id}/events"))
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // The body only finishes once the stream has ended.
    let bytes = tokio::time::timeout(
        Duration::from_secs(5),
        axum::body::to_bytes(resp.into_body(), usize::MAX),
    )
    .await
    .expect("event stream ended")
    .unwrap();
    let events = sse_events(std::str::from_utf8(&bytes).unwrap());

    let (last, rest) = events.split_last().expect("events");
    assert_eq!(last.0, "turn");
    assert_eq!(last.1["status"], "completed");
    assert!(rest.iter().all(|(name, _)| name == "chunk"));

    let seqs: Vec<u64> = rest.iter().map(|(_, c)| c["seq"].as_u64().unwrap()).collect();
    assert_eq!(seqs, [1, 2, 3]);
    let text: String = rest
        .iter()
        .map(|(_, c)| c["text"].as_str().unwrap())
        .collect();
    assert_eq!(text, "Hello world");
}

#[tokio::test]
async fn turn_events_for_unknown_turn_report_an_error() {
    let (app, _) = app(ScriptedProvider::new(Vec::new()));
    let req = Request::builder()
        .uri(format!("/v1/turns/{}/events", Uuid::new_v4()))
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let events = sse_events(std::str::from_utf8(&bytes).unwrap());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "error");
    assert_eq!(events[0].1["error"], "turn not found");
}

#[tokio::test]
async fn busy_conversation_rejects_a_second_message() {
    let (app, state) = app(ScriptedProvider::new(Vec::new()));
    let conv = state
        .store
        .create_conversation(Conversation::new("busy"))
        .await
        .unwrap();
    let _held = state.conversation_locks.try_acquire(conv.id).unwrap();

    let (status, body) = send(
        &app,
        "POST",
        &format!("/v1/conversations/{}/messages", conv.id),
        Some(json!({ "content": "anyone?" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("busy"));
    assert!(state.store.list_messages(conv.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let (app, _) = app(ScriptedProvider::new(Vec::new()));
    let ghost = Uuid::new_v4();

    let (status, _) = send(&app, "GET", &format!("/v1/conversations/{ghost}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "POST", &format!("/v1/turns/{ghost}/abort"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "POST", &format!("/v1/todo-runs/{ghost}/cancel"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, body) = send(
        &app,
        "POST",
        &format!("/v1/todo-lists/{ghost}/process"),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn aborting_a_finished_turn_conflicts() {
    let (app, state) = app(ScriptedProvider::new(vec![level(vec![token("done")])]));
    let (_, conv) = send(&app, "POST", "/v1/conversations", Some(json!({}))).await;
    let conv_id = conv["id"].as_str().unwrap().to_owned();
    assert_eq!(conv["name"], "New conversation");

    let (_, body) = send(
        &app,
        "POST",
        &format!("/v1/conversations/{conv_id}/messages"),
        Some(json!({ "content": "go" })),
    )
    .await;
    let turn_id: Uuid = body["turn_id"].as_str().unwrap().parse().unwrap();
    wait_terminal(&state, turn_id).await;

    let (status, _) = send(&app, "POST", &format!("/v1/turns/{turn_id}/abort"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn aborting_a_running_turn_marks_it_aborted() {
    let (app, state) = app(ScriptedProvider::stalling(vec![token("Once upon")]));
    let (_, conv) = send(&app, "POST", "/v1/conversations", Some(json!({ "name": "story" }))).await;
    let conv_id = conv["id"].as_str().unwrap().to_owned();

    let (_, body) = send(
        &app,
        "POST",
        &format!("/v1/conversations/{conv_id}/messages"),
        Some(json!({ "content": "tell me a story" })),
    )
    .await;
    let turn_id: Uuid = body["turn_id"].as_str().unwrap().parse().unwrap();

    let (status, _) = send(&app, "POST", &format!("/v1/turns/{turn_id}/abort"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let turn = wait_terminal(&state, turn_id).await;
    assert_eq!(turn.status, TurnStatus::Aborted);

    // The conversation lock is released once the turn task ends.
    for _ in 0..100 {
        if !state.conversation_locks.is_busy(id_of(&conv)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!state.conversation_locks.is_busy(id_of(&conv)));
}

#[tokio::test]
async fn todo_run_starts_and_lists_actions() {
    let (app, state) = app(ScriptedProvider::new(vec![level(vec![token("Done it.")])]));
    let (_, conv) = send(&app, "POST", "/v1/conversations", Some(json!({ "name": "chores" }))).await;
    let conv_id = id_of(&conv);
    let list = state
        .store
        .create_todo_list(TodoList::new(conv_id, "Chores"))
        .await
        .unwrap();
    state.store.create_work_item(list.id, "Sweep").await.unwrap();

    let (status, body) = send(
        &app,
        "POST",
        &format!("/v1/todo-lists/{}/process", list.id),
        Some(json!({ "watch": false })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id: Uuid = body["run_id"].as_str().unwrap().parse().unwrap();

    let host = wait_terminal(&state, run_id).await;
    assert_eq!(host.status, TurnStatus::Completed);
    assert!(host.content.contains("Sweep"));

    let (status, body) = send(&app, "GET", &format!("/v1/conversations/{conv_id}/actions"), None).await;
    assert_eq!(status, StatusCode::OK);
    let actions = body["actions"].as_array().unwrap();
    assert!(actions.iter().any(|a| a["tool_name"] == "process_todo_item"));
}
