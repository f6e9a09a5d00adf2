//! End-to-end streaming against a local SSE endpoint.
//!
//! An axum server on an ephemeral port replays a canned OpenAI-style
//! event stream; the adapter must turn it into domain `StreamEvent`s.

use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use cf_domain::config::LlmConfig;
use cf_domain::stream::StreamEvent;
use cf_domain::tool::Message;
use cf_providers::{ChatRequest, LlmProvider, OpenAiCompatProvider};
use futures_util::StreamExt;

const BODY: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"content\":\"On it\"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"rename_conversation\",\"arguments\":\"\"}}]}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"name\\\":\"}}]}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"Project X\\\"}\"}}]}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
    "data: [DONE]\n\n",
);

async fn spawn_server(status: u16) -> String {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || async move {
            if status != 200 {
                return (
                    axum::http::StatusCode::from_u16(status).unwrap(),
                    "upstream exploded",
                )
                    .into_response();
            }
            ([(header::CONTENT_TYPE, "text/event-stream")], BODY).into_response()
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/v1")
}

fn provider(base_url: String) -> OpenAiCompatProvider {
    let cfg = LlmConfig {
        base_url,
        api_key_env: String::new(),
        ..LlmConfig::default()
    };
    OpenAiCompatProvider::from_config(&cfg).unwrap()
}

#[tokio::test]
async fn streams_text_and_fragmented_tool_call() {
    let base = spawn_server(200).await;
    let p = provider(base);
    let req = ChatRequest {
        messages: vec![Message::user("alice: rename this chat to Project X")],
        ..Default::default()
    };

    let mut stream = p.chat_stream(&req).await.unwrap();
    let mut events = Vec::new();
    while let Some(ev) = stream.next().await {
        events.push(ev.unwrap());
    }

    assert!(matches!(&events[0], StreamEvent::Token { text } if text == "On it"));
    assert!(matches!(
        &events[1],
        StreamEvent::ToolCallStarted { tool_name, .. } if tool_name == "rename_conversation"
    ));
    let args: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ToolCallDelta { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(args, r#"{"name":"Project X"}"#);
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Done { finish_reason: Some(fr), .. }) if fr == "tool_calls"
    ));
}

#[tokio::test]
async fn non_success_status_is_a_provider_error() {
    let base = spawn_server(500).await;
    let p = provider(base);
    let req = ChatRequest {
        messages: vec![Message::user("hi")],
        ..Default::default()
    };
    let err = match p.chat_stream(&req).await {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    };
    let msg = err.to_string();
    assert!(msg.contains("HTTP 500"), "got: {msg}");
    assert!(msg.contains("upstream exploded"));
}
