//! Shared fixtures: a scripted provider and a wired-up engine over the
//! in-memory store.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;

use cf_domain::config::Config;
use cf_domain::error::Result;
use cf_domain::model::Conversation;
use cf_domain::stream::{BoxStream, StreamEvent, Usage};
use cf_gateway::runtime::{CancelMap, TurnEngine};
use cf_providers::{ChatRequest, LlmProvider};
use cf_store::{MemoryStore, Store};
use cf_tools::ToolRegistry;

pub type BeforeCall = Arc<dyn Fn(usize) -> BoxFuture<'static, ()> + Send + Sync>;

/// Replays one canned event list per model call.
///
/// Once the script runs out, the last entry repeats. With `stall` set the
/// stream never ends after its events, like a model that stops sending.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Vec<StreamEvent>>>,
    last: Mutex<Vec<StreamEvent>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
    stall: bool,
    before_call: Option<BeforeCall>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            stall: false,
            before_call: None,
        }
    }

    pub fn stalling(events: Vec<StreamEvent>) -> Self {
        Self {
            stall: true,
            ..Self::new(vec![events])
        }
    }

    pub fn with_before_call(mut self, hook: BeforeCall) -> Self {
        self.before_call = Some(hook);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat_stream(&self, req: &ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(req.clone());
        if let Some(hook) = &self.before_call {
            hook(n).await;
        }

        let events = {
            let mut script = self.script.lock();
            let mut last = self.last.lock();
            if let Some(next) = script.pop_front() {
                *last = next;
            }
            last.clone()
        };

        let replay = stream::iter(events.into_iter().map(Ok));
        if self.stall {
            Ok(Box::pin(replay.chain(stream::pending())))
        } else {
            Ok(Box::pin(replay))
        }
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

// ── Event helpers ─────────────────────────────────────────────────────

pub fn token(text: &str) -> StreamEvent {
    StreamEvent::Token { text: text.into() }
}

pub fn done() -> StreamEvent {
    StreamEvent::Done {
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        finish_reason: Some("stop".into()),
    }
}

/// A complete tool call split across two argument fragments.
pub fn tool_call(call_id: &str, tool_name: &str, args: serde_json::Value) -> Vec<StreamEvent> {
    let raw = args.to_string();
    let (head, tail) = raw.split_at(raw.len() / 2);
    vec![
        StreamEvent::ToolCallStarted {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
        },
        StreamEvent::ToolCallDelta { delta: head.into() },
        StreamEvent::ToolCallDelta { delta: tail.into() },
    ]
}

pub fn level(mut events: Vec<StreamEvent>) -> Vec<StreamEvent> {
    events.push(done());
    events
}

// ── Engine fixtures ───────────────────────────────────────────────────

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<ScriptedProvider>,
    pub engine: TurnEngine,
    pub cancels: Arc<CancelMap>,
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    // Keep chunks around long enough to inspect them.
    config.engine.chunk_grace_ms = 60_000;
    config
}

pub fn harness(provider: ScriptedProvider, config: Config) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(provider);
    let cancels = Arc::new(CancelMap::new());
    let engine = TurnEngine::new(
        store.clone(),
        store.clone(),
        provider.clone(),
        ToolRegistry::builtin(),
        cancels.clone(),
        Arc::new(config),
    );
    Harness {
        store,
        provider,
        engine,
        cancels,
    }
}

pub async fn conversation(store: &MemoryStore, name: &str) -> Conversation {
    store
        .create_conversation(Conversation::new(name))
        .await
        .expect("create conversation")
}
