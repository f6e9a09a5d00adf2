use std::sync::Arc;

use cf_domain::config::Config;
use cf_providers::LlmProvider;
use cf_store::{Store, Subscriptions};
use cf_tools::ToolRegistry;

use crate::runtime::{CancelMap, ConversationLocks, TodoProcessor, TurnEngine};

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core services**: config, store, change subscriptions
/// - **Runtime**: turn engine, todo processor, cancel map, conversation locks
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub subs: Arc<dyn Subscriptions>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub engine: TurnEngine,
    pub todo: TodoProcessor,
    /// Tokens of running turns and background todo runs.
    pub cancel_map: Arc<CancelMap>,
    /// One top-level turn per conversation.
    pub conversation_locks: Arc<ConversationLocks>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        subs: Arc<dyn Subscriptions>,
        provider: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
    ) -> Self {
        let cancel_map = Arc::new(CancelMap::new());
        let engine = TurnEngine::new(
            store.clone(),
            subs.clone(),
            provider,
            tools,
            cancel_map.clone(),
            config.clone(),
        );
        Self {
            todo: TodoProcessor::new(engine.clone()),
            engine,
            config,
            store,
            subs,
            cancel_map,
            conversation_locks: Arc::new(ConversationLocks::new()),
        }
    }
}
