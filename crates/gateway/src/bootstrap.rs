//! AppState construction and background-task spawning extracted from `main.rs`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use cf_domain::config::{Config, ConfigSeverity};
use cf_providers::OpenAiCompatProvider;
use cf_store::MemoryStore;
use cf_tools::ToolRegistry;

use crate::state::AppState;

const LOCK_PRUNE_INTERVAL: Duration = Duration::from_secs(300);

/// Validate config, initialize every subsystem and return a fully-wired
/// [`AppState`].
pub fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    let errors = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    if errors > 0 {
        anyhow::bail!("config validation failed with {errors} error(s)");
    }

    // ── Store ────────────────────────────────────────────────────────
    let store = Arc::new(MemoryStore::new());
    tracing::info!("in-memory store ready");

    // ── LLM provider ─────────────────────────────────────────────────
    let provider = OpenAiCompatProvider::from_config(&config.llm)
        .context("initializing LLM provider")?;
    tracing::info!(
        provider = %config.llm.provider_id,
        base_url = %config.llm.base_url,
        model = %config.llm.default_model,
        "LLM provider ready"
    );

    // ── Tools ────────────────────────────────────────────────────────
    let tools = ToolRegistry::builtin();
    tracing::info!(count = tools.names().len(), "tool registry ready");

    Ok(AppState::new(
        config,
        store.clone(),
        store,
        Arc::new(provider),
        tools,
    ))
}

/// Spawn periodic housekeeping.
pub fn spawn_background_tasks(state: &AppState) {
    let locks = state.conversation_locks.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(LOCK_PRUNE_INTERVAL);
        tick.tick().await;
        loop {
            tick.tick().await;
            locks.prune_idle();
            tracing::debug!(tracked = locks.len(), "conversation locks pruned");
        }
    });
}
