//! The turn engine: drives one assistant reply from prompt assembly
//! through streamed generation, tool dispatch, and re-entry, and always
//! leaves the turn record in a terminal state.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use cf_domain::config::Config;
use cf_domain::error::{Error, Result};
use cf_domain::model::{HistoryEntry, TurnPatch, TurnStatus};
use cf_domain::stream::{StreamEvent, Usage};
use cf_domain::tool::{Message, ToolDefinition};
use cf_providers::{ChatRequest, LlmProvider};
use cf_store::{Store, Subscriptions};
use cf_tools::{TodoDriver, ToolCategory, ToolContext, ToolFilter, ToolHandler, ToolRegistry};

use crate::runtime::action_log::ActionLog;
use crate::runtime::assembler::{PendingCall, ToolCallAssembler};
use crate::runtime::cancel::{CancelMap, CancelScope};
use crate::runtime::duplicate::DuplicateDetector;
use crate::runtime::prompt;
use crate::runtime::sink::{schedule_chunk_purge, TokenSink};
use crate::runtime::todo::TodoProcessor;

const MAX_DEPTH_NOTICE: &str = "[maximum tool calls reached]";
const SEPARATOR: &str = "\n\n";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Input to one turn. The turn record must already exist in `pending`.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: Uuid,
    pub turn_id: Uuid,
    pub history: Vec<HistoryEntry>,
    pub filter: ToolFilter,
    /// Token of the enclosing turn when this turn is nested.
    pub parent_cancel: Option<CancellationToken>,
}

impl TurnRequest {
    pub fn new(conversation_id: Uuid, turn_id: Uuid, history: Vec<HistoryEntry>) -> Self {
        Self {
            conversation_id,
            turn_id,
            history,
            filter: ToolFilter::all(),
            parent_cancel: None,
        }
    }
}

/// What finalization wrote to the turn record.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub turn_id: Uuid,
    pub status: TurnStatus,
    pub content: String,
    pub model_calls: u32,
    pub tool_calls: u32,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-turn state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the level loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopEnd {
    Completed,
    Cancelled,
    DepthExceeded,
}

/// How one model stream ended.
enum StreamEnd {
    Finished { text: String, calls: Vec<PendingCall> },
    Cancelled,
}

/// Result of dispatching one tool call.
#[derive(Default)]
struct Dispatched {
    reentry: bool,
    system_message: Option<String>,
}

impl Dispatched {
    fn inline() -> Self {
        Self::default()
    }
}

/// Everything carried from one level to the next.
struct TurnState {
    conversation_id: Uuid,
    turn_id: Uuid,
    filter: ToolFilter,
    messages: Vec<Message>,
    sink: TokenSink,
    /// Repeats the model has already been warned about this turn.
    acknowledged: HashSet<String>,
    /// Model text at the start of a level is separated from earlier text.
    separate_next: bool,
    model_calls: u32,
    tool_calls: u32,
    usage: Usage,
}

impl TurnState {
    async fn absorb_block(&mut self, text: &str) -> Result<()> {
        if !self.sink.text().is_empty() {
            self.sink.absorb(SEPARATOR).await?;
        }
        self.sink.absorb(text).await?;
        self.separate_next = true;
        Ok(())
    }

    async fn absorb_token(&mut self, text: &str) -> Result<()> {
        if self.separate_next && !self.sink.text().is_empty() {
            self.sink.absorb(SEPARATOR).await?;
        }
        self.separate_next = false;
        self.sink.absorb(text).await
    }

    /// Carry this level's reply and tool feedback into the next request.
    fn extend_messages(&mut self, level_text: String, system_messages: Vec<String>) {
        if self.messages.last().is_some_and(Message::is_placeholder) {
            self.messages.pop();
        }
        if !level_text.is_empty() {
            self.messages.push(Message::assistant(level_text));
        }
        self.messages
            .extend(system_messages.into_iter().map(Message::system));
        self.messages.push(Message::assistant(""));
    }
}

/// Canonical key of a call for the soft duplicate guard. Object keys in
/// `serde_json::Value` are ordered, so equal arguments produce equal keys.
fn call_key(tool_name: &str, args: &Value) -> String {
    format!("{tool_name}:{args}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared, cheaply cloneable handle to everything a turn needs.
#[derive(Clone)]
pub struct TurnEngine {
    store: Arc<dyn Store>,
    subs: Arc<dyn Subscriptions>,
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    cancels: Arc<CancelMap>,
    config: Arc<Config>,
    action_log: ActionLog,
    duplicates: DuplicateDetector,
}

impl TurnEngine {
    pub fn new(
        store: Arc<dyn Store>,
        subs: Arc<dyn Subscriptions>,
        provider: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
        cancels: Arc<CancelMap>,
        config: Arc<Config>,
    ) -> Self {
        let action_log = ActionLog::new(store.clone(), &config.actions);
        let duplicates = DuplicateDetector::new(store.clone(), &config.duplicates);
        Self {
            store,
            subs,
            provider,
            tools: Arc::new(tools),
            cancels,
            config,
            action_log,
            duplicates,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn subscriptions(&self) -> &Arc<dyn Subscriptions> {
        &self.subs
    }

    pub fn cancels(&self) -> &Arc<CancelMap> {
        &self.cancels
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn action_log(&self) -> &ActionLog {
        &self.action_log
    }

    /// Run a turn to completion on the current task.
    pub async fn run_turn(&self, req: TurnRequest) -> TurnOutcome {
        let span = turn_span(&req);
        self.execute(req).instrument(span).await
    }

    /// Start a turn in the background. The handle resolves to the same
    /// outcome `run_turn` would return.
    pub fn spawn_turn(&self, req: TurnRequest) -> JoinHandle<TurnOutcome> {
        let span = turn_span(&req);
        let engine = self.clone();
        tokio::spawn(tracing::Instrument::instrument(
            async move { engine.execute(req).await },
            span,
        ))
    }

    async fn execute(&self, req: TurnRequest) -> TurnOutcome {
        tracing::debug!("turn started");
        let scope = CancelScope::open(
            req.turn_id,
            req.parent_cancel.as_ref(),
            self.cancels.clone(),
            self.store.clone(),
            self.subs.clone(),
            self.config.engine.abort_purge_delay(),
        );

        let mut st = TurnState {
            conversation_id: req.conversation_id,
            turn_id: req.turn_id,
            filter: req.filter,
            messages: Vec::new(),
            sink: TokenSink::new(self.store.clone(), req.turn_id, &self.config.engine),
            acknowledged: HashSet::new(),
            separate_next: false,
            model_calls: 0,
            tool_calls: 0,
            usage: Usage::default(),
        };

        let result = match prompt::assemble(self.store.as_ref(), req.conversation_id, &req.history)
            .await
        {
            Ok(messages) => {
                st.messages = messages;
                self.run_levels(&mut st, scope.token()).await
            }
            Err(e) => Err(e),
        };

        let outcome = self.finalize(&mut st, &scope, result).await;
        tracing::info!(
            status = ?outcome.status,
            model_calls = outcome.model_calls,
            tool_calls = outcome.tool_calls,
            "turn finished"
        );
        outcome
    }

    // ── Level loop ────────────────────────────────────────────────────

    async fn run_levels(&self, st: &mut TurnState, cancel: &CancellationToken) -> Result<LoopEnd> {
        let max_depth = self.config.engine.max_recursion_depth;
        let tool_defs: Vec<ToolDefinition> = self.tools.definitions(&st.filter);

        let mut depth: u32 = 0;
        loop {
            if depth > max_depth {
                tracing::warn!(max_depth, "recursion limit reached");
                return Ok(LoopEnd::DepthExceeded);
            }
            if cancel.is_cancelled() {
                return Ok(LoopEnd::Cancelled);
            }

            let req = ChatRequest {
                messages: st.messages.clone(),
                tools: tool_defs.clone(),
                temperature: Some(self.config.llm.temperature),
                max_tokens: self.config.llm.max_tokens,
                model: None,
            };
            st.model_calls += 1;

            let llm_span = tracing::info_span!(
                "llm.call",
                depth,
                provider = self.provider.provider_id(),
                "otel.kind" = "CLIENT",
                input_tokens = tracing::field::Empty,
                output_tokens = tracing::field::Empty,
            );
            let end = self
                .consume_stream(st, cancel, &req)
                .instrument(llm_span)
                .await?;

            let (level_text, calls) = match end {
                StreamEnd::Cancelled => return Ok(LoopEnd::Cancelled),
                StreamEnd::Finished { text, calls } => (text, calls),
            };
            if calls.is_empty() {
                return Ok(LoopEnd::Completed);
            }

            let mut reentry = false;
            let mut system_messages = Vec::new();
            for call in &calls {
                if cancel.is_cancelled() {
                    return Ok(LoopEnd::Cancelled);
                }
                let tool_span = tracing::info_span!(
                    "tool.call",
                    tool_name = %call.tool_name,
                    call_id = %call.call_id,
                );
                let dispatched = self.dispatch(st, cancel, call).instrument(tool_span).await?;
                reentry |= dispatched.reentry;
                system_messages.extend(dispatched.system_message);
            }

            if cancel.is_cancelled() {
                return Ok(LoopEnd::Cancelled);
            }
            if !reentry {
                return Ok(LoopEnd::Completed);
            }

            st.sink.flush().await?;
            st.extend_messages(level_text, system_messages);
            st.separate_next = true;
            depth += 1;
            tracing::debug!(depth, "re-entering model");
        }
    }

    async fn consume_stream(
        &self,
        st: &mut TurnState,
        cancel: &CancellationToken,
        req: &ChatRequest,
    ) -> Result<StreamEnd> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            opened = self.provider.chat_stream(req) => opened?,
        };

        let mut assembler = ToolCallAssembler::new();
        let mut text = String::new();

        loop {
            let deadline = st.sink.deadline();
            tokio::select! {
                biased;
                // Dropping `stream` on return closes the upstream request.
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    st.sink.flush().await?;
                }
                next = stream.next() => match next {
                    None => break,
                    Some(Err(e)) => return Err(e),
                    Some(Ok(StreamEvent::Token { text: fragment })) => {
                        text.push_str(&fragment);
                        st.absorb_token(&fragment).await?;
                    }
                    Some(Ok(StreamEvent::ToolCallStarted { call_id, tool_name })) => {
                        assembler.start(call_id, tool_name);
                    }
                    Some(Ok(StreamEvent::ToolCallDelta { delta })) => assembler.delta(&delta),
                    Some(Ok(StreamEvent::Done { usage, finish_reason })) => {
                        if let Some(u) = usage {
                            let span = tracing::Span::current();
                            span.record("input_tokens", u.prompt_tokens);
                            span.record("output_tokens", u.completion_tokens);
                            st.usage.add(&u);
                        }
                        tracing::debug!(finish_reason = finish_reason.as_deref().unwrap_or(""), "stream done");
                        break;
                    }
                    Some(Ok(StreamEvent::Error { message })) => {
                        return Err(Error::Provider {
                            provider: self.provider.provider_id().to_string(),
                            message,
                        });
                    }
                },
            }
        }

        Ok(StreamEnd::Finished {
            text,
            calls: assembler.finish(),
        })
    }

    // ── Tool dispatch ─────────────────────────────────────────────────

    async fn dispatch(
        &self,
        st: &mut TurnState,
        cancel: &CancellationToken,
        call: &PendingCall,
    ) -> Result<Dispatched> {
        let args: Value = if call.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(&call.arguments) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "tool call arguments are not valid JSON");
                    st.absorb_block(&format!(
                        "[{}: invalid arguments: {e}]",
                        call.tool_name
                    ))
                    .await?;
                    return Ok(Dispatched::inline());
                }
            }
        };

        let Some(handler) = self.tools.resolve(&call.tool_name, &st.filter) else {
            tracing::warn!("unsupported tool requested");
            st.absorb_block(&format!("[unsupported tool: {}]", call.tool_name))
                .await?;
            return Ok(Dispatched::inline());
        };

        let key = call_key(&call.tool_name, &args);
        if !st.acknowledged.contains(&key) {
            if let Some(warning) = self
                .duplicates
                .check(st.conversation_id, &call.tool_name, handler.as_ref(), &args)
                .await?
            {
                st.acknowledged.insert(key);
                return Ok(Dispatched {
                    reentry: true,
                    system_message: Some(warning.system_message),
                });
            }
        }

        self.run_handler(st, cancel, handler, &call.tool_name, args).await
    }

    async fn run_handler(
        &self,
        st: &mut TurnState,
        cancel: &CancellationToken,
        handler: Arc<dyn ToolHandler>,
        tool_name: &str,
        args: Value,
    ) -> Result<Dispatched> {
        self.store
            .update_turn(st.turn_id, TurnPatch::thinking(handler.thinking(&args)))
            .await?;

        let ctx = ToolContext {
            conversation_id: st.conversation_id,
            turn_id: st.turn_id,
            store: self.store.clone(),
            cancel: cancel.clone(),
            todo: st
                .filter
                .allows(ToolCategory::Todo)
                .then(|| Arc::new(TodoProcessor::new(self.clone())) as Arc<dyn TodoDriver>),
        };
        let result = handler.execute(&ctx, args.clone()).await;
        st.tool_calls += 1;

        self.store
            .update_turn(st.turn_id, TurnPatch::thinking(""))
            .await?;

        match result {
            Ok(output) => {
                self.action_log
                    .record_success(st.conversation_id, Some(st.turn_id), tool_name, &args, &output)
                    .await?;
                if let Some(topic) = handler.category().topic() {
                    if self.store.add_topic(st.conversation_id, topic).await? {
                        tracing::debug!(topic, "conversation tagged");
                    }
                }
                if !output.content.is_empty() {
                    st.absorb_block(&output.content).await?;
                }
                tracing::debug!(summary = %output.summary, "tool succeeded");
                Ok(Dispatched {
                    reentry: output.needs_reentry(),
                    system_message: output.system_message,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "tool failed");
                let message = e.to_string();
                self.action_log
                    .record_failure(st.conversation_id, Some(st.turn_id), tool_name, &args, &message)
                    .await?;
                st.absorb_block(&format!("[{tool_name} failed: {message}]"))
                    .await?;
                Ok(Dispatched::inline())
            }
        }
    }

    // ── Finalization ──────────────────────────────────────────────────

    async fn finalize(
        &self,
        st: &mut TurnState,
        scope: &CancelScope,
        result: Result<LoopEnd>,
    ) -> TurnOutcome {
        if let Err(e) = st.sink.flush().await {
            tracing::warn!(error = %e, "final chunk flush failed");
        }

        let partial = st.sink.text().to_string();
        let mut content = partial.clone();
        let mut error = None;
        let mut status = match result {
            Ok(LoopEnd::Completed) => TurnStatus::Completed,
            Ok(LoopEnd::Cancelled) => TurnStatus::Aborted,
            Ok(LoopEnd::DepthExceeded) => {
                append_block(&mut content, MAX_DEPTH_NOTICE);
                TurnStatus::Completed
            }
            Err(e) => {
                tracing::error!(error = %e, "turn failed");
                error = Some(e.to_string());
                TurnStatus::Completed
            }
        };

        if scope.is_cancelled() {
            status = TurnStatus::Aborted;
            content = partial.clone();
        } else if let Some(message) = &error {
            append_block(&mut content, &format!("Something went wrong: {message}"));
        }

        let patch = TurnPatch {
            status: Some(status),
            content: Some(content.clone()),
            thinking_text: Some(String::new()),
        };
        let written = match self.store.finalize_turn(st.turn_id, patch).await {
            Ok(turn) => Some(turn.status),
            Err(e) => {
                tracing::warn!(error = %e, "final turn write failed; retrying status only");
                match self
                    .store
                    .finalize_turn(st.turn_id, TurnPatch::status(status))
                    .await
                {
                    Ok(turn) => Some(turn.status),
                    Err(e) => {
                        tracing::error!(error = %e, "turn left without terminal status");
                        None
                    }
                }
            }
        };

        // An abort recorded before our write keeps its status; the reply
        // is stored without suffixes.
        if written == Some(TurnStatus::Aborted) && status != TurnStatus::Aborted {
            status = TurnStatus::Aborted;
            content = partial;
            let patch = TurnPatch {
                content: Some(content.clone()),
                ..Default::default()
            };
            if let Err(e) = self.store.update_turn(st.turn_id, patch).await {
                tracing::warn!(error = %e, "aborted turn content write failed");
            }
        }

        schedule_chunk_purge(
            self.store.clone(),
            st.turn_id,
            self.config.engine.chunk_grace(),
        );

        TurnOutcome {
            turn_id: st.turn_id,
            status,
            content,
            model_calls: st.model_calls,
            tool_calls: st.tool_calls,
            usage: st.usage,
            error,
        }
    }
}

fn append_block(content: &mut String, block: &str) {
    if !content.is_empty() {
        content.push_str(SEPARATOR);
    }
    content.push_str(block);
}

fn turn_span(req: &TurnRequest) -> tracing::Span {
    tracing::info_span!(
        "turn",
        turn_id = %req.turn_id,
        conversation_id = %req.conversation_id,
        nested = req.parent_cancel.is_some(),
        "otel.kind" = "SERVER",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_key_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"task":"x","list_id":"L"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"list_id":"L","task":"x"}"#).unwrap();
        assert_eq!(call_key("create_todo_item", &a), call_key("create_todo_item", &b));
    }

    #[test]
    fn block_separation() {
        let mut content = String::new();
        append_block(&mut content, "one");
        append_block(&mut content, "two");
        assert_eq!(content, "one\n\ntwo");
    }
}
