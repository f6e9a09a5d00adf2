use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cf_domain::error::{Error, Result};
use cf_domain::model::{EntityRef, TodoRunReport};
use cf_domain::tool::ToolDefinition;
use cf_store::Store;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Categories
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolCategory {
    /// Rename, pin, delete the conversation.
    Conversation,
    Files,
    Database,
    Todo,
}

impl ToolCategory {
    /// Conversation topic tagged after a tool of this family runs.
    pub fn topic(self) -> Option<&'static str> {
        match self {
            Self::Files => Some("files"),
            Self::Todo => Some("todo"),
            Self::Conversation | Self::Database => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a handler hands back to the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Appended to the visible reply.
    pub content: String,
    /// Fed back to the model on the next level.
    pub system_message: Option<String>,
    pub requires_reentry: bool,
    /// Action Log result summary.
    pub summary: String,
    pub entity: Option<EntityRef>,
}

impl ToolOutput {
    /// Result shown to viewers only; the model is not re-queried.
    pub fn inline(content: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            summary: summary.into(),
            ..Default::default()
        }
    }

    /// Result the model must see before continuing.
    pub fn feedback(system_message: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            system_message: Some(system_message.into()),
            requires_reentry: true,
            summary: summary.into(),
            ..Default::default()
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_entity(mut self, entity: EntityRef) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Whether the orchestrator must make another model call.
    pub fn needs_reentry(&self) -> bool {
        self.requires_reentry || self.system_message.is_some()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Todo driver seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct ProcessListRequest {
    pub list_id: Uuid,
    /// Turn whose `thinking_text` shows loop progress.
    pub turn_id: Uuid,
    pub watch: bool,
    /// Watch-mode timeout in seconds; clamped by configuration.
    pub timeout_secs: Option<u64>,
}

/// Runs the todo processing loop. Implemented by the runtime, which owns
/// the turn engine the loop drives.
#[async_trait]
pub trait TodoDriver: Send + Sync {
    async fn process_list(
        &self,
        req: ProcessListRequest,
        cancel: CancellationToken,
    ) -> Result<TodoRunReport>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct ToolContext {
    pub conversation_id: Uuid,
    pub turn_id: Uuid,
    pub store: Arc<dyn Store>,
    /// Fires when the enclosing turn is aborted.
    pub cancel: CancellationToken,
    pub todo: Option<Arc<dyn TodoDriver>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    fn category(&self) -> ToolCategory;

    /// Progress text shown while the tool runs.
    fn thinking(&self, args: &Value) -> String;

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput>;

    /// Whether `current` repeats the intent of `previous`.
    ///
    /// `None` means the tool has no predicate and every call is distinct.
    fn judge_repeat(&self, _previous: &Value, _current: &Value, _threshold: f64) -> Option<bool> {
        None
    }
}

/// Deserialize tool arguments, mapping failures to a tool error.
pub(crate) fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T> {
    serde_json::from_value(args).map_err(|e| Error::tool(tool, format!("invalid arguments: {e}")))
}

/// Read a string field for thinking text without failing.
pub(crate) fn str_field<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or("")
}
