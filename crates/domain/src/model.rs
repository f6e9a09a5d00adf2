//! Durable records shared by the store, the tools, and the runtime.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversations & messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub pinned: bool,
    /// Topic tags the agent has engaged with in this conversation
    /// (e.g. `todo`, `files`). Drives extra prompt context.
    #[serde(default)]
    pub topics: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            pinned: false,
            topics: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A message written by a human participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub author: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(conversation_id: Uuid, author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            author: author.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// One entry of conversation history as handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum HistoryEntry {
    User { author: String, content: String },
    Assistant { content: String },
}

impl HistoryEntry {
    pub fn user(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self::User {
            author: author.into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turns & token chunks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Completed,
    Failed,
    Aborted,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One assistant reply within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub status: TurnStatus,
    /// Final text. Written wholesale at finalization.
    pub content: String,
    /// Progress text shown while a tool runs; empty when idle.
    #[serde(default)]
    pub thinking_text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Turn {
    pub fn pending(conversation_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            status: TurnStatus::Pending,
            content: String::new(),
            thinking_text: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of a turn. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TurnPatch {
    pub status: Option<TurnStatus>,
    pub content: Option<String>,
    pub thinking_text: Option<String>,
}

impl TurnPatch {
    pub fn thinking(text: impl Into<String>) -> Self {
        Self {
            thinking_text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn status(status: TurnStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// An ordered fragment of in-progress reply text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenChunk {
    pub turn_id: Uuid,
    pub seq: u64,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Action log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The entity a tool call touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: String,
    pub name: String,
    pub kind: String,
}

impl EntityRef {
    pub fn new(id: impl ToString, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            name: name.into(),
            kind: kind.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: Uuid,
    pub conversation_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<Uuid>,
    pub tool_name: String,
    pub arguments: Value,
    pub result_summary: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityRef>,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Todo lists & work items
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoList {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TodoList {
    pub fn new(conversation_id: Uuid, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            title: title.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A todo entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub list_id: Uuid,
    pub task: String,
    #[serde(default)]
    pub done: bool,
    /// Ordering key within the list (ascending).
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(list_id: Uuid, task: impl Into<String>, position: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            list_id,
            task: task.into(),
            done: false,
            position,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkItemPatch {
    pub task: Option<String>,
    pub done: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoRunStatus {
    /// Every eligible item was processed (non-watch mode).
    Completed,
    /// The loop's own cancel signal or its timeout fired.
    Cancelled,
    /// The enclosing turn was aborted.
    Aborted,
}

/// Outcome of one todo-processing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoRunReport {
    pub status: TodoRunStatus,
    pub completed_tasks: Vec<String>,
    /// Items completed by someone else while they were queued.
    pub aborted_tasks: Vec<String>,
    pub failed_tasks: Vec<String>,
}

impl TodoRunReport {
    pub fn new() -> Self {
        Self {
            status: TodoRunStatus::Completed,
            completed_tasks: Vec::new(),
            aborted_tasks: Vec::new(),
            failed_tasks: Vec::new(),
        }
    }
}

impl Default for TodoRunReport {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Virtual files
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualFile {
    pub conversation_id: Uuid,
    pub path: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!TurnStatus::Pending.is_terminal());
        assert!(TurnStatus::Completed.is_terminal());
        assert!(TurnStatus::Failed.is_terminal());
        assert!(TurnStatus::Aborted.is_terminal());
    }

    #[test]
    fn turn_status_snake_case_serialization() {
        assert_eq!(serde_json::to_string(&TurnStatus::Pending).unwrap(), "\"pending\"");
        assert_eq!(serde_json::to_string(&TurnStatus::Aborted).unwrap(), "\"aborted\"");
    }

    #[test]
    fn pending_turn_starts_empty() {
        let conv = Uuid::new_v4();
        let turn = Turn::pending(conv);
        assert_eq!(turn.conversation_id, conv);
        assert_eq!(turn.status, TurnStatus::Pending);
        assert!(turn.content.is_empty());
        assert!(turn.thinking_text.is_empty());
    }

    #[test]
    fn history_entry_tagged_by_role() {
        let json = serde_json::to_value(HistoryEntry::user("alice", "hi")).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["author"], "alice");
    }

    #[test]
    fn todo_run_report_serializes_status() {
        let report = TodoRunReport::new();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "completed");
        assert!(json["aborted_tasks"].as_array().unwrap().is_empty());
    }
}
