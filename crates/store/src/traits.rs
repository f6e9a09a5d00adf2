use async_trait::async_trait;
use uuid::Uuid;

use cf_domain::error::Result;
use cf_domain::model::{
    ActionRecord, ChatMessage, Conversation, TodoList, TokenChunk, Turn, TurnPatch, VirtualFile,
    WorkItem, WorkItemPatch,
};
use cf_domain::stream::BoxStream;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Row-level access to every durable record.
///
/// Implementations must offer read-your-writes: a successful write is
/// visible to the next read from any task.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Conversations ──────────────────────────────────────────────

    async fn create_conversation(&self, conversation: Conversation) -> Result<Conversation>;
    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>>;
    async fn rename_conversation(&self, id: Uuid, name: &str) -> Result<Conversation>;
    async fn set_pinned(&self, id: Uuid, pinned: bool) -> Result<Conversation>;
    /// Removes the conversation and every row scoped to it except turns,
    /// which the engine never deletes.
    async fn delete_conversation(&self, id: Uuid) -> Result<()>;
    /// Returns `true` when the tag was newly added.
    async fn add_topic(&self, id: Uuid, topic: &str) -> Result<bool>;

    // ── Chat messages ──────────────────────────────────────────────

    async fn append_message(&self, message: ChatMessage) -> Result<()>;
    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<ChatMessage>>;

    // ── Turns ──────────────────────────────────────────────────────

    async fn insert_turn(&self, turn: Turn) -> Result<()>;
    async fn get_turn(&self, id: Uuid) -> Result<Option<Turn>>;
    async fn update_turn(&self, id: Uuid, patch: TurnPatch) -> Result<Turn>;
    /// Write the terminal state of a turn. A turn already `aborted` stays
    /// aborted; the other fields of the patch still apply.
    async fn finalize_turn(&self, id: Uuid, patch: TurnPatch) -> Result<Turn>;
    /// Turns of a conversation, oldest first.
    async fn list_turns(&self, conversation_id: Uuid) -> Result<Vec<Turn>>;

    // ── Token chunks ───────────────────────────────────────────────

    /// Rejects a chunk whose sequence number does not exceed the last one
    /// stored for the same turn.
    async fn append_chunk(&self, chunk: TokenChunk) -> Result<()>;
    /// Chunks of a turn in sequence order.
    async fn list_chunks(&self, turn_id: Uuid) -> Result<Vec<TokenChunk>>;
    /// Returns the number of chunks removed.
    async fn delete_chunks(&self, turn_id: Uuid) -> Result<usize>;

    // ── Action records ─────────────────────────────────────────────

    async fn append_action(&self, record: ActionRecord) -> Result<()>;
    /// Most recent record with the given tool name that did not fail.
    async fn latest_successful_action(
        &self,
        conversation_id: Uuid,
        tool_name: &str,
    ) -> Result<Option<ActionRecord>>;
    /// Newest first, at most `limit` records.
    async fn list_actions(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<ActionRecord>>;
    /// Drops the oldest records so at most `keep` remain. Returns the
    /// number removed.
    async fn prune_actions(&self, conversation_id: Uuid, keep: usize) -> Result<usize>;

    // ── Virtual files ──────────────────────────────────────────────

    async fn write_file(&self, conversation_id: Uuid, path: &str, content: &str)
        -> Result<VirtualFile>;
    async fn read_file(&self, conversation_id: Uuid, path: &str) -> Result<Option<VirtualFile>>;
    /// Files sorted by path.
    async fn list_files(&self, conversation_id: Uuid) -> Result<Vec<VirtualFile>>;

    // ── Todo lists ─────────────────────────────────────────────────

    async fn create_todo_list(&self, list: TodoList) -> Result<TodoList>;
    async fn get_todo_list(&self, id: Uuid) -> Result<Option<TodoList>>;
    async fn list_todo_lists(&self, conversation_id: Uuid) -> Result<Vec<TodoList>>;
    async fn rename_todo_list(&self, id: Uuid, title: &str) -> Result<TodoList>;
    /// Deletes the list together with its items.
    async fn delete_todo_list(&self, id: Uuid) -> Result<()>;

    // ── Work items ─────────────────────────────────────────────────

    /// Appends an item after the current last position.
    async fn create_work_item(&self, list_id: Uuid, task: &str) -> Result<WorkItem>;
    async fn get_work_item(&self, id: Uuid) -> Result<Option<WorkItem>>;
    /// Items of a list ordered by position.
    async fn list_work_items(&self, list_id: Uuid) -> Result<Vec<WorkItem>>;
    async fn update_work_item(&self, id: Uuid, patch: WorkItemPatch) -> Result<WorkItem>;
    async fn delete_work_item(&self, id: Uuid) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscriptions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Server-initiated push of record changes.
///
/// Every stream yields the current rows right after subscribing and again
/// after each relevant change. Dropping the stream unsubscribes.
pub trait Subscriptions: Send + Sync {
    /// `None` once the turn does not exist.
    fn watch_turn(&self, turn_id: Uuid) -> BoxStream<'static, Option<Turn>>;
    /// All items of the list ordered by position.
    fn watch_work_items(&self, list_id: Uuid) -> BoxStream<'static, Vec<WorkItem>>;
}
