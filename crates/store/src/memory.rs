//! In-memory implementation of [`Store`] and [`Subscriptions`].
//!
//! All tables live behind one `parking_lot::RwLock`; no guard is held
//! across an `.await`. Every write publishes a [`Change`] on a broadcast
//! channel, and watch streams re-query their rows when a matching change
//! arrives (or when they lag behind the channel).

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use cf_domain::error::{Error, Result};
use cf_domain::model::{
    ActionRecord, ChatMessage, Conversation, TodoList, TokenChunk, Turn, TurnPatch, TurnStatus,
    VirtualFile, WorkItem, WorkItemPatch,
};
use cf_domain::stream::BoxStream;

use crate::traits::{Store, Subscriptions};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Change feed
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A record that changed. Carries only the key; subscribers re-read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Conversation(Uuid),
    Turn(Uuid),
    Chunks(Uuid),
    /// Any item of the given list (including list deletion).
    WorkItems(Uuid),
    Actions(Uuid),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tables
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct Tables {
    conversations: HashMap<Uuid, Conversation>,
    messages: HashMap<Uuid, Vec<ChatMessage>>,
    turns: HashMap<Uuid, Turn>,
    /// Turn ids per conversation in insertion order.
    turn_order: HashMap<Uuid, Vec<Uuid>>,
    chunks: HashMap<Uuid, Vec<TokenChunk>>,
    /// Oldest first.
    actions: HashMap<Uuid, VecDeque<ActionRecord>>,
    files: HashMap<Uuid, BTreeMap<String, VirtualFile>>,
    todo_lists: HashMap<Uuid, TodoList>,
    work_items: HashMap<Uuid, WorkItem>,
    list_items: HashMap<Uuid, BTreeSet<Uuid>>,
}

impl Tables {
    fn items_of(&self, list_id: Uuid) -> Vec<WorkItem> {
        let mut items: Vec<WorkItem> = self
            .list_items
            .get(&list_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.work_items.get(id).cloned())
            .collect();
        items.sort_by_key(|i| (i.position, i.created_at));
        items
    }

    fn conversation_mut(&mut self, id: Uuid) -> Result<&mut Conversation> {
        self.conversations
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("conversation", id))
    }

    fn remove_list(&mut self, list_id: Uuid) {
        self.todo_lists.remove(&list_id);
        if let Some(ids) = self.list_items.remove(&list_id) {
            for id in ids {
                self.work_items.remove(&id);
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MemoryStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    changes: broadcast::Sender<Change>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            changes,
        }
    }

    /// Subscribe to the raw change feed.
    pub fn changes(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }

    fn publish(&self, change: Change) {
        // No receivers is fine.
        let _ = self.changes.send(change);
    }

    /// Apply `patch` under a single write guard. With `keep_abort` an
    /// `aborted` status on the record wins over the patch's status.
    fn patch_turn(&self, id: Uuid, patch: TurnPatch, keep_abort: bool) -> Result<Turn> {
        let turn = {
            let mut tables = self.tables.write();
            let turn = tables
                .turns
                .get_mut(&id)
                .ok_or_else(|| Error::not_found("turn", id))?;
            if let Some(status) = patch.status {
                if !(keep_abort && turn.status == TurnStatus::Aborted) {
                    turn.status = status;
                }
            }
            if let Some(content) = patch.content {
                turn.content = content;
            }
            if let Some(thinking) = patch.thinking_text {
                turn.thinking_text = thinking;
            }
            turn.updated_at = Utc::now();
            turn.clone()
        };
        self.publish(Change::Turn(id));
        Ok(turn)
    }

    fn snapshot_turn(&self, id: Uuid) -> Option<Turn> {
        self.tables.read().turns.get(&id).cloned()
    }

    fn snapshot_items(&self, list_id: Uuid) -> Vec<WorkItem> {
        self.tables.read().items_of(list_id)
    }
}

#[async_trait]
impl Store for MemoryStore {
    // ── Conversations ──────────────────────────────────────────────

    async fn create_conversation(&self, conversation: Conversation) -> Result<Conversation> {
        let id = conversation.id;
        self.tables
            .write()
            .conversations
            .insert(id, conversation.clone());
        self.publish(Change::Conversation(id));
        Ok(conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.tables.read().conversations.get(&id).cloned())
    }

    async fn rename_conversation(&self, id: Uuid, name: &str) -> Result<Conversation> {
        let conv = {
            let mut tables = self.tables.write();
            let conv = tables.conversation_mut(id)?;
            conv.name = name.to_string();
            conv.updated_at = Utc::now();
            conv.clone()
        };
        self.publish(Change::Conversation(id));
        Ok(conv)
    }

    async fn set_pinned(&self, id: Uuid, pinned: bool) -> Result<Conversation> {
        let conv = {
            let mut tables = self.tables.write();
            let conv = tables.conversation_mut(id)?;
            conv.pinned = pinned;
            conv.updated_at = Utc::now();
            conv.clone()
        };
        self.publish(Change::Conversation(id));
        Ok(conv)
    }

    async fn delete_conversation(&self, id: Uuid) -> Result<()> {
        let lists: Vec<Uuid> = {
            let mut tables = self.tables.write();
            if tables.conversations.remove(&id).is_none() {
                return Err(Error::not_found("conversation", id));
            }
            tables.messages.remove(&id);
            tables.actions.remove(&id);
            tables.files.remove(&id);
            let lists: Vec<Uuid> = tables
                .todo_lists
                .values()
                .filter(|l| l.conversation_id == id)
                .map(|l| l.id)
                .collect();
            for list_id in &lists {
                tables.remove_list(*list_id);
            }
            lists
        };
        self.publish(Change::Conversation(id));
        for list_id in lists {
            self.publish(Change::WorkItems(list_id));
        }
        Ok(())
    }

    async fn add_topic(&self, id: Uuid, topic: &str) -> Result<bool> {
        let added = {
            let mut tables = self.tables.write();
            let conv = tables.conversation_mut(id)?;
            let added = conv.topics.insert(topic.to_string());
            if added {
                conv.updated_at = Utc::now();
            }
            added
        };
        if added {
            self.publish(Change::Conversation(id));
        }
        Ok(added)
    }

    // ── Chat messages ──────────────────────────────────────────────

    async fn append_message(&self, message: ChatMessage) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.conversations.contains_key(&message.conversation_id) {
            return Err(Error::not_found("conversation", message.conversation_id));
        }
        tables
            .messages
            .entry(message.conversation_id)
            .or_default()
            .push(message);
        Ok(())
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<ChatMessage>> {
        Ok(self
            .tables
            .read()
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    // ── Turns ──────────────────────────────────────────────────────

    async fn insert_turn(&self, turn: Turn) -> Result<()> {
        let id = turn.id;
        {
            let mut tables = self.tables.write();
            tables
                .turn_order
                .entry(turn.conversation_id)
                .or_default()
                .push(id);
            tables.turns.insert(id, turn);
        }
        self.publish(Change::Turn(id));
        Ok(())
    }

    async fn get_turn(&self, id: Uuid) -> Result<Option<Turn>> {
        Ok(self.snapshot_turn(id))
    }

    async fn update_turn(&self, id: Uuid, patch: TurnPatch) -> Result<Turn> {
        self.patch_turn(id, patch, false)
    }

    async fn finalize_turn(&self, id: Uuid, patch: TurnPatch) -> Result<Turn> {
        self.patch_turn(id, patch, true)
    }

    async fn list_turns(&self, conversation_id: Uuid) -> Result<Vec<Turn>> {
        let tables = self.tables.read();
        Ok(tables
            .turn_order
            .get(&conversation_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.turns.get(id).cloned())
            .collect())
    }

    // ── Token chunks ───────────────────────────────────────────────

    async fn append_chunk(&self, chunk: TokenChunk) -> Result<()> {
        let turn_id = chunk.turn_id;
        {
            let mut tables = self.tables.write();
            let chunks = tables.chunks.entry(turn_id).or_default();
            if let Some(last) = chunks.last() {
                if chunk.seq <= last.seq {
                    return Err(Error::Store(format!(
                        "chunk seq {} for turn {turn_id} does not follow {}",
                        chunk.seq, last.seq
                    )));
                }
            }
            chunks.push(chunk);
        }
        self.publish(Change::Chunks(turn_id));
        Ok(())
    }

    async fn list_chunks(&self, turn_id: Uuid) -> Result<Vec<TokenChunk>> {
        Ok(self
            .tables
            .read()
            .chunks
            .get(&turn_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_chunks(&self, turn_id: Uuid) -> Result<usize> {
        let removed = self
            .tables
            .write()
            .chunks
            .remove(&turn_id)
            .map(|c| c.len())
            .unwrap_or(0);
        if removed > 0 {
            self.publish(Change::Chunks(turn_id));
        }
        Ok(removed)
    }

    // ── Action records ─────────────────────────────────────────────

    async fn append_action(&self, record: ActionRecord) -> Result<()> {
        let conv = record.conversation_id;
        self.tables
            .write()
            .actions
            .entry(conv)
            .or_default()
            .push_back(record);
        self.publish(Change::Actions(conv));
        Ok(())
    }

    async fn latest_successful_action(
        &self,
        conversation_id: Uuid,
        tool_name: &str,
    ) -> Result<Option<ActionRecord>> {
        let tables = self.tables.read();
        Ok(tables.actions.get(&conversation_id).and_then(|records| {
            records
                .iter()
                .rev()
                .find(|r| r.tool_name == tool_name && !r.is_error)
                .cloned()
        }))
    }

    async fn list_actions(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<ActionRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .actions
            .get(&conversation_id)
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn prune_actions(&self, conversation_id: Uuid, keep: usize) -> Result<usize> {
        let mut tables = self.tables.write();
        let Some(records) = tables.actions.get_mut(&conversation_id) else {
            return Ok(0);
        };
        let excess = records.len().saturating_sub(keep);
        records.drain(..excess);
        Ok(excess)
    }

    // ── Virtual files ──────────────────────────────────────────────

    async fn write_file(
        &self,
        conversation_id: Uuid,
        path: &str,
        content: &str,
    ) -> Result<VirtualFile> {
        let file = VirtualFile {
            conversation_id,
            path: path.to_string(),
            content: content.to_string(),
            updated_at: Utc::now(),
        };
        let mut tables = self.tables.write();
        if !tables.conversations.contains_key(&conversation_id) {
            return Err(Error::not_found("conversation", conversation_id));
        }
        tables
            .files
            .entry(conversation_id)
            .or_default()
            .insert(file.path.clone(), file.clone());
        Ok(file)
    }

    async fn read_file(&self, conversation_id: Uuid, path: &str) -> Result<Option<VirtualFile>> {
        Ok(self
            .tables
            .read()
            .files
            .get(&conversation_id)
            .and_then(|files| files.get(path).cloned()))
    }

    async fn list_files(&self, conversation_id: Uuid) -> Result<Vec<VirtualFile>> {
        Ok(self
            .tables
            .read()
            .files
            .get(&conversation_id)
            .map(|files| files.values().cloned().collect())
            .unwrap_or_default())
    }

    // ── Todo lists ─────────────────────────────────────────────────

    async fn create_todo_list(&self, list: TodoList) -> Result<TodoList> {
        let mut tables = self.tables.write();
        if !tables.conversations.contains_key(&list.conversation_id) {
            return Err(Error::not_found("conversation", list.conversation_id));
        }
        tables.list_items.entry(list.id).or_default();
        tables.todo_lists.insert(list.id, list.clone());
        Ok(list)
    }

    async fn get_todo_list(&self, id: Uuid) -> Result<Option<TodoList>> {
        Ok(self.tables.read().todo_lists.get(&id).cloned())
    }

    async fn list_todo_lists(&self, conversation_id: Uuid) -> Result<Vec<TodoList>> {
        let mut lists: Vec<TodoList> = self
            .tables
            .read()
            .todo_lists
            .values()
            .filter(|l| l.conversation_id == conversation_id)
            .cloned()
            .collect();
        lists.sort_by_key(|l| l.created_at);
        Ok(lists)
    }

    async fn rename_todo_list(&self, id: Uuid, title: &str) -> Result<TodoList> {
        let mut tables = self.tables.write();
        let list = tables
            .todo_lists
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("todo list", id))?;
        list.title = title.to_string();
        list.updated_at = Utc::now();
        Ok(list.clone())
    }

    async fn delete_todo_list(&self, id: Uuid) -> Result<()> {
        {
            let mut tables = self.tables.write();
            if !tables.todo_lists.contains_key(&id) {
                return Err(Error::not_found("todo list", id));
            }
            tables.remove_list(id);
        }
        self.publish(Change::WorkItems(id));
        Ok(())
    }

    // ── Work items ─────────────────────────────────────────────────

    async fn create_work_item(&self, list_id: Uuid, task: &str) -> Result<WorkItem> {
        let item = {
            let mut tables = self.tables.write();
            if !tables.todo_lists.contains_key(&list_id) {
                return Err(Error::not_found("todo list", list_id));
            }
            let next_position = tables
                .items_of(list_id)
                .last()
                .map(|i| i.position + 1)
                .unwrap_or(0);
            let item = WorkItem::new(list_id, task, next_position);
            tables.list_items.entry(list_id).or_default().insert(item.id);
            tables.work_items.insert(item.id, item.clone());
            item
        };
        self.publish(Change::WorkItems(list_id));
        Ok(item)
    }

    async fn get_work_item(&self, id: Uuid) -> Result<Option<WorkItem>> {
        Ok(self.tables.read().work_items.get(&id).cloned())
    }

    async fn list_work_items(&self, list_id: Uuid) -> Result<Vec<WorkItem>> {
        Ok(self.snapshot_items(list_id))
    }

    async fn update_work_item(&self, id: Uuid, patch: WorkItemPatch) -> Result<WorkItem> {
        let item = {
            let mut tables = self.tables.write();
            let item = tables
                .work_items
                .get_mut(&id)
                .ok_or_else(|| Error::not_found("todo item", id))?;
            if let Some(task) = patch.task {
                item.task = task;
            }
            if let Some(done) = patch.done {
                item.done = done;
            }
            item.updated_at = Utc::now();
            item.clone()
        };
        self.publish(Change::WorkItems(item.list_id));
        Ok(item)
    }

    async fn delete_work_item(&self, id: Uuid) -> Result<()> {
        let list_id = {
            let mut tables = self.tables.write();
            let item = tables
                .work_items
                .remove(&id)
                .ok_or_else(|| Error::not_found("todo item", id))?;
            if let Some(ids) = tables.list_items.get_mut(&item.list_id) {
                ids.remove(&id);
            }
            item.list_id
        };
        self.publish(Change::WorkItems(list_id));
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscriptions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Subscriptions for MemoryStore {
    fn watch_turn(&self, turn_id: Uuid) -> BoxStream<'static, Option<Turn>> {
        let store = self.clone();
        // Subscribe before the first snapshot so no change slips between.
        let mut rx = self.changes.subscribe();
        Box::pin(async_stream::stream! {
            yield store.snapshot_turn(turn_id);
            loop {
                match rx.recv().await {
                    Ok(Change::Turn(id)) if id == turn_id => yield store.snapshot_turn(turn_id),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(%turn_id, skipped, "turn watcher lagged, re-reading");
                        yield store.snapshot_turn(turn_id);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn watch_work_items(&self, list_id: Uuid) -> BoxStream<'static, Vec<WorkItem>> {
        let store = self.clone();
        let mut rx = self.changes.subscribe();
        Box::pin(async_stream::stream! {
            yield store.snapshot_items(list_id);
            loop {
                match rx.recv().await {
                    Ok(Change::WorkItems(id)) if id == list_id => yield store.snapshot_items(list_id),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(%list_id, skipped, "item watcher lagged, re-reading");
                        yield store.snapshot_items(list_id);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
