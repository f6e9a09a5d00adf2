//! Todo processing loop: walks the open items of a list and drives each
//! one through a nested turn.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use cf_domain::error::{Error, Result};
use cf_domain::model::{
    EntityRef, HistoryEntry, TodoList, TodoRunReport, TodoRunStatus, Turn, TurnPatch, TurnStatus,
    WorkItem, WorkItemPatch,
};
use cf_tools::builtin::todo::render_report;
use cf_tools::{ProcessListRequest, TodoDriver, ToolFilter, ToolOutput};

use crate::runtime::cancel::CancelScope;
use crate::runtime::turn::{TurnEngine, TurnRequest};

/// Tool name used for Action Log records of processed items.
pub const PROCESS_ITEM_ACTION: &str = "process_todo_item";

/// Author shown for the instruction a nested turn receives.
const TASK_AUTHOR: &str = "task";

/// Pick the next item to work on: open, not yet handled, lowest position.
fn next_eligible<'a>(
    items: &'a [WorkItem],
    processed: &HashSet<Uuid>,
    in_progress: &HashSet<Uuid>,
) -> Option<&'a WorkItem> {
    items
        .iter()
        .filter(|i| !i.done && !processed.contains(&i.id) && !in_progress.contains(&i.id))
        .min_by_key(|i| (i.position, i.created_at))
}

/// Drives todo items through the turn engine.
#[derive(Clone)]
pub struct TodoProcessor {
    engine: TurnEngine,
}

/// A todo run started in the background. The run is hosted by its own
/// turn record, whose id doubles as the run id.
pub struct TodoRun {
    pub run_id: Uuid,
    pub conversation_id: Uuid,
    pub handle: JoinHandle<Result<TodoRunReport>>,
}

/// Mutable bookkeeping of one run.
struct RunState {
    processed: HashSet<Uuid>,
    in_progress: HashSet<Uuid>,
    /// Open items seen so far that the loop has not handled yet.
    queued: HashMap<Uuid, String>,
    report: TodoRunReport,
}

impl RunState {
    fn new() -> Self {
        Self {
            processed: HashSet::new(),
            in_progress: HashSet::new(),
            queued: HashMap::new(),
            report: TodoRunReport::new(),
        }
    }

    /// Track newly seen open items and report queued ones someone else
    /// completed in the meantime.
    fn observe(&mut self, items: &[WorkItem]) {
        for item in items {
            if self.processed.contains(&item.id) {
                continue;
            }
            if item.done {
                if let Some(task) = self.queued.remove(&item.id) {
                    tracing::info!(item_id = %item.id, "item completed elsewhere while queued");
                    self.report.aborted_tasks.push(task);
                    self.processed.insert(item.id);
                }
            } else {
                self.queued.entry(item.id).or_insert_with(|| item.task.clone());
            }
        }
    }

    fn finish_item(&mut self, id: Uuid) {
        self.in_progress.remove(&id);
        self.queued.remove(&id);
        self.processed.insert(id);
    }
}

enum ItemEnd {
    Handled,
    /// The run's own cancel fired or its hosting turn was aborted.
    Stopped,
}

impl TodoProcessor {
    pub fn new(engine: TurnEngine) -> Self {
        Self { engine }
    }

    /// Run the loop until the list is exhausted (or, in watch mode, until
    /// cancelled, timed out, or the enclosing turn is aborted).
    pub async fn run(
        &self,
        req: ProcessListRequest,
        cancel: CancellationToken,
    ) -> Result<TodoRunReport> {
        let store = self.engine.store().clone();
        let list = store
            .get_todo_list(req.list_id)
            .await?
            .ok_or_else(|| Error::not_found("todo list", req.list_id))?;

        let span = tracing::info_span!(
            "todo.run",
            list_id = %list.id,
            turn_id = %req.turn_id,
            watch = req.watch,
        );
        self.run_list(&list, &req, &cancel).instrument(span).await
    }

    async fn run_list(
        &self,
        list: &TodoList,
        req: &ProcessListRequest,
        cancel: &CancellationToken,
    ) -> Result<TodoRunReport> {
        let store = self.engine.store().clone();
        let deadline = req
            .watch
            .then(|| Instant::now() + self.engine.config().todo.watch_timeout(req.timeout_secs));
        let mut feed = self.engine.subscriptions().watch_work_items(list.id);
        let mut st = RunState::new();

        tracing::info!(title = %list.title, "todo run started");

        'outer: loop {
            let items = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    st.report.status = self.stop_status(req.turn_id).await;
                    break 'outer;
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    tracing::info!("watch timeout reached");
                    st.report.status = TodoRunStatus::Cancelled;
                    break 'outer;
                }
                next = feed.next() => match next {
                    Some(items) => items,
                    None => break 'outer,
                },
            };

            let mut items = items;
            loop {
                st.observe(&items);
                let Some(item) =
                    next_eligible(&items, &st.processed, &st.in_progress).cloned()
                else {
                    break;
                };

                match self.process_item(list, req, cancel, &mut st, item).await? {
                    ItemEnd::Handled => {}
                    ItemEnd::Stopped => {
                        st.report.status = self.stop_status(req.turn_id).await;
                        break 'outer;
                    }
                }
                if cancel.is_cancelled() {
                    st.report.status = self.stop_status(req.turn_id).await;
                    break 'outer;
                }
                items = store.list_work_items(list.id).await?;
            }

            if !req.watch {
                break;
            }
            store
                .update_turn(
                    req.turn_id,
                    TurnPatch::thinking(format!("Watching \"{}\" for new items", list.title)),
                )
                .await?;
        }

        tracing::info!(
            status = ?st.report.status,
            completed = st.report.completed_tasks.len(),
            skipped = st.report.aborted_tasks.len(),
            failed = st.report.failed_tasks.len(),
            "todo run finished"
        );
        Ok(st.report)
    }

    async fn process_item(
        &self,
        list: &TodoList,
        req: &ProcessListRequest,
        cancel: &CancellationToken,
        st: &mut RunState,
        item: WorkItem,
    ) -> Result<ItemEnd> {
        let store = self.engine.store().clone();
        st.in_progress.insert(item.id);

        // Someone may have completed or removed it since the snapshot.
        let fresh = match store.get_work_item(item.id).await? {
            Some(fresh) => fresh,
            None => {
                st.finish_item(item.id);
                return Ok(ItemEnd::Handled);
            }
        };
        if fresh.done {
            tracing::info!(item_id = %item.id, "item completed elsewhere before processing");
            st.report.aborted_tasks.push(fresh.task);
            st.finish_item(item.id);
            return Ok(ItemEnd::Handled);
        }

        store
            .update_turn(
                req.turn_id,
                TurnPatch::thinking(format!("Working on \"{}\"", fresh.task)),
            )
            .await?;

        let nested = Turn::pending(list.conversation_id);
        let nested_id = nested.id;
        store.insert_turn(nested).await?;

        let outcome = self
            .engine
            .run_turn(TurnRequest {
                conversation_id: list.conversation_id,
                turn_id: nested_id,
                history: vec![HistoryEntry::user(TASK_AUTHOR, fresh.task.clone())],
                filter: ToolFilter::nested(),
                parent_cancel: Some(cancel.clone()),
            })
            .await;

        if outcome.status == TurnStatus::Aborted {
            let run_stopped = cancel.is_cancelled()
                || self.stop_status(req.turn_id).await == TodoRunStatus::Aborted;
            if run_stopped {
                st.in_progress.remove(&item.id);
                return Ok(ItemEnd::Stopped);
            }
            // Only this item's turn was aborted; the run goes on.
            tracing::info!(item_id = %fresh.id, turn_id = %nested_id, "todo item turn aborted");
            st.report.aborted_tasks.push(fresh.task);
            st.finish_item(item.id);
            return Ok(ItemEnd::Handled);
        }

        let args = json!({
            "list_id": list.id,
            "item_id": fresh.id,
            "task": fresh.task,
            "turn_id": nested_id,
        });
        let action_log = self.engine.action_log();

        match outcome.error {
            None => {
                store
                    .update_work_item(
                        fresh.id,
                        WorkItemPatch {
                            done: Some(true),
                            ..Default::default()
                        },
                    )
                    .await?;
                let output = ToolOutput::inline("", "completed")
                    .with_entity(EntityRef::new(fresh.id, fresh.task.clone(), "todo_item"));
                action_log
                    .record_success(
                        list.conversation_id,
                        Some(req.turn_id),
                        PROCESS_ITEM_ACTION,
                        &args,
                        &output,
                    )
                    .await?;
                st.report.completed_tasks.push(fresh.task);
            }
            Some(message) => {
                tracing::warn!(item_id = %fresh.id, error = %message, "todo item failed");
                store
                    .update_work_item(
                        fresh.id,
                        WorkItemPatch {
                            task: Some(format!("{} [error: {message}]", fresh.task)),
                            ..Default::default()
                        },
                    )
                    .await?;
                action_log
                    .record_failure(
                        list.conversation_id,
                        Some(req.turn_id),
                        PROCESS_ITEM_ACTION,
                        &args,
                        &message,
                    )
                    .await?;
                st.report.failed_tasks.push(fresh.task);
            }
        }
        st.finish_item(item.id);
        Ok(ItemEnd::Handled)
    }

    /// `Aborted` when the hosting turn was aborted, otherwise the loop's
    /// own cancel fired.
    async fn stop_status(&self, turn_id: Uuid) -> TodoRunStatus {
        match self.engine.store().get_turn(turn_id).await {
            Ok(Some(turn)) if turn.status == TurnStatus::Aborted => TodoRunStatus::Aborted,
            _ => TodoRunStatus::Cancelled,
        }
    }

    // ── Background runs ───────────────────────────────────────────────

    /// Start a run hosted by a fresh turn in the list's conversation.
    ///
    /// Cancel it through the cancel map with the returned `run_id`; abort
    /// the hosting turn to stop it as `Aborted`.
    pub async fn start_background(
        &self,
        list_id: Uuid,
        watch: bool,
        timeout_secs: Option<u64>,
    ) -> Result<TodoRun> {
        let store = self.engine.store().clone();
        let list = store
            .get_todo_list(list_id)
            .await?
            .ok_or_else(|| Error::not_found("todo list", list_id))?;

        let host = Turn::pending(list.conversation_id);
        let run_id = host.id;
        store.insert_turn(host).await?;

        // Register now so a cancel arriving before the task starts is kept.
        let scope = CancelScope::open(
            run_id,
            None,
            self.engine.cancels().clone(),
            store.clone(),
            self.engine.subscriptions().clone(),
            self.engine.config().engine.abort_purge_delay(),
        );

        let processor = self.clone();
        let span = tracing::info_span!("todo.background", %run_id, %list_id);
        let handle = tokio::spawn(tracing::Instrument::instrument(
            async move {
                let req = ProcessListRequest {
                    list_id,
                    turn_id: run_id,
                    watch,
                    timeout_secs,
                };
                let result = processor.run(req, scope.token().clone()).await;

                let (status, content) = match &result {
                    Ok(report) if report.status == TodoRunStatus::Aborted => {
                        (TurnStatus::Aborted, render_report(report))
                    }
                    Ok(report) => (TurnStatus::Completed, render_report(report)),
                    Err(e) => (TurnStatus::Completed, format!("Todo processing failed: {e}")),
                };
                let patch = TurnPatch {
                    status: Some(status),
                    content: Some(content),
                    thinking_text: Some(String::new()),
                };
                if let Err(e) = store.finalize_turn(run_id, patch).await {
                    tracing::warn!(error = %e, "todo run host turn write failed");
                }
                drop(scope);
                result
            },
            span,
        ));

        Ok(TodoRun {
            run_id,
            conversation_id: list.conversation_id,
            handle,
        })
    }
}

#[async_trait]
impl TodoDriver for TodoProcessor {
    async fn process_list(
        &self,
        req: ProcessListRequest,
        cancel: CancellationToken,
    ) -> Result<TodoRunReport> {
        self.run(req, cancel).await
    }
}
