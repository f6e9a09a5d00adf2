//! Todo processing driven through nested turns.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use cf_domain::model::{TodoList, TodoRunStatus, Turn, TurnPatch, TurnStatus, WorkItemPatch};
use cf_domain::stream::StreamEvent;
use cf_gateway::runtime::TodoProcessor;
use cf_store::{MemoryStore, Store};
use cf_tools::ProcessListRequest;
use uuid::Uuid;

use common::*;

struct Fixture {
    h: Harness,
    list: TodoList,
    host: Uuid,
}

async fn fixture(provider: ScriptedProvider, tasks: &[&str]) -> Fixture {
    let h = harness(provider, test_config());
    let conv = conversation(&h.store, "errands").await;
    let list = h
        .store
        .create_todo_list(TodoList::new(conv.id, "Errands"))
        .await
        .unwrap();
    for task in tasks {
        h.store.create_work_item(list.id, task).await.unwrap();
    }
    let host = Turn::pending(conv.id);
    let host_id = host.id;
    h.store.insert_turn(host).await.unwrap();
    Fixture {
        h,
        list,
        host: host_id,
    }
}

fn request(f: &Fixture, watch: bool, timeout_secs: Option<u64>) -> ProcessListRequest {
    ProcessListRequest {
        list_id: f.list.id,
        turn_id: f.host,
        watch,
        timeout_secs,
    }
}

fn done_reply() -> Vec<Vec<StreamEvent>> {
    vec![level(vec![token("Taken care of.")])]
}

#[tokio::test]
async fn processes_items_in_order_and_marks_them_done() {
    let f = fixture(ScriptedProvider::new(done_reply()), &["Buy stamps", "Post letter"]).await;
    let processor = TodoProcessor::new(f.h.engine.clone());

    let report = processor
        .run(request(&f, false, None), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, TodoRunStatus::Completed);
    assert_eq!(report.completed_tasks, ["Buy stamps", "Post letter"]);
    assert!(report.aborted_tasks.is_empty());
    assert_eq!(f.h.provider.calls(), 2);

    // Each item's nested turn sees the task as its only user message.
    let first = &f.h.provider.requests()[0];
    assert!(first.messages.iter().any(|m| m.content == "task: Buy stamps"));
    // Nested turns cannot start another todo run.
    assert!(first.tools.iter().all(|t| t.name != "process_todo_list"));

    let items = f.h.store.list_work_items(f.list.id).await.unwrap();
    assert!(items.iter().all(|i| i.done));

    let actions = f.h.store.list_actions(f.list.conversation_id, 10).await.unwrap();
    assert_eq!(
        actions
            .iter()
            .filter(|a| a.tool_name == "process_todo_item")
            .count(),
        2
    );
}

#[tokio::test]
async fn item_completed_elsewhere_while_queued_is_skipped() {
    let store_slot: Arc<parking_lot::Mutex<Option<(Arc<MemoryStore>, Uuid)>>> =
        Arc::new(parking_lot::Mutex::new(None));
    let slot = store_slot.clone();
    let provider = ScriptedProvider::new(done_reply()).with_before_call(Arc::new(move |n: usize| {
        let target = slot.lock().clone();
        async move {
            // While the first item is being worked on, someone ticks off the second.
            if let (0, Some((store, item_id))) = (n, target) {
                store
                    .update_work_item(
                        item_id,
                        WorkItemPatch {
                            done: Some(true),
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap();
            }
        }
        .boxed()
    }));

    let f = fixture(provider, &["Write report", "Email Bob"]).await;
    let items = f.h.store.list_work_items(f.list.id).await.unwrap();
    *store_slot.lock() = Some((f.h.store.clone(), items[1].id));

    let processor = TodoProcessor::new(f.h.engine.clone());
    let report = processor
        .run(request(&f, false, None), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.completed_tasks, ["Write report"]);
    assert_eq!(report.aborted_tasks, ["Email Bob"]);
    assert_eq!(f.h.provider.calls(), 1);

    let bob = f.h.store.get_work_item(items[1].id).await.unwrap().unwrap();
    assert_eq!(bob.task, "Email Bob");
    assert!(bob.done);
}

#[tokio::test]
async fn aborting_one_item_turn_moves_on_to_the_next() {
    let slot: Arc<parking_lot::Mutex<Option<(Arc<MemoryStore>, Uuid, Uuid)>>> =
        Arc::new(parking_lot::Mutex::new(None));
    let hook_slot = slot.clone();
    let provider = ScriptedProvider::new(done_reply()).with_before_call(Arc::new(move |n: usize| {
        let target = hook_slot.lock().clone();
        async move {
            // Abort only the turn working on the first item.
            if let (0, Some((store, conv_id, host_id))) = (n, target) {
                let turns = store.list_turns(conv_id).await.unwrap();
                let nested = turns
                    .iter()
                    .find(|t| t.id != host_id && t.status == TurnStatus::Pending)
                    .expect("nested turn");
                store
                    .update_turn(nested.id, TurnPatch::status(TurnStatus::Aborted))
                    .await
                    .unwrap();
            }
        }
        .boxed()
    }));

    let f = fixture(provider, &["First", "Second"]).await;
    *slot.lock() = Some((f.h.store.clone(), f.list.conversation_id, f.host));

    let processor = TodoProcessor::new(f.h.engine.clone());
    let report = processor
        .run(request(&f, false, None), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, TodoRunStatus::Completed);
    assert_eq!(report.aborted_tasks, ["First"]);
    assert_eq!(report.completed_tasks, ["Second"]);
    assert_eq!(f.h.provider.calls(), 2);

    let items = f.h.store.list_work_items(f.list.id).await.unwrap();
    assert_eq!(items[0].task, "First");
    assert!(!items[0].done);
    assert!(items[1].done);

    let host = f.h.store.get_turn(f.host).await.unwrap().unwrap();
    assert_eq!(host.status, TurnStatus::Pending);
}

#[tokio::test]
async fn failing_item_is_annotated_and_reported() {
    let script = vec![vec![StreamEvent::Error {
        message: "model offline".into(),
    }]];
    let f = fixture(ScriptedProvider::new(script), &["Call plumber"]).await;
    let processor = TodoProcessor::new(f.h.engine.clone());

    let report = processor
        .run(request(&f, false, None), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.failed_tasks, ["Call plumber"]);
    let items = f.h.store.list_work_items(f.list.id).await.unwrap();
    assert!(!items[0].done);
    assert!(items[0].task.starts_with("Call plumber [error:"));
    assert!(items[0].task.contains("model offline"));

    let actions = f.h.store.list_actions(f.list.conversation_id, 10).await.unwrap();
    assert!(actions.iter().any(|a| a.tool_name == "process_todo_item" && a.is_error));
}

#[tokio::test(start_paused = true)]
async fn watch_mode_picks_up_new_items_until_timeout() {
    let f = fixture(ScriptedProvider::new(done_reply()), &["First"]).await;
    let processor = TodoProcessor::new(f.h.engine.clone());
    let req = request(&f, true, Some(30));

    let run = tokio::spawn(async move { processor.run(req, CancellationToken::new()).await });

    tokio::time::sleep(Duration::from_secs(5)).await;
    f.h.store.create_work_item(f.list.id, "Second").await.unwrap();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, TodoRunStatus::Cancelled);
    assert_eq!(report.completed_tasks, ["First", "Second"]);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_background_run_reports_cancelled() {
    let f = fixture(ScriptedProvider::new(done_reply()), &["Only"]).await;
    let processor = TodoProcessor::new(f.h.engine.clone());

    let run = processor
        .start_background(f.list.id, true, Some(600))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(f.h.cancels.cancel(run.run_id));

    let report = run.handle.await.unwrap().unwrap();
    assert_eq!(report.status, TodoRunStatus::Cancelled);
    assert_eq!(report.completed_tasks, ["Only"]);

    let host = f.h.store.get_turn(run.run_id).await.unwrap().unwrap();
    assert_eq!(host.status, TurnStatus::Completed);
    assert!(host.content.contains("Only"));
    assert!(!f.h.cancels.is_running(run.run_id));
}

#[tokio::test(start_paused = true)]
async fn aborting_the_host_turn_reports_aborted() {
    let f = fixture(ScriptedProvider::new(done_reply()), &["Only"]).await;
    let processor = TodoProcessor::new(f.h.engine.clone());

    let run = processor
        .start_background(f.list.id, true, Some(600))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    f.h.store
        .update_turn(run.run_id, TurnPatch::status(TurnStatus::Aborted))
        .await
        .unwrap();

    let report = run.handle.await.unwrap().unwrap();
    assert_eq!(report.status, TodoRunStatus::Aborted);

    let host = f.h.store.get_turn(run.run_id).await.unwrap().unwrap();
    assert_eq!(host.status, TurnStatus::Aborted);
}
