//! Built-in tools executed against the in-memory store.

use std::sync::Arc;

use cf_domain::error::Error;
use cf_domain::model::{Conversation, TodoList};
use cf_store::{MemoryStore, Store};
use cf_tools::{ToolContext, ToolFilter, ToolRegistry};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

async fn setup() -> (Arc<MemoryStore>, ToolContext) {
    let store = Arc::new(MemoryStore::new());
    let conv = store
        .create_conversation(Conversation::new("untitled"))
        .await
        .unwrap();
    let ctx = ToolContext {
        conversation_id: conv.id,
        turn_id: Uuid::new_v4(),
        store: store.clone(),
        cancel: CancellationToken::new(),
        todo: None,
    };
    (store, ctx)
}

#[tokio::test]
async fn rename_truncates_to_fifty_characters() {
    let (store, ctx) = setup().await;
    let registry = ToolRegistry::builtin();
    let tool = registry.get("rename_conversation").unwrap();

    let long = "x".repeat(80);
    let out = tool.execute(&ctx, json!({ "name": long })).await.unwrap();
    assert!(!out.needs_reentry());
    let conv = store.get_conversation(ctx.conversation_id).await.unwrap().unwrap();
    assert_eq!(conv.name.chars().count(), 50);
    assert_eq!(out.entity.unwrap().kind, "conversation");
}

#[tokio::test]
async fn write_then_read_file_feeds_contents_back() {
    let (_store, ctx) = setup().await;
    let registry = ToolRegistry::builtin();

    registry
        .get("write_file")
        .unwrap()
        .execute(&ctx, json!({ "path": "./notes/plan.md", "content": "step one" }))
        .await
        .unwrap();

    let out = registry
        .get("read_file")
        .unwrap()
        .execute(&ctx, json!({ "path": "notes/plan.md" }))
        .await
        .unwrap();
    assert!(out.needs_reentry());
    assert!(out.system_message.unwrap().contains("step one"));
}

#[tokio::test]
async fn read_missing_file_is_not_found() {
    let (_store, ctx) = setup().await;
    let err = ToolRegistry::builtin()
        .get("read_file")
        .unwrap()
        .execute(&ctx, json!({ "path": "nope.txt" }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { kind: "file", .. }));
}

#[tokio::test]
async fn todo_item_tools_reject_lists_of_other_conversations() {
    let (store, ctx) = setup().await;
    let stranger = store
        .create_conversation(Conversation::new("other"))
        .await
        .unwrap();
    let foreign = store
        .create_todo_list(TodoList::new(stranger.id, "theirs"))
        .await
        .unwrap();

    let err = ToolRegistry::builtin()
        .get("create_todo_item")
        .unwrap()
        .execute(&ctx, json!({ "list_id": foreign.id, "task": "sneak in" }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { kind: "todo list", .. }));
    assert!(store.list_work_items(foreign.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn create_item_reports_id_to_the_model() {
    let (store, ctx) = setup().await;
    let list = store
        .create_todo_list(TodoList::new(ctx.conversation_id, "groceries"))
        .await
        .unwrap();
    let out = ToolRegistry::builtin()
        .get("create_todo_item")
        .unwrap()
        .execute(&ctx, json!({ "list_id": list.id, "task": "Buy milk" }))
        .await
        .unwrap();

    let items = store.list_work_items(list.id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert!(out.system_message.unwrap().contains(&items[0].id.to_string()));
    assert!(out.content.contains("Buy milk"));
}

#[tokio::test]
async fn query_database_filters_rows() {
    let (store, ctx) = setup().await;
    let list = store
        .create_todo_list(TodoList::new(ctx.conversation_id, "groceries"))
        .await
        .unwrap();
    store.create_work_item(list.id, "Buy milk").await.unwrap();
    store.create_work_item(list.id, "Walk dog").await.unwrap();

    let out = ToolRegistry::builtin()
        .get("query_database")
        .unwrap()
        .execute(
            &ctx,
            json!({ "entity": "todo_items", "list_id": list.id, "filter": "MILK" }),
        )
        .await
        .unwrap();
    let msg = out.system_message.unwrap();
    assert!(msg.starts_with("Query returned 1 rows"));
    assert!(msg.contains("Buy milk"));
    assert!(!msg.contains("Walk dog"));
}

#[tokio::test]
async fn process_without_driver_is_a_tool_error() {
    let (store, ctx) = setup().await;
    let list = store
        .create_todo_list(TodoList::new(ctx.conversation_id, "chores"))
        .await
        .unwrap();
    let err = ToolRegistry::builtin()
        .get("process_todo_list")
        .unwrap()
        .execute(&ctx, json!({ "list_id": list.id }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Tool { .. }));
}

#[test]
fn nested_schema_keeps_files_and_database() {
    let defs = ToolRegistry::builtin().definitions(&ToolFilter::nested());
    let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["write_file", "read_file", "list_files", "query_database"]);
}
