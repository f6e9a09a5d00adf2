//! Todo lists, their items, and the processing loop entry point.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use cf_domain::error::{Error, Result};
use cf_domain::model::{EntityRef, TodoList, TodoRunReport, WorkItem, WorkItemPatch};
use cf_domain::tool::ToolDefinition;

use crate::handler::{
    parse_args, str_field, ProcessListRequest, ToolCategory, ToolContext, ToolHandler, ToolOutput,
};
use crate::similarity::similarity;

async fn owned_list(ctx: &ToolContext, list_id: Uuid) -> Result<TodoList> {
    ctx.store
        .get_todo_list(list_id)
        .await?
        .filter(|l| l.conversation_id == ctx.conversation_id)
        .ok_or_else(|| Error::not_found("todo list", list_id))
}

async fn owned_item(ctx: &ToolContext, item_id: Uuid) -> Result<WorkItem> {
    let item = ctx
        .store
        .get_work_item(item_id)
        .await?
        .ok_or_else(|| Error::not_found("todo item", item_id))?;
    owned_list(ctx, item.list_id).await?;
    Ok(item)
}

fn same_str(previous: &Value, current: &Value, key: &str) -> bool {
    previous.get(key).and_then(Value::as_str) == current.get(key).and_then(Value::as_str)
}

fn similar_text(previous: &Value, current: &Value, key: &str, threshold: f64) -> bool {
    match (
        previous.get(key).and_then(Value::as_str),
        current.get(key).and_then(Value::as_str),
    ) {
        (Some(a), Some(b)) => similarity(a, b) >= threshold,
        (None, None) => true,
        _ => false,
    }
}

fn render_items(list: &TodoList, items: &[WorkItem]) -> String {
    if items.is_empty() {
        return format!("Todo list \"{}\" ({}) has no items.", list.title, list.id);
    }
    let lines: Vec<String> = items
        .iter()
        .map(|i| {
            let mark = if i.done { "x" } else { " " };
            format!("- [{mark}] {} (id {})", i.task, i.id)
        })
        .collect();
    format!(
        "Todo list \"{}\" ({}):\n{}",
        list.title,
        list.id,
        lines.join("\n")
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lists
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CreateTodoList;

#[derive(Deserialize)]
struct CreateListArgs {
    title: String,
}

#[async_trait]
impl ToolHandler for CreateTodoList {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "create_todo_list".into(),
            description: "Create a todo list in this conversation. Returns its id.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "title": { "type": "string" } },
                "required": ["title"]
            }),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Todo
    }

    fn thinking(&self, args: &Value) -> String {
        format!("Creating todo list \"{}\"", str_field(args, "title"))
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let args: CreateListArgs = parse_args("create_todo_list", args)?;
        let title = args.title.trim();
        if title.is_empty() {
            return Err(Error::tool("create_todo_list", "title must not be empty"));
        }
        let list = ctx
            .store
            .create_todo_list(TodoList::new(ctx.conversation_id, title))
            .await?;
        Ok(ToolOutput::feedback(
            format!("Created todo list \"{}\" with id {}.", list.title, list.id),
            format!("created list {}", list.id),
        )
        .with_content(format!("Created todo list \"{}\".", list.title))
        .with_entity(EntityRef::new(list.id, list.title, "todo_list")))
    }

    fn judge_repeat(&self, previous: &Value, current: &Value, threshold: f64) -> Option<bool> {
        Some(similar_text(previous, current, "title", threshold))
    }
}

pub struct UpdateTodoList;

#[derive(Deserialize)]
struct UpdateListArgs {
    list_id: Uuid,
    title: String,
}

#[async_trait]
impl ToolHandler for UpdateTodoList {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "update_todo_list".into(),
            description: "Rename a todo list.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "list_id": { "type": "string" },
                    "title": { "type": "string" }
                },
                "required": ["list_id", "title"]
            }),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Todo
    }

    fn thinking(&self, args: &Value) -> String {
        format!("Renaming todo list to \"{}\"", str_field(args, "title"))
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let args: UpdateListArgs = parse_args("update_todo_list", args)?;
        owned_list(ctx, args.list_id).await?;
        let list = ctx
            .store
            .rename_todo_list(args.list_id, args.title.trim())
            .await?;
        Ok(ToolOutput::inline(
            format!("Renamed todo list to \"{}\".", list.title),
            format!("renamed list to \"{}\"", list.title),
        )
        .with_entity(EntityRef::new(list.id, list.title, "todo_list")))
    }

    fn judge_repeat(&self, previous: &Value, current: &Value, threshold: f64) -> Option<bool> {
        Some(
            same_str(previous, current, "list_id")
                && similar_text(previous, current, "title", threshold),
        )
    }
}

pub struct DeleteTodoList;

#[derive(Deserialize)]
struct ListIdArgs {
    list_id: Uuid,
}

#[async_trait]
impl ToolHandler for DeleteTodoList {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "delete_todo_list".into(),
            description: "Delete a todo list and all of its items.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "list_id": { "type": "string" } },
                "required": ["list_id"]
            }),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Todo
    }

    fn thinking(&self, _args: &Value) -> String {
        "Deleting todo list".into()
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let args: ListIdArgs = parse_args("delete_todo_list", args)?;
        let list = owned_list(ctx, args.list_id).await?;
        ctx.store.delete_todo_list(list.id).await?;
        Ok(ToolOutput::inline(
            format!("Deleted todo list \"{}\".", list.title),
            "deleted list",
        )
        .with_entity(EntityRef::new(list.id, list.title, "todo_list")))
    }

    fn judge_repeat(&self, previous: &Value, current: &Value, _threshold: f64) -> Option<bool> {
        Some(same_str(previous, current, "list_id"))
    }
}

pub struct ListTodoLists;

#[async_trait]
impl ToolHandler for ListTodoLists {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_todo_lists".into(),
            description: "List the todo lists of this conversation with their ids.".into(),
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Todo
    }

    fn thinking(&self, _args: &Value) -> String {
        "Looking up todo lists".into()
    }

    async fn execute(&self, ctx: &ToolContext, _args: Value) -> Result<ToolOutput> {
        let lists = ctx.store.list_todo_lists(ctx.conversation_id).await?;
        let text = if lists.is_empty() {
            "This conversation has no todo lists.".to_string()
        } else {
            let lines: Vec<String> = lists
                .iter()
                .map(|l| format!("- \"{}\" (id {})", l.title, l.id))
                .collect();
            format!("Todo lists:\n{}", lines.join("\n"))
        };
        Ok(ToolOutput::feedback(text, format!("{} lists", lists.len())))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Items
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CreateTodoItem;

#[derive(Deserialize)]
struct CreateItemArgs {
    list_id: Uuid,
    task: String,
}

#[async_trait]
impl ToolHandler for CreateTodoItem {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "create_todo_item".into(),
            description: "Add an item to the end of a todo list. Returns its id.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "list_id": { "type": "string" },
                    "task": { "type": "string" }
                },
                "required": ["list_id", "task"]
            }),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Todo
    }

    fn thinking(&self, args: &Value) -> String {
        format!("Adding \"{}\"", str_field(args, "task"))
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let args: CreateItemArgs = parse_args("create_todo_item", args)?;
        let task = args.task.trim();
        if task.is_empty() {
            return Err(Error::tool("create_todo_item", "task must not be empty"));
        }
        let list = owned_list(ctx, args.list_id).await?;
        let item = ctx.store.create_work_item(list.id, task).await?;
        Ok(ToolOutput::feedback(
            format!(
                "Added \"{}\" to \"{}\" with id {}.",
                item.task, list.title, item.id
            ),
            format!("created item {}", item.id),
        )
        .with_content(format!("Added \"{}\" to \"{}\".", item.task, list.title))
        .with_entity(EntityRef::new(item.id, item.task, "todo_item")))
    }

    fn judge_repeat(&self, previous: &Value, current: &Value, threshold: f64) -> Option<bool> {
        Some(
            same_str(previous, current, "list_id")
                && similar_text(previous, current, "task", threshold),
        )
    }
}

pub struct UpdateTodoItem;

#[derive(Deserialize)]
struct UpdateItemArgs {
    item_id: Uuid,
    #[serde(default)]
    task: Option<String>,
    #[serde(default)]
    done: Option<bool>,
}

#[async_trait]
impl ToolHandler for UpdateTodoItem {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "update_todo_item".into(),
            description: "Change an item's text or mark it done/undone.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "item_id": { "type": "string" },
                    "task": { "type": "string" },
                    "done": { "type": "boolean" }
                },
                "required": ["item_id"]
            }),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Todo
    }

    fn thinking(&self, args: &Value) -> String {
        match args.get("done").and_then(Value::as_bool) {
            Some(true) => "Checking off item".into(),
            Some(false) => "Reopening item".into(),
            None => "Updating item".into(),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let args: UpdateItemArgs = parse_args("update_todo_item", args)?;
        if args.task.is_none() && args.done.is_none() {
            return Err(Error::tool("update_todo_item", "nothing to update"));
        }
        owned_item(ctx, args.item_id).await?;
        let item = ctx
            .store
            .update_work_item(
                args.item_id,
                WorkItemPatch {
                    task: args.task.map(|t| t.trim().to_string()),
                    done: args.done,
                },
            )
            .await?;
        let state = if item.done { "done" } else { "open" };
        Ok(ToolOutput::inline(
            format!("Updated \"{}\" ({state}).", item.task),
            format!("updated item ({state})"),
        )
        .with_entity(EntityRef::new(item.id, item.task, "todo_item")))
    }

    fn judge_repeat(&self, previous: &Value, current: &Value, threshold: f64) -> Option<bool> {
        Some(
            same_str(previous, current, "item_id")
                && previous.get("done") == current.get("done")
                && similar_text(previous, current, "task", threshold),
        )
    }
}

pub struct DeleteTodoItem;

#[derive(Deserialize)]
struct ItemIdArgs {
    item_id: Uuid,
}

#[async_trait]
impl ToolHandler for DeleteTodoItem {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "delete_todo_item".into(),
            description: "Remove an item from its todo list.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "item_id": { "type": "string" } },
                "required": ["item_id"]
            }),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Todo
    }

    fn thinking(&self, _args: &Value) -> String {
        "Removing item".into()
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let args: ItemIdArgs = parse_args("delete_todo_item", args)?;
        let item = owned_item(ctx, args.item_id).await?;
        ctx.store.delete_work_item(item.id).await?;
        Ok(ToolOutput::inline(
            format!("Removed \"{}\".", item.task),
            "deleted item",
        )
        .with_entity(EntityRef::new(item.id, item.task, "todo_item")))
    }

    fn judge_repeat(&self, previous: &Value, current: &Value, _threshold: f64) -> Option<bool> {
        Some(same_str(previous, current, "item_id"))
    }
}

pub struct ListTodoItems;

#[async_trait]
impl ToolHandler for ListTodoItems {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_todo_items".into(),
            description: "Show the items of a todo list in order with their ids.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "list_id": { "type": "string" } },
                "required": ["list_id"]
            }),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Todo
    }

    fn thinking(&self, _args: &Value) -> String {
        "Reading todo list".into()
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let args: ListIdArgs = parse_args("list_todo_items", args)?;
        let list = owned_list(ctx, args.list_id).await?;
        let items = ctx.store.list_work_items(list.id).await?;
        Ok(ToolOutput::feedback(
            render_items(&list, &items),
            format!("{} items", items.len()),
        ))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Processing loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ProcessTodoList;

#[derive(Deserialize)]
struct ProcessArgs {
    list_id: Uuid,
    #[serde(default)]
    watch: bool,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

pub fn render_report(report: &TodoRunReport) -> String {
    let section = |label: &str, tasks: &[String]| {
        if tasks.is_empty() {
            format!("{label}: none")
        } else {
            format!("{label}:\n{}", tasks.iter().map(|t| format!("- {t}")).collect::<Vec<_>>().join("\n"))
        }
    };
    format!(
        "Todo processing finished ({:?}).\n{}\n{}\n{}",
        report.status,
        section("Completed", &report.completed_tasks),
        section("Skipped (completed elsewhere)", &report.aborted_tasks),
        section("Failed", &report.failed_tasks),
    )
}

#[async_trait]
impl ToolHandler for ProcessTodoList {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "process_todo_list".into(),
            description: "Work through the open items of a todo list one by one. With watch=true, keep waiting for new items until cancelled or the timeout passes.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "list_id": { "type": "string" },
                    "watch": { "type": "boolean", "description": "Keep watching for new items" },
                    "timeout_secs": { "type": "integer", "description": "Watch-mode timeout" }
                },
                "required": ["list_id"]
            }),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Todo
    }

    fn thinking(&self, args: &Value) -> String {
        if args.get("watch").and_then(Value::as_bool) == Some(true) {
            "Watching todo list".into()
        } else {
            "Processing todo list".into()
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let args: ProcessArgs = parse_args("process_todo_list", args)?;
        let driver = ctx
            .todo
            .clone()
            .ok_or_else(|| Error::tool("process_todo_list", "todo processing is not available here"))?;
        let list = owned_list(ctx, args.list_id).await?;

        let report = driver
            .process_list(
                ProcessListRequest {
                    list_id: list.id,
                    turn_id: ctx.turn_id,
                    watch: args.watch,
                    timeout_secs: args.timeout_secs,
                },
                ctx.cancel.clone(),
            )
            .await?;

        let summary = format!(
            "{} completed, {} skipped, {} failed",
            report.completed_tasks.len(),
            report.aborted_tasks.len(),
            report.failed_tasks.len()
        );
        Ok(ToolOutput::feedback(render_report(&report), summary)
            .with_entity(EntityRef::new(list.id, list.title, "todo_list")))
    }
}
