//! Read-only queries over the conversation's records.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use cf_domain::error::{Error, Result};
use cf_domain::tool::ToolDefinition;

use crate::handler::{parse_args, str_field, ToolCategory, ToolContext, ToolHandler, ToolOutput};

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
enum Entity {
    TodoLists,
    TodoItems,
    Files,
    Actions,
    Turns,
}

#[derive(Deserialize)]
struct QueryArgs {
    entity: Entity,
    /// Case-insensitive substring matched against the row's text.
    #[serde(default)]
    filter: Option<String>,
    /// Required for `todo_items`.
    #[serde(default)]
    list_id: Option<Uuid>,
    #[serde(default)]
    limit: Option<usize>,
}

pub struct QueryDatabase;

impl QueryDatabase {
    async fn rows(&self, ctx: &ToolContext, args: &QueryArgs) -> Result<Vec<(String, Value)>> {
        let conv = ctx.conversation_id;
        let rows = match args.entity {
            Entity::TodoLists => ctx
                .store
                .list_todo_lists(conv)
                .await?
                .into_iter()
                .map(|l| (l.title.clone(), serde_json::to_value(l)))
                .collect::<Vec<_>>(),
            Entity::TodoItems => {
                let list_id = args.list_id.ok_or_else(|| {
                    Error::tool("query_database", "list_id is required for todo_items")
                })?;
                let list = ctx
                    .store
                    .get_todo_list(list_id)
                    .await?
                    .filter(|l| l.conversation_id == conv)
                    .ok_or_else(|| Error::not_found("todo list", list_id))?;
                ctx.store
                    .list_work_items(list.id)
                    .await?
                    .into_iter()
                    .map(|i| (i.task.clone(), serde_json::to_value(i)))
                    .collect()
            }
            Entity::Files => ctx
                .store
                .list_files(conv)
                .await?
                .into_iter()
                .map(|f| {
                    let text = format!("{} {}", f.path, f.content);
                    let row = serde_json::json!({ "path": f.path, "bytes": f.content.len() });
                    (text, Ok::<_, serde_json::Error>(row))
                })
                .collect(),
            Entity::Actions => ctx
                .store
                .list_actions(conv, MAX_LIMIT)
                .await?
                .into_iter()
                .map(|a| (format!("{} {}", a.tool_name, a.result_summary), serde_json::to_value(a)))
                .collect(),
            Entity::Turns => ctx
                .store
                .list_turns(conv)
                .await?
                .into_iter()
                .rev()
                .map(|t| (t.content.clone(), serde_json::to_value(t)))
                .collect(),
        };

        rows.into_iter()
            .map(|(text, value)| Ok((text, value?)))
            .collect()
    }
}

#[async_trait]
impl ToolHandler for QueryDatabase {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "query_database".into(),
            description: "Look up records of this conversation: todo lists, todo items, files, the action log, or past turns.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "entity": {
                        "type": "string",
                        "enum": ["todo_lists", "todo_items", "files", "actions", "turns"]
                    },
                    "filter": { "type": "string", "description": "Case-insensitive text filter" },
                    "list_id": { "type": "string", "description": "Todo list id (todo_items only)" },
                    "limit": { "type": "integer", "description": "Maximum rows (default 20, max 100)" }
                },
                "required": ["entity"]
            }),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Database
    }

    fn thinking(&self, args: &Value) -> String {
        format!("Querying {}", str_field(args, "entity").replace('_', " "))
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let args: QueryArgs = parse_args("query_database", args)?;
        let limit = args.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let needle = args.filter.as_deref().map(str::to_lowercase);

        let rows: Vec<Value> = self
            .rows(ctx, &args)
            .await?
            .into_iter()
            .filter(|(text, _)| match &needle {
                Some(n) => text.to_lowercase().contains(n.as_str()),
                None => true,
            })
            .take(limit)
            .map(|(_, v)| v)
            .collect();

        let count = rows.len();
        let body = serde_json::to_string_pretty(&rows)?;
        Ok(ToolOutput::feedback(
            format!("Query returned {count} rows:\n{body}"),
            format!("{count} rows"),
        ))
    }
}
