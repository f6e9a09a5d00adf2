//! Conversation management: rename, pin, delete.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use cf_domain::error::{Error, Result};
use cf_domain::model::EntityRef;
use cf_domain::tool::ToolDefinition;

use crate::handler::{parse_args, str_field, ToolCategory, ToolContext, ToolHandler, ToolOutput};

/// Longest conversation name accepted; longer names are cut.
pub const MAX_NAME_CHARS: usize = 50;

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ── rename_conversation ────────────────────────────────────────────

pub struct RenameConversation;

#[derive(Deserialize)]
struct RenameArgs {
    name: String,
}

#[async_trait]
impl ToolHandler for RenameConversation {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "rename_conversation".into(),
            description: format!(
                "Rename the current conversation. Names longer than {MAX_NAME_CHARS} characters are truncated."
            ),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "New conversation name" }
                },
                "required": ["name"]
            }),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Conversation
    }

    fn thinking(&self, args: &Value) -> String {
        format!("Renaming conversation to \"{}\"", str_field(args, "name"))
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let args: RenameArgs = parse_args("rename_conversation", args)?;
        let name = truncate_chars(args.name.trim(), MAX_NAME_CHARS);
        if name.is_empty() {
            return Err(Error::tool("rename_conversation", "name must not be empty"));
        }
        let conv = ctx.store.rename_conversation(ctx.conversation_id, &name).await?;
        Ok(ToolOutput::inline(
            format!("Renamed the conversation to \"{}\".", conv.name),
            format!("renamed to \"{}\"", conv.name),
        )
        .with_entity(EntityRef::new(conv.id, conv.name, "conversation")))
    }
}

// ── pin_conversation ───────────────────────────────────────────────

pub struct PinConversation;

#[derive(Deserialize)]
struct PinArgs {
    #[serde(default = "d_true")]
    pinned: bool,
}

fn d_true() -> bool {
    true
}

#[async_trait]
impl ToolHandler for PinConversation {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "pin_conversation".into(),
            description: "Pin or unpin the current conversation.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "pinned": { "type": "boolean", "description": "true to pin, false to unpin (default true)" }
                }
            }),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Conversation
    }

    fn thinking(&self, args: &Value) -> String {
        if args.get("pinned").and_then(Value::as_bool) == Some(false) {
            "Unpinning conversation".into()
        } else {
            "Pinning conversation".into()
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let args: PinArgs = parse_args("pin_conversation", args)?;
        let conv = ctx.store.set_pinned(ctx.conversation_id, args.pinned).await?;
        let verb = if conv.pinned { "Pinned" } else { "Unpinned" };
        Ok(ToolOutput::inline(
            format!("{verb} this conversation."),
            verb.to_lowercase(),
        )
        .with_entity(EntityRef::new(conv.id, conv.name, "conversation")))
    }
}

// ── delete_conversation ────────────────────────────────────────────

pub struct DeleteConversation;

#[async_trait]
impl ToolHandler for DeleteConversation {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "delete_conversation".into(),
            description: "Delete the current conversation with its files and todo lists.".into(),
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Conversation
    }

    fn thinking(&self, _args: &Value) -> String {
        "Deleting conversation".into()
    }

    async fn execute(&self, ctx: &ToolContext, _args: Value) -> Result<ToolOutput> {
        let conv = ctx
            .store
            .get_conversation(ctx.conversation_id)
            .await?
            .ok_or_else(|| Error::not_found("conversation", ctx.conversation_id))?;
        ctx.store.delete_conversation(conv.id).await?;
        Ok(ToolOutput::inline("This conversation has been deleted.", "deleted")
            .with_entity(EntityRef::new(conv.id, conv.name, "conversation")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_counts_characters() {
        let long = "é".repeat(60);
        assert_eq!(truncate_chars(&long, MAX_NAME_CHARS).chars().count(), 50);
        assert_eq!(truncate_chars("Project X", MAX_NAME_CHARS), "Project X");
    }
}
