//! Virtual files scoped to a conversation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use cf_domain::error::{Error, Result};
use cf_domain::model::EntityRef;
use cf_domain::tool::ToolDefinition;

use crate::handler::{parse_args, str_field, ToolCategory, ToolContext, ToolHandler, ToolOutput};

/// Normalize a virtual path: relative, `/`-separated, no `.` or `..`
/// segments, no empty segments.
pub fn normalize_path(requested: &str) -> std::result::Result<String, String> {
    let trimmed = requested.trim();
    if trimmed.is_empty() {
        return Err("path must not be empty".into());
    }
    if trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(format!("absolute paths are not allowed (got '{trimmed}')"));
    }
    let mut parts = Vec::new();
    for segment in trimmed.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err("path must not contain '..' components".into()),
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        return Err("path must name a file".into());
    }
    Ok(parts.join("/"))
}

fn path_arg(tool: &str, raw: &str) -> Result<String> {
    normalize_path(raw).map_err(|e| Error::tool(tool, e))
}

// ── write_file ─────────────────────────────────────────────────────

pub struct WriteFile;

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

#[async_trait]
impl ToolHandler for WriteFile {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "write_file".into(),
            description: "Create or overwrite a text file in this conversation.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Relative file path" },
                    "content": { "type": "string", "description": "Full file content" }
                },
                "required": ["path", "content"]
            }),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Files
    }

    fn thinking(&self, args: &Value) -> String {
        format!("Writing {}", str_field(args, "path"))
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let args: WriteArgs = parse_args("write_file", args)?;
        let path = path_arg("write_file", &args.path)?;
        let file = ctx
            .store
            .write_file(ctx.conversation_id, &path, &args.content)
            .await?;
        let bytes = file.content.len();
        Ok(ToolOutput::inline(
            format!("Saved `{}` ({bytes} bytes).", file.path),
            format!("wrote {bytes} bytes"),
        )
        .with_entity(EntityRef::new(&file.path, &file.path, "file")))
    }
}

// ── read_file ──────────────────────────────────────────────────────

pub struct ReadFile;

#[derive(Deserialize)]
struct ReadArgs {
    path: String,
}

#[async_trait]
impl ToolHandler for ReadFile {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file".into(),
            description: "Read a text file from this conversation.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Relative file path" }
                },
                "required": ["path"]
            }),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Files
    }

    fn thinking(&self, args: &Value) -> String {
        format!("Reading {}", str_field(args, "path"))
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let args: ReadArgs = parse_args("read_file", args)?;
        let path = path_arg("read_file", &args.path)?;
        let file = ctx
            .store
            .read_file(ctx.conversation_id, &path)
            .await?
            .ok_or_else(|| Error::not_found("file", &path))?;
        Ok(ToolOutput::feedback(
            format!("Contents of `{}`:\n```\n{}\n```", file.path, file.content),
            format!("read {} bytes", file.content.len()),
        )
        .with_entity(EntityRef::new(&file.path, &file.path, "file")))
    }
}

// ── list_files ─────────────────────────────────────────────────────

pub struct ListFiles;

#[async_trait]
impl ToolHandler for ListFiles {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_files".into(),
            description: "List the files stored in this conversation.".into(),
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Files
    }

    fn thinking(&self, _args: &Value) -> String {
        "Listing files".into()
    }

    async fn execute(&self, ctx: &ToolContext, _args: Value) -> Result<ToolOutput> {
        let files = ctx.store.list_files(ctx.conversation_id).await?;
        let listing = if files.is_empty() {
            "No files in this conversation.".to_string()
        } else {
            let lines: Vec<String> = files
                .iter()
                .map(|f| format!("- {} ({} bytes)", f.path, f.content.len()))
                .collect();
            format!("Files in this conversation:\n{}", lines.join("\n"))
        };
        Ok(ToolOutput::feedback(listing, format!("{} files", files.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_dot_segments_and_separators() {
        assert_eq!(normalize_path("./notes//todo.md").unwrap(), "notes/todo.md");
        assert_eq!(normalize_path("a\\b.txt").unwrap(), "a/b.txt");
    }

    #[test]
    fn rejects_escapes_and_absolute_paths() {
        assert!(normalize_path("../secret").is_err());
        assert!(normalize_path("/etc/passwd").is_err());
        assert!(normalize_path("  ").is_err());
        assert!(normalize_path("./").is_err());
    }
}
