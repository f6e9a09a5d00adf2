//! Built-in tool handlers.

pub mod conversation;
pub mod database;
pub mod files;
pub mod todo;

use std::sync::Arc;

use crate::registry::ToolRegistry;

/// Tools whose repeats are checked by the duplicate guard.
pub const MUTATING_TOOLS: &[&str] = &[
    "create_todo_list",
    "update_todo_list",
    "delete_todo_list",
    "create_todo_item",
    "update_todo_item",
    "delete_todo_item",
];

pub fn is_mutating(tool_name: &str) -> bool {
    MUTATING_TOOLS.contains(&tool_name)
}

pub(crate) fn register_all(registry: &mut ToolRegistry) {
    registry.register(Arc::new(conversation::RenameConversation));
    registry.register(Arc::new(conversation::PinConversation));
    registry.register(Arc::new(conversation::DeleteConversation));

    registry.register(Arc::new(files::WriteFile));
    registry.register(Arc::new(files::ReadFile));
    registry.register(Arc::new(files::ListFiles));

    registry.register(Arc::new(database::QueryDatabase));

    registry.register(Arc::new(todo::CreateTodoList));
    registry.register(Arc::new(todo::UpdateTodoList));
    registry.register(Arc::new(todo::DeleteTodoList));
    registry.register(Arc::new(todo::ListTodoLists));
    registry.register(Arc::new(todo::CreateTodoItem));
    registry.register(Arc::new(todo::UpdateTodoItem));
    registry.register(Arc::new(todo::DeleteTodoItem));
    registry.register(Arc::new(todo::ListTodoItems));
    registry.register(Arc::new(todo::ProcessTodoList));
}
