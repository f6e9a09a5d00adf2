//! Tool registry: builds the schema exposed to the model and dispatches
//! calls by name.

use std::collections::HashMap;
use std::sync::Arc;

use cf_domain::tool::ToolDefinition;

use crate::builtin;
use crate::handler::{ToolCategory, ToolHandler};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which tool categories a turn may see and call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolFilter {
    excluded: Vec<ToolCategory>,
}

impl ToolFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter for turns driven by the todo loop: no list management and
    /// no conversation management.
    pub fn nested() -> Self {
        Self::excluding([ToolCategory::Todo, ToolCategory::Conversation])
    }

    pub fn excluding(categories: impl IntoIterator<Item = ToolCategory>) -> Self {
        Self {
            excluded: categories.into_iter().collect(),
        }
    }

    pub fn allows(&self, category: ToolCategory) -> bool {
        !self.excluded.contains(&category)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    /// Registration order, so the schema sent to the model is stable.
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in tool.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.definition().name;
        if self.handlers.insert(name.clone(), handler).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Look up a handler the filter permits. A filtered-out tool is
    /// reported the same way as an unknown one.
    pub fn resolve(&self, name: &str, filter: &ToolFilter) -> Option<Arc<dyn ToolHandler>> {
        self.get(name).filter(|h| filter.allows(h.category()))
    }

    pub fn definitions(&self, filter: &ToolFilter) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.handlers.get(name))
            .filter(|h| filter.allows(h.category()))
            .map(|h| h.definition())
            .collect()
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registers_every_family() {
        let registry = ToolRegistry::builtin();
        for name in [
            "rename_conversation",
            "read_file",
            "query_database",
            "create_todo_item",
            "process_todo_list",
        ] {
            assert!(registry.get(name).is_some(), "missing {name}");
        }
    }

    #[test]
    fn nested_filter_hides_todo_and_conversation_tools() {
        let registry = ToolRegistry::builtin();
        let filter = ToolFilter::nested();
        let names: Vec<String> = registry
            .definitions(&filter)
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert!(names.contains(&"write_file".to_string()));
        assert!(!names.iter().any(|n| n.contains("todo")));
        assert!(!names.contains(&"rename_conversation".to_string()));
        assert!(registry.resolve("create_todo_item", &filter).is_none());
        assert!(registry.resolve("create_todo_item", &ToolFilter::all()).is_some());
    }

    #[test]
    fn definitions_follow_registration_order() {
        let registry = ToolRegistry::builtin();
        let defs = registry.definitions(&ToolFilter::all());
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, registry.names().iter().map(String::as_str).collect::<Vec<_>>());
    }
}
