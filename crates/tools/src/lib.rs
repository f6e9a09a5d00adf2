//! Tools the agent can invoke mid-generation.
//!
//! - [`handler`]: the `ToolHandler` trait and the values passed in and out
//! - [`registry`]: name -> handler mapping with category filters
//! - [`builtin`]: conversation, file, database, and todo tools

pub mod builtin;
pub mod handler;
pub mod registry;
pub mod similarity;

pub use handler::{
    ProcessListRequest, TodoDriver, ToolCategory, ToolContext, ToolHandler, ToolOutput,
};
pub use registry::{ToolFilter, ToolRegistry};
