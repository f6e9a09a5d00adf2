//! Core runtime: the turn engine and the pieces it is built from.
//!
//! Entry point: [`TurnEngine::run_turn`] drives one assistant reply
//! against the store, the provider, and the tool registry, and writes the
//! terminal state to the turn record. [`TodoProcessor`] reuses the engine
//! to work through a todo list with nested turns.

pub mod action_log;
pub mod assembler;
pub mod cancel;
pub mod duplicate;
pub mod prompt;
pub mod session_lock;
pub mod sink;
pub mod todo;
pub mod turn;

pub use action_log::ActionLog;
pub use cancel::{CancelMap, CancelScope};
pub use session_lock::{ConversationBusy, ConversationLocks};
pub use todo::{TodoProcessor, TodoRun};
pub use turn::{TurnEngine, TurnOutcome, TurnRequest};
