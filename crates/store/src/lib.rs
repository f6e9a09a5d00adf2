//! Durable-store and change-subscription contracts plus the in-memory
//! backend used by the gateway and the test suites.

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::{Store, Subscriptions};
