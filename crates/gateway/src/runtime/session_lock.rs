//! Per-conversation turn exclusivity.
//!
//! At most one top-level turn runs per conversation. A start request
//! arriving while a turn is in flight is rejected rather than queued.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Each conversation maps to a `Semaphore(1)`; the permit is held by the
/// spawned turn task and released when it finishes.
#[derive(Default)]
pub struct ConversationLocks {
    locks: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, conversation_id: Uuid) -> Result<OwnedSemaphorePermit, ConversationBusy> {
        let sem = self
            .locks
            .lock()
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();
        sem.try_acquire_owned()
            .map_err(|_| ConversationBusy { conversation_id })
    }

    pub fn is_busy(&self, conversation_id: Uuid) -> bool {
        self.locks
            .lock()
            .get(&conversation_id)
            .is_some_and(|sem| sem.available_permits() == 0)
    }

    /// Number of tracked conversations.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }

    /// Drop entries whose permit is not held.
    pub fn prune_idle(&self) {
        self.locks
            .lock()
            .retain(|_, sem| sem.available_permits() == 0);
    }
}

/// A turn is already in progress for the conversation.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("conversation {conversation_id} is busy: a turn is already in progress")]
pub struct ConversationBusy {
    pub conversation_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_rejected_until_release() {
        let locks = ConversationLocks::new();
        let conv = Uuid::new_v4();

        let permit = locks.try_acquire(conv).unwrap();
        assert!(locks.is_busy(conv));
        let err = locks.try_acquire(conv).unwrap_err();
        assert_eq!(err.conversation_id, conv);

        drop(permit);
        assert!(!locks.is_busy(conv));
        assert!(locks.try_acquire(conv).is_ok());
    }

    #[test]
    fn conversations_are_independent() {
        let locks = ConversationLocks::new();
        let _a = locks.try_acquire(Uuid::new_v4()).unwrap();
        let _b = locks.try_acquire(Uuid::new_v4()).unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn prune_keeps_held_locks() {
        let locks = ConversationLocks::new();
        let held = Uuid::new_v4();
        let _permit = locks.try_acquire(held).unwrap();
        drop(locks.try_acquire(Uuid::new_v4()).unwrap());

        locks.prune_idle();
        assert_eq!(locks.len(), 1);
        assert!(locks.is_busy(held));
    }
}
