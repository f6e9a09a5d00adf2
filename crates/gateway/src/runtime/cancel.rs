//! Cancellation: a registry of running work and the bridge that turns an
//! externally written `aborted` status into a fired token.
//!
//! Every running turn (and every background todo run) registers a
//! [`CancellationToken`] in the [`CancelMap`]. Nested turns use child
//! tokens, so cancelling an enclosing turn cascades to everything it
//! started.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cf_domain::model::TurnStatus;
use cf_store::{Store, Subscriptions};

use crate::runtime::sink::schedule_chunk_purge;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CancelMap
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tracks tokens of running turns and todo runs by id.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a fresh token. Replaces any token already
    /// registered under `id`.
    pub fn register(&self, id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().insert(id, token.clone());
        token
    }

    /// Register a token that also fires when `parent` does.
    pub fn register_child(&self, id: Uuid, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.tokens.lock().insert(id, token.clone());
        token
    }

    /// Fire the token for `id`. Returns `true` if one was registered.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.tokens.lock().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: Uuid) {
        self.tokens.lock().remove(&id);
    }

    pub fn is_running(&self, id: Uuid) -> bool {
        self.tokens.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CancelScope (turn-record bridge)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cancellation scope of one turn.
///
/// Watches the turn record; when its status becomes `aborted` the token
/// fires and the turn's chunks are purged after the configured delay.
/// Dropping the scope stops the watcher and unregisters the token.
pub struct CancelScope {
    turn_id: Uuid,
    token: CancellationToken,
    cancels: Arc<CancelMap>,
    watcher: JoinHandle<()>,
}

impl CancelScope {
    pub fn open(
        turn_id: Uuid,
        parent: Option<&CancellationToken>,
        cancels: Arc<CancelMap>,
        store: Arc<dyn Store>,
        subs: Arc<dyn Subscriptions>,
        purge_delay: Duration,
    ) -> Self {
        let token = match parent {
            Some(parent) => cancels.register_child(turn_id, parent),
            None => cancels.register(turn_id),
        };
        let watcher = tokio::spawn(watch_for_abort(
            turn_id,
            token.clone(),
            store,
            subs,
            purge_delay,
        ));
        Self {
            turn_id,
            token,
            cancels,
            watcher,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for CancelScope {
    fn drop(&mut self) {
        self.watcher.abort();
        self.cancels.remove(self.turn_id);
    }
}

async fn watch_for_abort(
    turn_id: Uuid,
    token: CancellationToken,
    store: Arc<dyn Store>,
    subs: Arc<dyn Subscriptions>,
    purge_delay: Duration,
) {
    let mut updates = subs.watch_turn(turn_id);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            next = updates.next() => match next {
                Some(Some(turn)) if turn.status == TurnStatus::Aborted => {
                    tracing::info!(%turn_id, "turn aborted externally");
                    token.cancel();
                    schedule_chunk_purge(store, turn_id, purge_delay);
                    return;
                }
                Some(Some(_)) => {}
                Some(None) | None => return,
            },
        }
    }
}
