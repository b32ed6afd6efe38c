use std::sync::Arc;

use tokio::sync::watch;

use crate::models::SyncState;

/// Shared, observable [`SyncState`]. Clones refer to the same state.
#[derive(Debug, Clone)]
pub struct SyncStateHandle {
    tx: Arc<watch::Sender<SyncState>>,
}

impl Default for SyncStateHandle {
    fn default() -> Self {
        Self::new(SyncState::default())
    }
}

impl SyncStateHandle {
    #[must_use]
    pub fn new(initial: SyncState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    #[must_use]
    pub fn snapshot(&self) -> SyncState {
        *self.tx.borrow()
    }

    /// Receiver notified on every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.tx.subscribe()
    }

    /// Record the current queue size. Callers pass the queue's own count, never a delta.
    pub fn set_pending(&self, count: usize) {
        self.tx.send_if_modified(|s| {
            let changed = s.pending_count != count;
            s.pending_count = count;
            changed
        });
    }

    /// Record connectivity. Returns `true` on an offline to online transition.
    pub fn set_online(&self, online: bool) -> bool {
        let mut came_online = false;
        self.tx.send_if_modified(|s| {
            if s.is_online == online {
                return false;
            }
            came_online = online;
            s.is_online = online;
            true
        });
        came_online
    }

    /// Claim the single drain slot. Returns `false` if a drain is already running.
    pub fn try_begin_sync(&self) -> bool {
        self.tx.send_if_modified(|s| {
            if s.is_syncing {
                false
            } else {
                s.is_syncing = true;
                true
            }
        })
    }

    pub fn end_sync(&self) {
        self.tx.send_if_modified(|s| std::mem::replace(&mut s.is_syncing, false));
    }
}
