//! Observer registry shared by the rule store and the forward manager
//!
//! Notification works on a snapshot taken under the lock, so callbacks run
//! with no lock held and may re-enter the owner (e.g. remove a forward from
//! inside an event handler). A panicking listener is logged and skipped.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Handle returned by `add_listener`, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(u64);

pub(crate) struct ListenerSet<L: ?Sized> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Arc<L>)>>,
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Invoke `f` for every registered listener.
    ///
    /// Returns the number of listeners that panicked.
    pub fn notify<F>(&self, what: &str, f: F) -> usize
    where
        F: Fn(&L),
    {
        let snapshot: Vec<(ListenerId, Arc<L>)> = self.listeners.lock().clone();
        let mut failures = 0;
        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| f(&listener))).is_err() {
                failures += 1;
                error!("Listener {:?} panicked while handling {}", id, what);
            }
        }
        failures
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}
