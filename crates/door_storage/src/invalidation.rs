//! Table invalidation notifications.
//!
//! Write transactions record which tables they touched. Once the
//! transaction commits, the backend hands that set to the tracker, which
//! calls every listener registered for at least one of those tables.
//!
//! Listeners run synchronously on the committing thread and must not block.
//! The usual listener just does a non-blocking send on a channel.

use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle returned when registering a listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback = Box<dyn Fn(&BTreeSet<String>) + Send + Sync>;

struct Listener {
    id: ListenerId,
    tables: BTreeSet<String>,
    callback: Callback,
}

/// Distributes table invalidations to registered listeners.
#[derive(Default)]
pub struct InvalidationTracker {
    listeners: RwLock<Vec<Listener>>,
    next_id: AtomicU64,
}

impl InvalidationTracker {
    /// Creates a tracker with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for changes to any of `tables`.
    ///
    /// The callback receives the full set of tables invalidated by the
    /// committing transaction.
    pub fn add_listener<I, S, F>(&self, tables: I, callback: F) -> ListenerId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&BTreeSet<String>) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let tables = tables
            .into_iter()
            .map(|t| t.into().to_ascii_lowercase())
            .collect();
        self.listeners.write().push(Listener {
            id,
            tables,
            callback: Box::new(callback),
        });
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Notifies listeners that `tables` changed.
    pub fn notify(&self, tables: &BTreeSet<String>) {
        if tables.is_empty() {
            return;
        }
        let lowered: BTreeSet<String> = tables.iter().map(|t| t.to_ascii_lowercase()).collect();
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            if listener.tables.iter().any(|t| lowered.contains(t)) {
                (listener.callback)(tables);
            }
        }
    }

    /// Returns the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl std::fmt::Debug for InvalidationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationTracker")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
