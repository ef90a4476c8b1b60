use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::types::SubscriptionId;

/// A set of callbacks that can be added, removed and fired.
///
/// Firing works on a snapshot, so callbacks may (un)register listeners
/// while being called. A panicking callback is logged and skipped; the
/// remaining callbacks still run.
pub struct ListenerSet<T: ?Sized> {
    label: &'static str,
    next_id: AtomicU64,
    entries: Mutex<Vec<(SubscriptionId, Arc<T>)>>,
}

impl<T: ?Sized> ListenerSet<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<T>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Remove and return every listener.
    pub fn drain(&self) -> Vec<Arc<T>> {
        self.entries.lock().drain(..).map(|(_, l)| l).collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries.lock().iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    /// Call `f` for every listener, isolating panics.
    pub fn emit(&self, mut f: impl FnMut(&T)) {
        for listener in self.snapshot() {
            guarded(self.label, || f(&listener));
        }
    }
}

/// Run a user callback; a panic is logged instead of unwinding into the caller.
pub fn guarded(label: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        warn!(listener = label, panic = %panic_message(&*panic), "listener panicked");
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
