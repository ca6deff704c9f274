//! Per-group subscribers to the engine's GC prologue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::engine::{GcCallbackFlags, GcType};

/// Callback invoked synchronously inside the GC prologue.
///
/// Runs while the engine is about to collect: it must not allocate on the
/// engine heap or anything else that could re-enter collection.
pub type GcCallback = Arc<dyn Fn(GcType, GcCallbackFlags) + Send + Sync>;

/// Handle returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcCallbackId(u64);

struct GcCallbackEntry {
    id: GcCallbackId,
    callback: GcCallback,
}

/// Ordered list of GC-prologue callbacks.
pub struct GcCallbackRegistry {
    entries: Mutex<Vec<GcCallbackEntry>>,
    next_id: AtomicU64,
    fired: AtomicU64,
}

impl Default for GcCallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GcCallbackRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            fired: AtomicU64::new(0),
        }
    }

    /// Add a callback; it fires after every callback registered before it.
    pub fn register<F>(&self, callback: F) -> GcCallbackId
    where
        F: Fn(GcType, GcCallbackFlags) + Send + Sync + 'static,
    {
        let id = GcCallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.entries
            .lock()
            .expect("gc callback registry poisoned")
            .push(GcCallbackEntry {
                id,
                callback: Arc::new(callback),
            });

        id
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn unregister(&self, id: GcCallbackId) -> bool {
        let mut entries = self.entries.lock().expect("gc callback registry poisoned");
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Invoke every callback in registration order.
    ///
    /// The list is copied first, so a callback may unregister itself (or
    /// others) without deadlocking; removals take effect on the next prologue.
    pub fn fire(&self, gc_type: GcType, flags: GcCallbackFlags) {
        let callbacks: Vec<GcCallback> = self
            .entries
            .lock()
            .expect("gc callback registry poisoned")
            .iter()
            .map(|entry| Arc::clone(&entry.callback))
            .collect();

        self.fired.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            "GC prologue {:?} ({} callbacks)",
            gc_type,
            callbacks.len()
        );

        for callback in callbacks {
            callback(gc_type, flags);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("gc callback registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of prologues dispatched to this registry.
    pub fn prologues_fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    /// Drop every callback. Returns how many were registered.
    pub fn clear(&self) -> usize {
        let entries = std::mem::take(&mut *self.entries.lock().expect("gc callback registry poisoned"));
        entries.len()
    }
}

impl std::fmt::Debug for GcCallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcCallbackRegistry")
            .field("callbacks", &self.len())
            .field("prologues_fired", &self.prologues_fired())
            .finish()
    }
}
