//! Deferred disposal of engine objects whose host reference was collected.
//!
//! ## Problem
//!
//! Engine objects must be disposed on the owning thread. The host collector
//! finalizes their wrappers on whatever thread it likes, often a dedicated
//! finalizer thread that must never block on the engine.
//!
//! ## Solution
//!
//! Finalizers push the object onto a lock-protected queue (producer side,
//! any thread). The owning thread is the only consumer: it takes the whole
//! queue and disposes each object in the next wake cycle, before any task
//! queued in that cycle runs.
//!
//! Contexts get one extra rule: if the process running in a zombie context
//! is still active, it is forced to exit with [`EXIT_COLLECTED_WHILE_ACTIVE`]
//! before disposal, so it cannot keep running after its host handle vanished.
//!
//! Once the group is disposed the registry is closed. The closed flag lives
//! under the same lock as the queues, so a push either lands before the
//! final drain or is refused.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::engine::{ManagedContext, ManagedValue};

/// Exit code given to a process whose context was collected while it was still running.
pub const EXIT_COLLECTED_WHILE_ACTIVE: i32 = -100;

#[derive(Default)]
struct ZombieLists {
    values: Vec<Arc<dyn ManagedValue>>,
    contexts: Vec<Arc<dyn ManagedContext>>,
    closed: bool,
}

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreedZombies {
    pub values: usize,
    pub contexts: usize,
    /// Contexts that had to be forced to exit first
    pub forced_exits: usize,
}

impl FreedZombies {
    pub fn total(&self) -> usize {
        self.values + self.contexts
    }
}

/// Per-group zombie queues.
pub struct ZombieRegistry {
    lists: Mutex<ZombieLists>,

    /// Fast check for pending items (avoids lock acquisition on hot path)
    pending_count: AtomicU64,
}

impl Default for ZombieRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ZombieRegistry {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(ZombieLists::default()),
            pending_count: AtomicU64::new(0),
        }
    }

    /// Queue a value for disposal. Callable from any thread.
    ///
    /// Returns `false` once the registry is closed; the value is then left alone.
    pub fn push_value(&self, value: Arc<dyn ManagedValue>) -> bool {
        let mut lists = self.lists.lock().expect("zombie registry poisoned");
        if lists.closed {
            return false;
        }

        lists.values.push(value);
        self.pending_count.fetch_add(1, Ordering::Release);

        tracing::trace!("Value zombie queued (pending: {})", self.len());
        true
    }

    /// Queue a context for disposal. Callable from any thread.
    pub fn push_context(&self, context: Arc<dyn ManagedContext>) -> bool {
        let mut lists = self.lists.lock().expect("zombie registry poisoned");
        if lists.closed {
            return false;
        }

        lists.contexts.push(context);
        self.pending_count.fetch_add(1, Ordering::Release);

        tracing::trace!("Context zombie queued (pending: {})", self.len());
        true
    }

    /// Refuse every later push. What is already queued stays for `free_all`.
    pub fn close(&self) {
        self.lists.lock().expect("zombie registry poisoned").closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lists.lock().expect("zombie registry poisoned").closed
    }

    /// Lock-free check for queued zombies.
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.pending_count.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.pending_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    /// Dispose everything queued so far. Owning thread only.
    ///
    /// The queues are taken under the lock and disposed outside it, so
    /// finalizers can keep pushing while a drain is in progress; whatever
    /// they push lands in the next drain.
    ///
    /// The whole batch is always disposed. A context collected while its
    /// process was still active is counted in `forced_exits`; the caller
    /// decides whether that is fatal.
    pub fn free_all(&self) -> FreedZombies {
        if !self.has_pending() {
            return FreedZombies::default();
        }

        let (values, contexts) = {
            let mut lists = self.lists.lock().expect("zombie registry poisoned");
            let values = std::mem::take(&mut lists.values);
            let contexts = std::mem::take(&mut lists.contexts);
            let count = (values.len() + contexts.len()) as u64;
            self.pending_count.fetch_sub(count, Ordering::Release);
            (values, contexts)
        };

        let mut freed = FreedZombies::default();

        for value in values {
            value.dispose();
            freed.values += 1;
        }

        for context in contexts {
            if context.is_active() {
                context.exit(EXIT_COLLECTED_WHILE_ACTIVE);
                freed.forced_exits += 1;
                log::error!(
                    "Context was collected but its process was still running; forced exit with code {}",
                    EXIT_COLLECTED_WHILE_ACTIVE
                );
            }

            context.dispose();
            freed.contexts += 1;
        }

        tracing::trace!(
            "Freed {} value zombies and {} context zombies",
            freed.values,
            freed.contexts
        );

        freed
    }
}

impl std::fmt::Debug for ZombieRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZombieRegistry")
            .field("pending_count", &self.len())
            .finish()
    }
}
