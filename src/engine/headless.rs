//! An engine with no VM behind it.
//!
//! Instances have an identity, a GC-prologue hook and a lifecycle, but no
//! heap: collections only happen when the host asks for one through an
//! [`InstanceMonitor`]. `HeadlessValue` and `HeadlessContext` are matching
//! engine objects that record how they were disposed.
//!
//! Useful for embedding hosts that want to exercise their threading and
//! finalization wiring without linking a real engine.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use bytes::Bytes;

use super::{
    Engine, EngineInstance, GcCallbackFlags, GcType, InstanceKey, InstanceParams, ManagedContext,
    ManagedValue,
};
use crate::error::GroupError;

/// Keys are unique across all headless engines in the process
static NEXT_KEY: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Default)]
struct MonitorState {
    hook_installed: AtomicBool,
    destroyed: AtomicBool,
}

/// Host-side view of a headless instance, usable from any thread.
#[derive(Debug, Clone)]
pub struct InstanceMonitor {
    key: InstanceKey,
    snapshot: Option<Bytes>,
    state: Arc<MonitorState>,
}

impl InstanceMonitor {
    pub fn key(&self) -> InstanceKey {
        self.key
    }

    /// The snapshot the instance was seeded from, if any.
    pub fn snapshot(&self) -> Option<&Bytes> {
        self.snapshot.as_ref()
    }

    pub fn hook_installed(&self) -> bool {
        self.state.hook_installed.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> bool {
        self.state.destroyed.load(Ordering::SeqCst)
    }

    /// Run a collection: fires the GC prologue if the hook is installed.
    ///
    /// Returns whether the prologue reached a group.
    pub fn collect_garbage(&self, gc_type: GcType, flags: GcCallbackFlags) -> bool {
        if !self.hook_installed() || self.destroyed() {
            return false;
        }

        crate::gc::dispatch_gc_prologue(self.key, gc_type, flags)
    }
}

/// Engine producing [`HeadlessInstance`]s.
#[derive(Debug, Default)]
pub struct HeadlessEngine {
    created: Mutex<Vec<InstanceMonitor>>,
}

impl HeadlessEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an instance directly, e.g. to hand to a borrowed group.
    pub fn instance(&self, snapshot: Option<Bytes>) -> HeadlessInstance {
        let key = InstanceKey::from_raw(NEXT_KEY.fetch_add(1, Ordering::Relaxed));
        let monitor = InstanceMonitor {
            key,
            snapshot,
            state: Arc::new(MonitorState::default()),
        };

        self.created
            .lock()
            .expect("headless engine poisoned")
            .push(monitor.clone());

        log::debug!("Created headless instance {:?}", key);

        HeadlessInstance { monitor }
    }

    /// Monitors for every instance created so far, oldest first.
    pub fn monitors(&self) -> Vec<InstanceMonitor> {
        self.created.lock().expect("headless engine poisoned").clone()
    }

    pub fn last_monitor(&self) -> Option<InstanceMonitor> {
        self.created
            .lock()
            .expect("headless engine poisoned")
            .last()
            .cloned()
    }
}

impl Engine for HeadlessEngine {
    fn create_instance(&self, params: InstanceParams) -> Result<Box<dyn EngineInstance>, GroupError> {
        Ok(Box::new(self.instance(params.snapshot)))
    }
}

/// A headless engine instance.
#[derive(Debug)]
pub struct HeadlessInstance {
    monitor: InstanceMonitor,
}

impl HeadlessInstance {
    pub fn monitor(&self) -> InstanceMonitor {
        self.monitor.clone()
    }
}

impl EngineInstance for HeadlessInstance {
    fn key(&self) -> InstanceKey {
        self.monitor.key
    }

    fn install_gc_prologue_hook(&mut self) {
        self.monitor.state.hook_installed.store(true, Ordering::SeqCst);
    }

    fn remove_gc_prologue_hook(&mut self) {
        self.monitor.state.hook_installed.store(false, Ordering::SeqCst);
    }

    fn destroy(self: Box<Self>) {
        self.monitor.state.destroyed.store(true, Ordering::SeqCst);
        log::debug!("Destroyed headless instance {:?}", self.monitor.key);
    }
}

/// A value that counts effective disposals and remembers the disposing thread.
#[derive(Debug, Default)]
pub struct HeadlessValue {
    disposed: AtomicBool,
    dispose_calls: AtomicUsize,
    disposed_on: Mutex<Option<ThreadId>>,
}

impl HeadlessValue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Number of `dispose` calls, including repeated ones.
    pub fn dispose_calls(&self) -> usize {
        self.dispose_calls.load(Ordering::SeqCst)
    }

    /// Thread that performed the first disposal.
    pub fn disposed_on(&self) -> Option<ThreadId> {
        *self.disposed_on.lock().expect("headless value poisoned")
    }
}

impl ManagedValue for HeadlessValue {
    fn dispose(&self) {
        self.dispose_calls.fetch_add(1, Ordering::SeqCst);

        if !self.disposed.swap(true, Ordering::SeqCst) {
            *self.disposed_on.lock().expect("headless value poisoned") = Some(thread::current().id());
        }
    }
}

/// A context whose "process" can be running or finished.
#[derive(Debug, Default)]
pub struct HeadlessContext {
    active: AtomicBool,
    disposed: AtomicBool,
    exit_codes: Mutex<Vec<i32>>,
    disposed_on: Mutex<Option<ThreadId>>,
}

impl HeadlessContext {
    /// A context whose process is still running.
    pub fn running() -> Arc<Self> {
        let ctx = Self::default();
        ctx.active.store(true, Ordering::SeqCst);
        Arc::new(ctx)
    }

    /// A context whose process already exited.
    pub fn finished() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Every exit code this context was asked to exit with.
    pub fn exit_codes(&self) -> Vec<i32> {
        self.exit_codes.lock().expect("headless context poisoned").clone()
    }

    pub fn disposed_on(&self) -> Option<ThreadId> {
        *self.disposed_on.lock().expect("headless context poisoned")
    }
}

impl ManagedContext for HeadlessContext {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.is_disposed()
    }

    fn exit(&self, code: i32) {
        self.exit_codes
            .lock()
            .expect("headless context poisoned")
            .push(code);
        self.active.store(false, Ordering::SeqCst);
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            *self.disposed_on.lock().expect("headless context poisoned") =
                Some(thread::current().id());
        }
    }
}
