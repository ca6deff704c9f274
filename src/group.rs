//! Context group: the coordinator around one engine instance.
//!
//! A `ContextGroup` owns (or borrows) an engine instance and lives on the
//! thread that created it; it is deliberately `!Send`, so every owner-only
//! operation (dispose, manage, free zombies, GC callback registration) is
//! fenced by the type system. Other threads talk to the group through a
//! `ContextGroupHandle`, which only exposes the two cross-thread surfaces:
//!
//! - zombie marking (host wrapper collected → dispose on the owning thread)
//! - task submission (async or blocking)
//!
//! Both lazily arm a wake handle on the owning thread's event loop. When it
//! fires, the owning thread drains zombies, then runs tasks in FIFO order,
//! then retires the handle so the loop is not kept alive artificially.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, ThreadId};

use bytes::Bytes;

use crate::config::GroupConfig;
use crate::engine::{
    Engine, EngineInstance, GcCallbackFlags, GcType, InstanceKey, InstanceParams, ManagedContext,
    ManagedValue,
};
use crate::error::GroupError;
use crate::event_loop::{EventLoop, LoopPreserver, TokioEventLoop, WakeHandler};
use crate::gc::{self, FreedZombies, GcCallbackId, GcCallbackRegistry, ZombieRegistry};
use crate::platform::{EnginePlatform, PlatformLease};
use crate::task::{PendingTask, TaskQueue};

/// State reachable from any thread.
struct Shared {
    owner: ThreadId,
    key: InstanceKey,
    event_loop: Arc<dyn EventLoop>,
    tasks: TaskQueue,
    zombies: ZombieRegistry,
    gc_callbacks: Arc<GcCallbackRegistry>,
    defunct: AtomicBool,
    strict_reference_checks: bool,
    this: Weak<Shared>,
}

impl Shared {
    fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::Acquire)
    }

    fn is_self(&self, ptr: *const ()) -> bool {
        std::ptr::eq(ptr, self as *const Shared as *const ())
    }

    fn wake_handler(&self) -> WakeHandler {
        let this = self.this.clone();

        Arc::new(move || {
            if let Some(shared) = this.upgrade() {
                shared.on_wake();
            }
        })
    }

    /// Returns `false` once the group's queue is closed.
    fn arm(&self, task: Option<PendingTask>) -> bool {
        self.tasks
            .push_and_arm(task, || self.event_loop.create_wake(self.wake_handler()))
    }

    /// Wake handler body, on the owning thread.
    fn on_wake(&self) {
        if thread::current().id() != self.owner {
            log::error!(
                "Context group {:?} woken on {:?} instead of its owner {:?}; work stays queued",
                self.key,
                thread::current().id(),
                self.owner
            );
            self.tasks.retire();
            return;
        }

        let _rearm = RearmOnUnwind(self);

        loop {
            if self.is_defunct() {
                self.tasks.retire();
                return;
            }

            self.free_zombies();

            // Re-checked after every run: a task may enqueue more tasks
            while let Some(task) = self.tasks.pop() {
                task.run();
            }

            if self.tasks.retire_if_idle(|| self.zombies.has_pending()) {
                return;
            }
        }
    }

    fn free_zombies(&self) -> FreedZombies {
        let freed = self.zombies.free_all();
        self.check_forced_exits(&freed);
        freed
    }

    /// With strict checks, a forced exit means the host dropped a reference
    /// it should have kept. Called once the whole batch is disposed.
    fn check_forced_exits(&self, freed: &FreedZombies) {
        if self.strict_reference_checks && freed.forced_exits > 0 {
            panic!(
                "{} context(s) of group {:?} were collected while their process was still running",
                freed.forced_exits, self.key
            );
        }
    }

    fn mark_zombie_value(&self, value: Arc<dyn ManagedValue>) -> bool {
        if self.is_self(Arc::as_ptr(&value) as *const ()) {
            return false;
        }

        if !self.zombies.push_value(value) {
            log::debug!("Ignoring value zombie for defunct group {:?}", self.key);
            return false;
        }

        self.arm(None);
        true
    }

    fn mark_zombie_context(&self, context: Arc<dyn ManagedContext>) -> bool {
        if self.is_self(Arc::as_ptr(&context) as *const ()) {
            return false;
        }

        if !self.zombies.push_context(context) {
            log::debug!("Ignoring context zombie for defunct group {:?}", self.key);
            return false;
        }

        self.arm(None);
        true
    }

    fn submit(&self, task: PendingTask) -> Result<(), GroupError> {
        if self.is_defunct() || !self.arm(Some(task)) {
            return Err(GroupError::Defunct);
        }

        Ok(())
    }
}

/// Keeps a group serviceable when a task or a strict check panics mid-cycle:
/// the dead handle is retired and, if work is left, a fresh one is armed.
struct RearmOnUnwind<'a>(&'a Shared);

impl Drop for RearmOnUnwind<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }

        let shared = self.0;
        shared.tasks.retire();

        if !shared.tasks.is_empty() || shared.zombies.has_pending() {
            shared.arm(None);
        }
    }
}

/// A group can stand in for a managed value, so hosts can wrap it the same
/// way they wrap engine objects. It is never zombie-tracked, and disposing
/// it through this path does nothing: the group goes away with
/// `ContextGroup::dispose`.
impl ManagedValue for Shared {
    fn dispose(&self) {
        tracing::trace!("Ignoring value-style dispose of group {:?}", self.key);
    }
}

/// Completion slot for `submit_sync`.
struct Completion<T> {
    slot: Mutex<Option<T>>,
    done: Condvar,
}

impl<T> Completion<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, value: T) {
        *self.slot.lock().expect("completion slot poisoned") = Some(value);
        self.done.notify_one();
    }

    fn wait(&self) -> T {
        let mut slot = self.slot.lock().expect("completion slot poisoned");

        loop {
            // Spurious wake-ups leave the slot empty; keep waiting
            if let Some(value) = slot.take() {
                return value;
            }

            slot = self.done.wait(slot).expect("completion slot poisoned");
        }
    }
}

/// Cross-thread handle to a context group.
#[derive(Clone)]
pub struct ContextGroupHandle {
    shared: Arc<Shared>,
}

impl ContextGroupHandle {
    /// Queue a value whose host reference was collected. Any thread; never blocks
    /// on the owning thread.
    ///
    /// Returns whether the value was queued. A disposed group refuses it, and
    /// it is then never disposed through this group.
    pub fn mark_zombie_value(&self, value: Arc<dyn ManagedValue>) -> bool {
        self.shared.mark_zombie_value(value)
    }

    /// Queue a context whose host reference was collected. Any thread.
    pub fn mark_zombie_context(&self, context: Arc<dyn ManagedContext>) -> bool {
        self.shared.mark_zombie_context(context)
    }

    /// Queue a task; returns immediately.
    pub fn submit(&self, task: PendingTask) -> Result<(), GroupError> {
        self.shared.submit(task)
    }

    /// Queue a closure; returns immediately.
    pub fn submit_async<F>(&self, f: F) -> Result<(), GroupError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.submit(PendingTask::closure(f))
    }

    /// Run `f` on the owning thread and wait for its result.
    ///
    /// Fails with `OwnerThread` when called from the owning thread itself.
    /// If the group is disposed before the task starts, the task is dropped
    /// and this call never returns.
    pub fn submit_sync<T, F>(&self, f: F) -> Result<T, GroupError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let current = thread::current().id();
        if current == self.shared.owner {
            return Err(GroupError::OwnerThread(current));
        }

        let completion = Arc::new(Completion::new());
        let signal = Arc::clone(&completion);

        self.shared
            .submit(PendingTask::closure(move || signal.complete(f())))?;

        Ok(completion.wait())
    }

    /// Hold the owning loop alive until the returned preserver is dropped.
    pub fn keep_alive(&self) -> LoopPreserver {
        LoopPreserver::new(&*self.shared.event_loop)
    }

    /// This group as a managed value (never zombie-tracked).
    pub fn as_managed_value(&self) -> Arc<dyn ManagedValue> {
        Arc::clone(&self.shared) as Arc<dyn ManagedValue>
    }

    pub fn is_on_thread(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    pub fn owner_thread(&self) -> ThreadId {
        self.shared.owner
    }

    pub fn is_defunct(&self) -> bool {
        self.shared.is_defunct()
    }

    pub fn instance_key(&self) -> InstanceKey {
        self.shared.key
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.tasks.len()
    }

    pub fn pending_zombies(&self) -> u64 {
        self.shared.zombies.len()
    }

    /// Whether a wake handle is currently armed.
    pub fn is_armed(&self) -> bool {
        self.shared.tasks.is_armed()
    }

    /// Wake handles created over the group's lifetime.
    pub fn wakes_created(&self) -> u64 {
        self.shared.tasks.wakes_created()
    }
}

impl std::fmt::Debug for ContextGroupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextGroupHandle")
            .field("instance", &self.shared.key)
            .field("owner", &self.shared.owner)
            .field("defunct", &self.shared.is_defunct())
            .finish()
    }
}

/// Coordinator owning or borrowing one engine instance.
pub struct ContextGroup {
    shared: Arc<Shared>,
    instance: Option<Box<dyn EngineInstance>>,
    owns_instance: bool,
    lease: Option<PlatformLease>,
    snapshot: Option<Bytes>,
    managed_values: Vec<Weak<dyn ManagedValue>>,
    managed_contexts: Vec<Weak<dyn ManagedContext>>,
}

impl ContextGroup {
    /// Create a group owning a fresh instance, on the global platform and
    /// the current-thread tokio runtime the caller is running in.
    pub fn new(engine: &dyn Engine) -> Result<Self, GroupError> {
        Self::with_config(engine, EnginePlatform::global(), None, GroupConfig::default())
    }

    /// Create a group owning a fresh instance.
    ///
    /// `event_loop` defaults to the caller's current-thread tokio runtime. When
    /// `config.snapshot_path` is set the instance is seeded from that file;
    /// an unreadable file silently yields an unseeded instance.
    pub fn with_config(
        engine: &dyn Engine,
        platform: Arc<EnginePlatform>,
        event_loop: Option<Arc<dyn EventLoop>>,
        config: GroupConfig,
    ) -> Result<Self, GroupError> {
        let snapshot = config
            .snapshot_path
            .as_deref()
            .and_then(crate::snapshot::load_snapshot);

        Self::owned(engine, platform, event_loop, snapshot, config)
    }

    /// Create a group owning an instance seeded from the snapshot file at `path`.
    pub fn with_snapshot_file(
        engine: &dyn Engine,
        path: impl AsRef<Path>,
        event_loop: Option<Arc<dyn EventLoop>>,
    ) -> Result<Self, GroupError> {
        let config = GroupConfig::default().with_snapshot(path.as_ref());
        Self::with_config(engine, EnginePlatform::global(), event_loop, config)
    }

    /// Create a group owning a fresh instance seeded from in-memory snapshot bytes.
    pub fn owned(
        engine: &dyn Engine,
        platform: Arc<EnginePlatform>,
        event_loop: Option<Arc<dyn EventLoop>>,
        snapshot: Option<Bytes>,
        config: GroupConfig,
    ) -> Result<Self, GroupError> {
        let event_loop = match event_loop {
            Some(event_loop) => event_loop,
            None => TokioEventLoop::current()? as Arc<dyn EventLoop>,
        };

        let snapshot = snapshot.filter(|bytes| !bytes.is_empty());

        // Released on the error path below, so nothing is left half-built
        let lease = platform.acquire()?;

        let instance = engine.create_instance(InstanceParams {
            snapshot: snapshot.clone(),
            allocator: Arc::clone(platform.allocator()),
        })?;

        Ok(Self::assemble(instance, true, lease, snapshot, event_loop, &config))
    }

    /// Wrap a host-supplied instance and the host's event loop.
    ///
    /// The instance is never destroyed by the group.
    pub fn borrowed(
        instance: Box<dyn EngineInstance>,
        event_loop: Arc<dyn EventLoop>,
        platform: Arc<EnginePlatform>,
        config: GroupConfig,
    ) -> Result<Self, GroupError> {
        let lease = platform.acquire()?;
        Ok(Self::assemble(instance, false, lease, None, event_loop, &config))
    }

    fn assemble(
        mut instance: Box<dyn EngineInstance>,
        owns_instance: bool,
        lease: PlatformLease,
        snapshot: Option<Bytes>,
        event_loop: Arc<dyn EventLoop>,
        config: &GroupConfig,
    ) -> Self {
        let key = instance.key();

        let shared = Arc::new_cyclic(|this| Shared {
            owner: thread::current().id(),
            key,
            event_loop,
            tasks: TaskQueue::new(),
            zombies: ZombieRegistry::new(),
            gc_callbacks: Arc::new(GcCallbackRegistry::new()),
            defunct: AtomicBool::new(false),
            strict_reference_checks: config.strict_reference_checks,
            this: this.clone(),
        });

        gc::register_instance(key, &shared.gc_callbacks);
        instance.install_gc_prologue_hook();

        log::info!(
            "Context group created for instance {:?} (owned: {}, snapshot: {})",
            key,
            owns_instance,
            snapshot.as_ref().map_or(0, Bytes::len)
        );

        Self {
            shared,
            instance: Some(instance),
            owns_instance,
            lease: Some(lease),
            snapshot,
            managed_values: Vec::new(),
            managed_contexts: Vec::new(),
        }
    }

    pub fn handle(&self) -> ContextGroupHandle {
        ContextGroupHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_defunct(&self) -> bool {
        self.shared.is_defunct()
    }

    pub fn owner_thread(&self) -> ThreadId {
        self.shared.owner
    }

    pub fn instance_key(&self) -> InstanceKey {
        self.shared.key
    }

    pub fn owns_instance(&self) -> bool {
        self.owns_instance
    }

    /// The engine instance. Owned instances are gone once the group is disposed.
    pub fn instance(&self) -> Option<&dyn EngineInstance> {
        self.instance.as_deref()
    }

    pub fn instance_mut(&mut self) -> Option<&mut (dyn EngineInstance + 'static)> {
        self.instance.as_deref_mut()
    }

    /// Hand a borrowed instance back to the host once the group is disposed.
    pub fn take_borrowed_instance(&mut self) -> Option<Box<dyn EngineInstance>> {
        if self.owns_instance || !self.is_defunct() {
            return None;
        }

        self.instance.take()
    }

    /// Snapshot bytes the instance was seeded from.
    pub fn snapshot(&self) -> Option<&Bytes> {
        self.snapshot.as_ref()
    }

    /// Track `value` weakly so dispose can reach it.
    pub fn manage_value<V: ManagedValue + 'static>(&mut self, value: &Arc<V>) {
        if self.is_defunct() {
            log::debug!("Ignoring managed value for defunct group {:?}", self.shared.key);
            return;
        }

        if self.managed_values.len() == self.managed_values.capacity() {
            self.managed_values.retain(|weak| weak.strong_count() > 0);
        }

        let weak: Weak<dyn ManagedValue> = Arc::downgrade(value) as Weak<V>;
        self.managed_values.push(weak);
    }

    /// Track `context` weakly so dispose can reach it.
    pub fn manage_context<C: ManagedContext + 'static>(&mut self, context: &Arc<C>) {
        if self.is_defunct() {
            log::debug!("Ignoring managed context for defunct group {:?}", self.shared.key);
            return;
        }

        if self.managed_contexts.len() == self.managed_contexts.capacity() {
            self.managed_contexts.retain(|weak| weak.strong_count() > 0);
        }

        let weak: Weak<dyn ManagedContext> = Arc::downgrade(context) as Weak<C>;
        self.managed_contexts.push(weak);
    }

    /// Entries in the managed lists (live or not).
    pub fn managed_len(&self) -> (usize, usize) {
        (self.managed_values.len(), self.managed_contexts.len())
    }

    pub fn mark_zombie_value(&self, value: Arc<dyn ManagedValue>) -> bool {
        self.shared.mark_zombie_value(value)
    }

    pub fn mark_zombie_context(&self, context: Arc<dyn ManagedContext>) -> bool {
        self.shared.mark_zombie_context(context)
    }

    /// Dispose every queued zombie now.
    pub fn free_zombies(&self) -> FreedZombies {
        self.shared.free_zombies()
    }

    /// Subscribe to this instance's GC prologues.
    pub fn register_gc_callback<F>(&self, callback: F) -> GcCallbackId
    where
        F: Fn(GcType, GcCallbackFlags) + Send + Sync + 'static,
    {
        self.shared.gc_callbacks.register(callback)
    }

    pub fn unregister_gc_callback(&self, id: GcCallbackId) -> bool {
        self.shared.gc_callbacks.unregister(id)
    }

    /// Tear the group down. Idempotent.
    ///
    /// Unstarted tasks are dropped without running; whoever submitted them is
    /// not told.
    pub fn dispose(&mut self) {
        if self.is_defunct() {
            return;
        }

        let key = self.shared.key;
        log::debug!("Disposing context group for instance {:?}", key);

        let dropped = self.shared.tasks.clear();
        if dropped > 0 {
            log::warn!("Dropped {} unexecuted tasks while disposing {:?}", dropped, key);
        }

        if let Some(instance) = self.instance.as_mut() {
            instance.remove_gc_prologue_hook();
        }
        self.shared.gc_callbacks.clear();

        for value in self.managed_values.iter().filter_map(Weak::upgrade) {
            value.dispose();
        }
        for context in self.managed_contexts.iter().filter_map(Weak::upgrade) {
            context.dispose();
        }

        self.shared.defunct.store(true, Ordering::Release);
        self.managed_values.clear();
        self.managed_contexts.clear();

        // Every zombie either lands before the close and is freed here, or is refused
        self.shared.zombies.close();
        let freed = self.shared.zombies.free_all();

        // Anything submitted while the first clear ran
        self.shared.tasks.close();

        gc::unregister_instance(key);

        // Borrowed instances stay with the group until the host takes them back
        if self.owns_instance
            && let Some(instance) = self.instance.take()
        {
            instance.destroy();
        }

        if let Some(lease) = self.lease.take() {
            lease.release();
        }

        self.snapshot = None;

        log::info!(
            "Context group for instance {:?} disposed ({} zombies freed)",
            key,
            freed.total()
        );

        if !thread::panicking() {
            self.shared.check_forced_exits(&freed);
        }
    }
}

impl Drop for ContextGroup {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ContextGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextGroup")
            .field("instance", &self.shared.key)
            .field("owns_instance", &self.owns_instance)
            .field("defunct", &self.is_defunct())
            .field("managed_values", &self.managed_values.len())
            .field("managed_contexts", &self.managed_contexts.len())
            .field("tasks", &self.shared.tasks)
            .field("zombies", &self.shared.zombies)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::engine::headless::{HeadlessContext, HeadlessEngine, HeadlessValue};
    use crate::event_loop::WakeHandle;
    use crate::platform::HeadlessPlatform;

    /// Event loop whose handles never fire; the test drives the queue by hand.
    struct InertLoop;

    struct InertWake;

    impl WakeHandle for InertWake {
        fn signal(&self) {}
        fn close(self: Box<Self>) {}
    }

    impl EventLoop for InertLoop {
        fn create_wake(&self, _handler: WakeHandler) -> Box<dyn WakeHandle> {
            Box::new(InertWake)
        }
    }

    fn platform() -> Arc<EnginePlatform> {
        EnginePlatform::new(HeadlessPlatform::new(), PlatformConfig::default())
    }

    fn group(engine: &HeadlessEngine) -> ContextGroup {
        ContextGroup::owned(
            engine,
            platform(),
            Some(Arc::new(InertLoop)),
            None,
            GroupConfig::default().with_strict_reference_checks(false),
        )
        .unwrap()
    }

    #[test]
    fn test_dispose_disposes_managed_objects() {
        let engine = HeadlessEngine::new();
        let mut group = group(&engine);

        let values: Vec<_> = (0..3).map(|_| HeadlessValue::new()).collect();
        for value in &values {
            group.manage_value(value);
        }
        let ctx = HeadlessContext::finished();
        group.manage_context(&ctx);

        group.dispose();

        assert!(values.iter().all(|v| v.is_disposed()));
        assert!(ctx.is_disposed());
        assert_eq!(group.managed_len(), (0, 0));
        assert!(group.is_defunct());
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let engine = HeadlessEngine::new();
        let mut group = group(&engine);
        let monitor = engine.last_monitor().unwrap();
        let value = HeadlessValue::new();
        group.manage_value(&value);

        group.dispose();
        group.dispose();

        assert_eq!(value.dispose_calls(), 1);
        assert!(monitor.destroyed());
        assert!(group.instance().is_none());
    }

    #[test]
    fn test_dead_managed_values_are_skipped() {
        let engine = HeadlessEngine::new();
        let mut group = group(&engine);

        let value = HeadlessValue::new();
        group.manage_value(&value);
        drop(value);

        // Nothing left to upgrade; dispose must not trip over the dead entry
        group.dispose();
        assert_eq!(group.managed_len(), (0, 0));
    }

    #[test]
    fn test_manage_after_dispose_is_ignored() {
        let engine = HeadlessEngine::new();
        let mut group = group(&engine);
        group.dispose();

        let value = HeadlessValue::new();
        group.manage_value(&value);
        assert_eq!(group.managed_len(), (0, 0));
        assert!(!value.is_disposed());
    }

    #[test]
    fn test_free_zombies_on_owner_thread() {
        let engine = HeadlessEngine::new();
        let group = group(&engine);
        let value = HeadlessValue::new();

        group.mark_zombie_value(value.clone());
        assert_eq!(group.handle().pending_zombies(), 1);

        let freed = group.free_zombies();
        assert_eq!(freed.values, 1);
        assert_eq!(value.disposed_on(), Some(thread::current().id()));
    }

    #[test]
    fn test_group_is_never_its_own_zombie() {
        let engine = HeadlessEngine::new();
        let group = group(&engine);
        let handle = group.handle();

        handle.mark_zombie_value(handle.as_managed_value());

        assert_eq!(handle.pending_zombies(), 0);
        assert!(!handle.is_armed());
    }

    #[test]
    fn test_zombie_marking_arms_wake_once() {
        let engine = HeadlessEngine::new();
        let group = group(&engine);
        let handle = group.handle();

        handle.mark_zombie_value(HeadlessValue::new());
        handle.mark_zombie_context(HeadlessContext::finished());

        assert!(handle.is_armed());
        assert_eq!(handle.wakes_created(), 1);
    }

    #[test]
    fn test_submit_after_dispose_fails() {
        let engine = HeadlessEngine::new();
        let mut group = group(&engine);
        let handle = group.handle();
        group.dispose();

        assert!(matches!(handle.submit_async(|| {}), Err(GroupError::Defunct)));
        assert!(handle.is_defunct());
    }

    #[test]
    fn test_submit_sync_on_owner_thread_is_rejected() {
        let engine = HeadlessEngine::new();
        let group = group(&engine);

        let result = group.handle().submit_sync(|| 1);
        assert!(matches!(result, Err(GroupError::OwnerThread(_))));
    }

    #[test]
    fn test_dispose_drops_pending_tasks() {
        let engine = HeadlessEngine::new();
        let mut group = group(&engine);
        let handle = group.handle();
        let ran = Arc::new(AtomicBool::new(false));

        let r = Arc::clone(&ran);
        handle.submit_async(move || r.store(true, Ordering::SeqCst)).unwrap();
        assert_eq!(handle.pending_tasks(), 1);

        group.dispose();
        assert_eq!(handle.pending_tasks(), 0);
        assert!(!ran.load(Ordering::SeqCst));
        assert!(!handle.is_armed());
    }

    #[test]
    fn test_gc_hook_follows_group_lifecycle() {
        let engine = HeadlessEngine::new();
        let mut group = group(&engine);
        let monitor = engine.last_monitor().unwrap();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        group.register_gc_callback(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(monitor.hook_installed());
        assert!(monitor.collect_garbage(GcType::SCAVENGE, GcCallbackFlags::NONE));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        group.dispose();
        assert!(!monitor.hook_installed());
        assert!(!gc::is_registered(monitor.key()));
        assert!(!monitor.collect_garbage(GcType::SCAVENGE, GcCallbackFlags::NONE));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_borrowed_instance_is_not_destroyed() {
        let engine = HeadlessEngine::new();
        let instance = engine.instance(None);
        let monitor = instance.monitor();
        let platform = platform();

        let mut group = ContextGroup::borrowed(
            Box::new(instance),
            Arc::new(InertLoop),
            Arc::clone(&platform),
            GroupConfig::default(),
        )
        .unwrap();
        assert!(!group.owns_instance());
        assert_eq!(platform.stats().refcount, 1);

        assert!(group.take_borrowed_instance().is_none());
        group.dispose();
        assert!(!monitor.destroyed());
        assert_eq!(platform.stats().refcount, 0);

        let instance = group.take_borrowed_instance().unwrap();
        assert_eq!(instance.key(), monitor.key());
        assert!(!monitor.hook_installed());
    }

    #[test]
    fn test_no_event_loop_outside_runtime() {
        let engine = HeadlessEngine::new();
        let platform = platform();
        let result = ContextGroup::owned(&engine, Arc::clone(&platform), None, None, GroupConfig::default());

        assert!(matches!(result, Err(GroupError::NoEventLoop)));
        assert_eq!(platform.stats().refcount, 0);
        assert!(engine.monitors().is_empty());
    }

    #[test]
    fn test_empty_snapshot_is_treated_as_none() {
        let engine = HeadlessEngine::new();
        let group = ContextGroup::owned(
            &engine,
            platform(),
            Some(Arc::new(InertLoop)),
            Some(Bytes::new()),
            GroupConfig::default(),
        )
        .unwrap();

        assert!(group.snapshot().is_none());
        assert!(engine.last_monitor().unwrap().snapshot().is_none());
    }
    fn strict_group(engine: &HeadlessEngine) -> ContextGroup {
        ContextGroup::owned(
            engine,
            platform(),
            Some(Arc::new(InertLoop)),
            None,
            GroupConfig::default().with_strict_reference_checks(true),
        )
        .unwrap()
    }

    #[test]
    fn test_strict_check_fires_after_the_whole_batch() {
        let engine = HeadlessEngine::new();
        let group = strict_group(&engine);
        let running = HeadlessContext::running();
        let later = [HeadlessContext::finished(), HeadlessContext::finished()];
        let value = HeadlessValue::new();

        group.mark_zombie_context(running.clone());
        for ctx in &later {
            group.mark_zombie_context(ctx.clone());
        }
        group.mark_zombie_value(value.clone());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| group.free_zombies()));

        assert!(result.is_err());
        assert!(running.is_disposed());
        assert!(later.iter().all(|ctx| ctx.is_disposed()));
        assert_eq!(value.dispose_calls(), 1);
        assert_eq!(group.handle().pending_zombies(), 0);
    }

    #[test]
    fn test_panicking_wake_cycle_rearms_for_leftover_work() {
        let engine = HeadlessEngine::new();
        let group = group(&engine);
        let handle = group.handle();
        let ran = Arc::new(AtomicBool::new(false));

        handle.submit_async(|| panic!("task failed")).unwrap();
        let r = Arc::clone(&ran);
        handle.submit_async(move || r.store(true, Ordering::SeqCst)).unwrap();
        assert_eq!(handle.wakes_created(), 1);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| group.shared.on_wake()));
        assert!(result.is_err());

        // The dead handle was replaced and the second task is still queued
        assert!(handle.is_armed());
        assert_eq!(handle.wakes_created(), 2);
        assert_eq!(handle.pending_tasks(), 1);

        group.shared.on_wake();
        assert!(ran.load(Ordering::SeqCst));
        assert!(!handle.is_armed());
    }

    #[test]
    fn test_zombies_are_refused_once_disposed() {
        let engine = HeadlessEngine::new();
        let mut group = group(&engine);
        let handle = group.handle();
        let queued = HeadlessValue::new();
        let late = HeadlessValue::new();

        assert!(handle.mark_zombie_value(queued.clone()));
        group.dispose();
        assert!(!handle.mark_zombie_value(late.clone()));
        assert!(!handle.mark_zombie_context(HeadlessContext::finished()));

        assert_eq!(queued.dispose_calls(), 1);
        assert!(!late.is_disposed());
        assert_eq!(handle.pending_zombies(), 0);
        assert!(!handle.is_armed());
    }

    #[test]
    fn test_dispose_releases_gc_callbacks() {
        let engine = HeadlessEngine::new();
        let mut group = group(&engine);
        let captured = Arc::new(());

        let c = Arc::clone(&captured);
        group.register_gc_callback(move |_, _| {
            assert!(Arc::strong_count(&c) > 0);
        });
        assert_eq!(Arc::strong_count(&captured), 2);

        group.dispose();
        assert_eq!(Arc::strong_count(&captured), 1);
        assert!(group.shared.gc_callbacks.is_empty());
    }
}
