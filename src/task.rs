//! Cross-thread work for the owning thread.
//!
//! A `PendingTask` is either an opaque closure or a named callback on a host
//! object. Named callbacks are resolved against a `CapabilityTable` when the
//! descriptor is built, walking the declared type and then its ancestors, so
//! a wiring mistake shows up as an error at the call site instead of a fatal
//! failure on the owning thread later. Callbacks registered with concrete
//! types also have their target and argument types checked at that point.

use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::GroupError;
use crate::event_loop::WakeHandle;

/// A host object a callback is invoked on.
pub type HostObject = Arc<dyn Any + Send + Sync>;

/// The single argument handed to a host callback.
pub type CallbackArg = Box<dyn Any + Send>;

/// A named host callback: `(target, argument)`.
pub type HostCallback = Arc<dyn Fn(&HostObject, CallbackArg) + Send + Sync>;

struct RegisteredCallback {
    callback: HostCallback,
    /// `(target, argument)` types for callbacks registered with `register_method`
    signature: Option<(TypeId, TypeId)>,
}

struct TypeEntry {
    parent: Option<String>,
    callbacks: HashMap<String, RegisteredCallback>,
}

/// Host types and the callbacks each one exposes.
///
/// Types form a single-inheritance hierarchy: a callback registered on an
/// ancestor is visible from every descendant unless overridden.
#[derive(Default)]
pub struct CapabilityTable {
    types: HashMap<String, TypeEntry>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a host type, optionally deriving from an already declared one.
    pub fn declare_type(&mut self, name: &str, parent: Option<&str>) -> Result<&mut Self, GroupError> {
        if let Some(parent) = parent
            && !self.types.contains_key(parent)
        {
            return Err(GroupError::UnknownType(parent.to_string()));
        }

        self.types.insert(
            name.to_string(),
            TypeEntry {
                parent: parent.map(str::to_string),
                callbacks: HashMap::new(),
            },
        );

        Ok(self)
    }

    /// Register an untyped callback on a declared type.
    pub fn register_callback(
        &mut self,
        type_name: &str,
        method: &str,
        callback: HostCallback,
    ) -> Result<&mut Self, GroupError> {
        self.insert(type_name, method, callback, None)
    }

    /// Register a callback taking a concrete target and argument type.
    ///
    /// Binding it to a target or argument of another type fails with
    /// `GroupError::CallbackTypeMismatch`.
    pub fn register_method<T, A, F>(
        &mut self,
        type_name: &str,
        method: &str,
        callback: F,
    ) -> Result<&mut Self, GroupError>
    where
        T: Send + Sync + 'static,
        A: Send + 'static,
        F: Fn(&T, A) + Send + Sync + 'static,
    {
        let callback: HostCallback = Arc::new(move |target: &HostObject, arg: CallbackArg| {
            // Both types were checked when the descriptor was bound
            if let (Some(target), Ok(arg)) = (target.downcast_ref::<T>(), arg.downcast::<A>()) {
                callback(target, *arg);
            }
        });

        self.insert(
            type_name,
            method,
            callback,
            Some((TypeId::of::<T>(), TypeId::of::<A>())),
        )
    }

    fn insert(
        &mut self,
        type_name: &str,
        method: &str,
        callback: HostCallback,
        signature: Option<(TypeId, TypeId)>,
    ) -> Result<&mut Self, GroupError> {
        let entry = self
            .types
            .get_mut(type_name)
            .ok_or_else(|| GroupError::UnknownType(type_name.to_string()))?;

        entry
            .callbacks
            .insert(method.to_string(), RegisteredCallback { callback, signature });
        Ok(self)
    }

    /// Find `method` on `type_name`, falling back through its ancestors.
    pub fn resolve(&self, type_name: &str, method: &str) -> Result<HostCallback, GroupError> {
        self.lookup(type_name, method)
            .map(|registered| Arc::clone(&registered.callback))
    }

    fn lookup(&self, type_name: &str, method: &str) -> Result<&RegisteredCallback, GroupError> {
        let mut current = Some(type_name);

        while let Some(name) = current {
            let entry = self
                .types
                .get(name)
                .ok_or_else(|| GroupError::UnknownType(name.to_string()))?;

            if let Some(registered) = entry.callbacks.get(method) {
                return Ok(registered);
            }

            current = entry.parent.as_deref();
        }

        Err(GroupError::UnresolvedCallback {
            type_name: type_name.to_string(),
            method: method.to_string(),
        })
    }
}

impl std::fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.types.keys().collect();
        names.sort();
        f.debug_struct("CapabilityTable").field("types", &names).finish()
    }
}

/// A named callback bound to its target, ready to run.
pub struct CallbackDescriptor {
    type_name: String,
    method: String,
    target: HostObject,
    argument: CallbackArg,
    callback: HostCallback,
}

impl CallbackDescriptor {
    /// Resolve `method` for `target` (declared as `type_name`) right away.
    pub fn bind(
        table: &CapabilityTable,
        target: HostObject,
        type_name: &str,
        method: &str,
        argument: CallbackArg,
    ) -> Result<Self, GroupError> {
        let registered = table.lookup(type_name, method)?;

        // Deref to the trait objects: the smart pointers have their own TypeId
        if let Some((target_type, argument_type)) = registered.signature
            && ((*target).type_id() != target_type || (*argument).type_id() != argument_type)
        {
            return Err(GroupError::CallbackTypeMismatch {
                type_name: type_name.to_string(),
                method: method.to_string(),
            });
        }

        let callback = Arc::clone(&registered.callback);

        Ok(Self {
            type_name: type_name.to_string(),
            method: method.to_string(),
            target,
            argument,
            callback,
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    fn invoke(self) {
        (self.callback)(&self.target, self.argument);
    }
}

impl std::fmt::Debug for CallbackDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackDescriptor")
            .field("type_name", &self.type_name)
            .field("method", &self.method)
            .finish()
    }
}

/// A unit of work queued for the owning thread.
pub enum PendingTask {
    Closure(Box<dyn FnOnce() + Send>),
    Callback(CallbackDescriptor),
}

impl PendingTask {
    pub fn closure<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        PendingTask::Closure(Box::new(f))
    }

    pub fn run(self) {
        match self {
            PendingTask::Closure(f) => f(),
            PendingTask::Callback(descriptor) => {
                tracing::trace!(
                    "Running callback {}.{}",
                    descriptor.type_name,
                    descriptor.method
                );
                descriptor.invoke()
            }
        }
    }
}

impl From<CallbackDescriptor> for PendingTask {
    fn from(descriptor: CallbackDescriptor) -> Self {
        PendingTask::Callback(descriptor)
    }
}

impl std::fmt::Debug for PendingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingTask::Closure(_) => f.write_str("PendingTask::Closure"),
            PendingTask::Callback(d) => f.debug_tuple("PendingTask::Callback").field(d).finish(),
        }
    }
}

struct QueueState {
    tasks: VecDeque<PendingTask>,
    wake: Option<Box<dyn WakeHandle>>,
    closed: bool,
}

/// FIFO of pending tasks plus the lazily created wake handle.
///
/// The wake slot shares the queue's lock: a submitter either sees the
/// handle armed (and the running handler will pick its task up) or sees it
/// retired and arms a fresh one.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    wakes_created: AtomicU64,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                wake: None,
                closed: false,
            }),
            wakes_created: AtomicU64::new(0),
        }
    }

    /// Append `task` (if any) and make sure a wake handle is armed.
    ///
    /// `create_wake` runs only when no handle exists; the new handle is
    /// signaled immediately. Returns `false` once the queue is closed, in
    /// which case `task` is dropped without running and nothing is armed.
    pub(crate) fn push_and_arm<F>(&self, task: Option<PendingTask>, create_wake: F) -> bool
    where
        F: FnOnce() -> Box<dyn WakeHandle>,
    {
        let mut state = self.state.lock().expect("task queue poisoned");

        if state.closed {
            // `task` drops after the guard
            drop(state);
            return false;
        }

        if let Some(task) = task {
            state.tasks.push_back(task);
        }

        if state.wake.is_none() {
            let wake = create_wake();
            wake.signal();
            state.wake = Some(wake);
            self.wakes_created.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Wake handle armed ({} tasks queued)", state.tasks.len());
        }

        true
    }

    pub(crate) fn pop(&self) -> Option<PendingTask> {
        self.state
            .lock()
            .expect("task queue poisoned")
            .tasks
            .pop_front()
    }

    /// Close the wake handle if no task is queued and `busy` reports nothing else to do.
    ///
    /// Returns whether the handle was retired.
    pub(crate) fn retire_if_idle(&self, busy: impl FnOnce() -> bool) -> bool {
        let mut state = self.state.lock().expect("task queue poisoned");

        if !state.tasks.is_empty() || busy() {
            return false;
        }

        if let Some(wake) = state.wake.take() {
            wake.close();
            tracing::trace!("Wake handle retired");
        }

        true
    }

    /// Close the wake handle regardless of queued work.
    pub(crate) fn retire(&self) {
        let wake = self.state.lock().expect("task queue poisoned").wake.take();

        if let Some(wake) = wake {
            wake.close();
        }
    }

    /// Drop every queued task without running it. Returns how many were dropped.
    pub(crate) fn clear(&self) -> usize {
        let tasks = std::mem::take(&mut self.state.lock().expect("task queue poisoned").tasks);
        let count = tasks.len();
        // Dropped outside the lock: a task's captures may submit again on drop
        drop(tasks);
        count
    }

    /// Refuse every later push, drop what is queued and retire the handle.
    /// Returns how many tasks were dropped.
    pub(crate) fn close(&self) -> usize {
        let (tasks, wake) = {
            let mut state = self.state.lock().expect("task queue poisoned");
            state.closed = true;
            (std::mem::take(&mut state.tasks), state.wake.take())
        };

        if let Some(wake) = wake {
            wake.close();
        }

        let count = tasks.len();
        drop(tasks);
        count
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("task queue poisoned").tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a wake handle currently exists.
    pub fn is_armed(&self) -> bool {
        self.state.lock().expect("task queue poisoned").wake.is_some()
    }

    /// Number of wake handles created over the queue's lifetime.
    pub fn wakes_created(&self) -> u64 {
        self.wakes_created.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.len())
            .field("armed", &self.is_armed())
            .field("wakes_created", &self.wakes_created())
            .finish()
    }
}
