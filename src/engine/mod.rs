//! Boundary with the underlying engine.
//!
//! A context group never talks to the VM directly. It needs four things
//! from it:
//!
//! - create / destroy an instance (`Engine`, `EngineInstance::destroy`)
//! - install / remove the GC-prologue hook that forwards to the group's
//!   trampoline (`EngineInstance::install_gc_prologue_hook`)
//! - dispose engine objects during cleanup (`ManagedValue`, `ManagedContext`)
//! - an identity for the instance so GC events can be routed (`InstanceKey`)
//!
//! Implementations: [`headless`] (no VM, explicit GC cycles) and, with the
//! `v8` feature, `v8_engine`.

use std::sync::Arc;

use bytes::Bytes;

use crate::allocator::GenericAllocator;
use crate::error::GroupError;

pub mod headless;

#[cfg(feature = "v8")]
pub mod v8_engine;

/// Identity of an engine instance, used to route GC events to its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey(usize);

impl InstanceKey {
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Key an instance by its address (e.g. a native isolate pointer).
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub fn as_raw(self) -> usize {
        self.0
    }
}

/// Kind of collection about to run. Bit values follow V8's `GCType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcType(u32);

impl GcType {
    pub const SCAVENGE: Self = Self(1 << 0);
    pub const MINOR_MARK_SWEEP: Self = Self(1 << 1);
    pub const MARK_SWEEP_COMPACT: Self = Self(1 << 2);
    pub const INCREMENTAL_MARKING: Self = Self(1 << 3);
    pub const PROCESS_WEAK_CALLBACKS: Self = Self(1 << 4);
    pub const ALL: Self = Self(0b1_1111);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Extra information about a collection. Bit values follow V8's `GCCallbackFlags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GcCallbackFlags(u32);

impl GcCallbackFlags {
    pub const NONE: Self = Self(0);
    pub const CONSTRUCT_RETAINED_OBJECT_INFOS: Self = Self(1 << 1);
    pub const FORCED: Self = Self(1 << 2);
    pub const SYNCHRONOUS_PHANTOM_CALLBACK_PROCESSING: Self = Self(1 << 3);
    pub const COLLECT_ALL_AVAILABLE_GARBAGE: Self = Self(1 << 4);
    pub const COLLECT_ALL_EXTERNAL_MEMORY: Self = Self(1 << 5);
    pub const SCHEDULE_IDLE_GARBAGE_COLLECTION: Self = Self(1 << 6);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// What an engine needs to build an instance.
#[derive(Debug, Clone)]
pub struct InstanceParams {
    /// Serialized heap used to fast-start the instance
    pub snapshot: Option<Bytes>,
    /// Array buffer allocator shared across the platform
    pub allocator: Arc<GenericAllocator>,
}

/// Factory for engine instances.
pub trait Engine {
    fn create_instance(&self, params: InstanceParams) -> Result<Box<dyn EngineInstance>, GroupError>;
}

/// A single-threaded execution/heap context (an isolate).
///
/// Not `Send`: an instance lives and dies on its owning thread.
pub trait EngineInstance {
    fn key(&self) -> InstanceKey;

    /// Subscribe the instance to GC prologues.
    ///
    /// On every prologue the engine must call
    /// [`crate::gc::dispatch_gc_prologue`] with this instance's key.
    fn install_gc_prologue_hook(&mut self);

    fn remove_gc_prologue_hook(&mut self);

    /// Tear the instance down. Only called for instances the group owns.
    fn destroy(self: Box<Self>);
}

/// An engine-owned value the host may hold a reference to.
///
/// `dispose` releases the native resources. It is only ever called on the
/// owning thread and must tolerate being called more than once: a value can
/// be both managed and zombie-marked when its group is disposed.
pub trait ManagedValue: Send + Sync {
    fn dispose(&self);
}

/// An engine-owned execution context, possibly running a process.
///
/// Same threading and idempotency rules as [`ManagedValue`].
pub trait ManagedContext: Send + Sync {
    /// Whether the process running in this context is still alive.
    fn is_active(&self) -> bool;

    /// Ask the running process to exit with `code`.
    fn exit(&self, code: i32);

    fn dispose(&self);
}
