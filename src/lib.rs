pub mod allocator;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod gc;
pub mod group;
pub mod host;
pub mod platform;
pub mod snapshot;
pub mod task;

// Core API
pub use group::{ContextGroup, ContextGroupHandle};
pub use host::{HostContext, HostValue};

pub use config::{GroupConfig, PlatformConfig, TeardownPolicy, init_platform};
pub use engine::{
    Engine, EngineInstance, GcCallbackFlags, GcType, InstanceKey, ManagedContext, ManagedValue,
};
pub use error::GroupError;
pub use event_loop::{EventLoop, LoopPreserver, TokioEventLoop, WakeHandle};
pub use gc::{EXIT_COLLECTED_WHILE_ACTIVE, FreedZombies, GcCallbackId};
pub use platform::{EnginePlatform, PlatformBackend, PlatformLease, PlatformStats};
pub use task::{CallbackDescriptor, CapabilityTable, PendingTask};
