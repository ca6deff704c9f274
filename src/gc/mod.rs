//! GC integration: prologue callbacks and deferred disposal.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Engine GC prologue (owning thread)                         │
//! │  └── static hook → dispatch_gc_prologue(key, type, flags)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Instance map (process-wide mutex)                          │
//! │  ├── InstanceKey → Weak<GcCallbackRegistry>                 │
//! │  └── Locked for the lookup only                             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  GcCallbackRegistry (per group)                             │
//! │  └── Callbacks fired in registration order                  │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ZombieRegistry (per group)                                 │
//! │  ├── Host finalizers push from any thread                   │
//! │  └── Owning thread drains before running queued tasks       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod callbacks;
mod instance_map;
mod zombies;

pub use callbacks::{GcCallback, GcCallbackId, GcCallbackRegistry};
pub use instance_map::{dispatch_gc_prologue, is_registered};
pub use zombies::{EXIT_COLLECTED_WHILE_ACTIVE, FreedZombies, ZombieRegistry};

pub(crate) use instance_map::{register as register_instance, unregister as unregister_instance};
