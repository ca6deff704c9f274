//! Error type shared by every context group operation.

use std::thread::ThreadId;

/// Structural and lifecycle errors.
///
/// VM-level exception payloads never show up here: converting those is the
/// job of whoever runs code inside the engine.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    /// The group has been disposed and no longer accepts work.
    #[error("context group is defunct")]
    Defunct,

    /// A blocking call was made from the group's own thread, which would
    /// wait on itself forever.
    #[error("blocking call issued from the owning thread {0:?}")]
    OwnerThread(ThreadId),

    /// No event loop was supplied and none could be found on the current
    /// thread, or the runtime found cannot keep work on the owning thread.
    #[error("no event loop available to bind the owning thread to")]
    NoEventLoop,

    /// A named callback could not be found on the target type or any ancestor.
    #[error("no callback `{method}` on `{type_name}` or its ancestors")]
    UnresolvedCallback { type_name: String, method: String },

    /// A typed callback was bound to a target or argument of another type.
    #[error("callback `{type_name}.{method}` bound with a target or argument of the wrong type")]
    CallbackTypeMismatch { type_name: String, method: String },

    /// A type was referenced before being declared in the capability table.
    #[error("type `{0}` is not declared in the capability table")]
    UnknownType(String),

    /// The shared platform was shut down and cannot be initialized again.
    #[error("engine platform has been shut down and cannot be re-initialized")]
    PlatformShutDown,

    /// The underlying engine refused to create an instance.
    #[error("engine error: {0}")]
    Engine(String),
}
