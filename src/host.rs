//! Host-side references to engine objects.
//!
//! Dropping the last `HostValue` / `HostContext` is the host collector
//! finalizing its wrapper: the engine object is handed to its group as a
//! zombie and disposed on the owning thread. Drop may run on any thread.

use std::ops::Deref;
use std::sync::Arc;

use crate::engine::{ManagedContext, ManagedValue};
use crate::group::ContextGroupHandle;

/// Host reference to an engine value.
pub struct HostValue<V: ManagedValue + 'static> {
    value: Option<Arc<V>>,
    group: ContextGroupHandle,
}

impl<V: ManagedValue + 'static> HostValue<V> {
    pub fn new(group: ContextGroupHandle, value: Arc<V>) -> Self {
        Self {
            value: Some(value),
            group,
        }
    }

    pub fn group(&self) -> &ContextGroupHandle {
        &self.group
    }

    /// Give up the wrapper without marking the value as a zombie.
    pub fn into_inner(mut self) -> Arc<V> {
        self.value.take().expect("host value already released")
    }
}

impl<V: ManagedValue + 'static> Deref for HostValue<V> {
    type Target = V;

    fn deref(&self) -> &V {
        self.value.as_deref().expect("host value already released")
    }
}

impl<V: ManagedValue + 'static> Drop for HostValue<V> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.group.mark_zombie_value(value);
        }
    }
}

/// Host reference to an engine context.
pub struct HostContext<C: ManagedContext + 'static> {
    context: Option<Arc<C>>,
    group: ContextGroupHandle,
}

impl<C: ManagedContext + 'static> HostContext<C> {
    pub fn new(group: ContextGroupHandle, context: Arc<C>) -> Self {
        Self {
            context: Some(context),
            group,
        }
    }

    pub fn group(&self) -> &ContextGroupHandle {
        &self.group
    }

    pub fn into_inner(mut self) -> Arc<C> {
        self.context.take().expect("host context already released")
    }
}

impl<C: ManagedContext + 'static> Deref for HostContext<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.context.as_deref().expect("host context already released")
    }
}

impl<C: ManagedContext + 'static> Drop for HostContext<C> {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.group.mark_zombie_context(context);
        }
    }
}
