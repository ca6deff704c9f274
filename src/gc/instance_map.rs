//! Process-wide routing of GC prologues to context groups.
//!
//! Engines expose a single static hook per instance. Every group registers
//! its instance here; the hook calls [`dispatch_gc_prologue`], which finds
//! the group's callbacks and invokes them. The map mutex is held only for
//! the lookup, never while callbacks run.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use super::callbacks::GcCallbackRegistry;
use crate::engine::{GcCallbackFlags, GcType, InstanceKey};

static INSTANCE_MAP: Mutex<BTreeMap<InstanceKey, Weak<GcCallbackRegistry>>> =
    Mutex::new(BTreeMap::new());

pub(crate) fn register(key: InstanceKey, registry: &Arc<GcCallbackRegistry>) {
    let previous = INSTANCE_MAP
        .lock()
        .expect("instance map poisoned")
        .insert(key, Arc::downgrade(registry));

    if previous.is_some() {
        log::warn!("Instance {:?} was already mapped to a context group; replaced", key);
    }
}

pub(crate) fn unregister(key: InstanceKey) -> bool {
    INSTANCE_MAP
        .lock()
        .expect("instance map poisoned")
        .remove(&key)
        .is_some()
}

/// Static GC-prologue trampoline.
///
/// Engine hooks call this with the collecting instance's key. Returns
/// whether a group was found for it.
pub fn dispatch_gc_prologue(key: InstanceKey, gc_type: GcType, flags: GcCallbackFlags) -> bool {
    let registry = INSTANCE_MAP
        .lock()
        .expect("instance map poisoned")
        .get(&key)
        .and_then(Weak::upgrade);

    match registry {
        Some(registry) => {
            registry.fire(gc_type, flags);
            true
        }
        None => {
            tracing::trace!("GC prologue for unmapped instance {:?}", key);
            false
        }
    }
}

/// Whether `key` currently routes to a group.
pub fn is_registered(key: InstanceKey) -> bool {
    INSTANCE_MAP
        .lock()
        .expect("instance map poisoned")
        .contains_key(&key)
}
