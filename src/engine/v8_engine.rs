//! V8 backend.
//!
//! One isolate per owned group; the GC prologue of every isolate goes
//! through a single `extern "C"` hook keyed by the isolate's address.

use std::ffi::c_void;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::{
    Engine, EngineInstance, GcCallbackFlags, GcType, InstanceKey, InstanceParams, ManagedValue,
};
use crate::config::PlatformConfig;
use crate::error::GroupError;
use crate::platform::PlatformBackend;

/// Process-wide V8 platform bring-up.
#[derive(Default)]
pub struct V8Platform {
    platform: Mutex<Option<v8::SharedRef<v8::Platform>>>,
}

impl V8Platform {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlatformBackend for V8Platform {
    fn initialize(&self, config: &PlatformConfig) {
        for flag in &config.engine_flags {
            v8::V8::set_flags_from_string(flag);
        }

        let platform = v8::new_default_platform(config.worker_threads, false).make_shared();
        v8::V8::initialize_platform(platform.clone());
        v8::V8::initialize();

        *self.platform.lock().expect("v8 platform poisoned") = Some(platform);
        log::info!(
            "V8 initialized ({} platform threads, {} flags)",
            config.worker_threads,
            config.engine_flags.len()
        );
    }

    fn shutdown(&self) {
        let platform = self.platform.lock().expect("v8 platform poisoned").take();

        if platform.is_some() {
            // SAFETY: called once, after the last lease is gone, so no isolate is alive
            unsafe {
                v8::V8::dispose();
            }
            v8::V8::dispose_platform();
            log::info!("V8 platform disposed");
        }
    }
}

/// GC prologue hook shared by every isolate.
extern "C" fn gc_prologue_hook(
    isolate: *mut v8::Isolate,
    gc_type: v8::GCType,
    flags: v8::GCCallbackFlags,
    _data: *mut c_void,
) {
    // SAFETY: both are 32-bit flag words on the C side
    let (gc_type, flags) = unsafe {
        (
            std::mem::transmute::<v8::GCType, u32>(gc_type),
            std::mem::transmute::<v8::GCCallbackFlags, u32>(flags),
        )
    };

    crate::gc::dispatch_gc_prologue(
        InstanceKey::from_ptr(isolate as *const v8::Isolate),
        GcType::from_bits(gc_type),
        GcCallbackFlags::from_bits(flags),
    );
}

/// Engine creating one `v8::OwnedIsolate` per instance.
#[derive(Debug, Default)]
pub struct V8Engine;

impl V8Engine {
    pub fn new() -> Self {
        Self
    }
}

impl Engine for V8Engine {
    fn create_instance(&self, params: InstanceParams) -> Result<Box<dyn EngineInstance>, GroupError> {
        let mut create = v8::CreateParams::default()
            .array_buffer_allocator(Arc::clone(&params.allocator).into_v8_allocator());

        if let Some(snapshot) = &params.snapshot {
            // SAFETY: the bytes are kept in the instance and dropped after the isolate
            let blob: &'static [u8] =
                unsafe { std::slice::from_raw_parts(snapshot.as_ptr(), snapshot.len()) };
            create = create.snapshot_blob(blob.into());
        }

        let isolate = v8::Isolate::new(create);
        let key = InstanceKey::from_ptr(&*isolate as *const v8::Isolate);

        Ok(Box::new(V8Instance {
            isolate: Some(isolate),
            _snapshot: params.snapshot,
            key,
            hooked: false,
        }))
    }
}

/// An owned or host-supplied isolate.
pub struct V8Instance {
    isolate: Option<v8::OwnedIsolate>,
    // Must outlive `isolate`
    _snapshot: Option<Bytes>,
    key: InstanceKey,
    hooked: bool,
}

impl V8Instance {
    /// Wrap an isolate created by the host, e.g. for a borrowed group.
    pub fn from_isolate(isolate: v8::OwnedIsolate) -> Self {
        let key = InstanceKey::from_ptr(&*isolate as *const v8::Isolate);

        Self {
            isolate: Some(isolate),
            _snapshot: None,
            key,
            hooked: false,
        }
    }

    pub fn isolate(&mut self) -> Option<&mut v8::OwnedIsolate> {
        self.isolate.as_mut()
    }
}

impl EngineInstance for V8Instance {
    fn key(&self) -> InstanceKey {
        self.key
    }

    fn install_gc_prologue_hook(&mut self) {
        if self.hooked {
            return;
        }

        if let Some(isolate) = self.isolate.as_mut() {
            isolate.add_gc_prologue_callback(
                gc_prologue_hook,
                std::ptr::null_mut(),
                v8::GCType::kGCTypeAll,
            );
            self.hooked = true;
        }
    }

    fn remove_gc_prologue_hook(&mut self) {
        if !self.hooked {
            return;
        }

        if let Some(isolate) = self.isolate.as_mut() {
            isolate.remove_gc_prologue_callback(gc_prologue_hook, std::ptr::null_mut());
        }
        self.hooked = false;
    }

    fn destroy(mut self: Box<Self>) {
        self.remove_gc_prologue_hook();
        // Isolate first, then the snapshot it was created from
        drop(self.isolate.take());
        log::debug!("Destroyed isolate {:?}", self.key);
    }
}

/// A persistent handle to a V8 value.
pub struct V8Value {
    global: Mutex<Option<v8::Global<v8::Value>>>,
}

impl V8Value {
    pub fn new(global: v8::Global<v8::Value>) -> Arc<Self> {
        Arc::new(Self {
            global: Mutex::new(Some(global)),
        })
    }

    pub fn get(&self) -> Option<v8::Global<v8::Value>> {
        self.global.lock().expect("v8 value poisoned").clone()
    }
}

// SAFETY: the global is only touched on the isolate's owning thread; other
// threads merely move the Arc into the group's zombie queue.
unsafe impl Send for V8Value {}
unsafe impl Sync for V8Value {}

impl ManagedValue for V8Value {
    fn dispose(&self) {
        drop(self.global.lock().expect("v8 value poisoned").take());
    }
}
