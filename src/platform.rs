//! Process-wide engine platform with reference-counted init/teardown.
//!
//! The engine platform can only be initialized once per process. Every
//! context group holds a `PlatformLease`; the first lease initializes the
//! platform through its `PlatformBackend`, and releasing the last one is
//! governed by the configured `TeardownPolicy`. With the default policy the
//! platform is never torn down once used, because re-initializing it after a
//! real teardown is unsafe.
//!
//! `EnginePlatform::global()` is the process singleton. Tests and embedders
//! that want isolation build their own with `EnginePlatform::new`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::allocator::GenericAllocator;
use crate::config::{PlatformConfig, TeardownPolicy};
use crate::error::GroupError;

static PLATFORM: OnceLock<Arc<EnginePlatform>> = OnceLock::new();

/// The engine-specific half of the platform: what actually gets initialized.
pub trait PlatformBackend: Send + Sync {
    /// Called on the 0 → 1 refcount transition, at most once per backend.
    fn initialize(&self, config: &PlatformConfig);

    /// Called when the policy allows teardown and the refcount reaches zero.
    fn shutdown(&self);
}

/// Backend for engines without a process-wide platform.
///
/// Counts calls so the refcount behavior stays observable.
#[derive(Debug, Default)]
pub struct HeadlessPlatform {
    initialized: AtomicU64,
    shut_down: AtomicU64,
}

impl HeadlessPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `initialize` ran.
    pub fn init_calls(&self) -> u64 {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Number of times `shutdown` ran.
    pub fn shutdown_calls(&self) -> u64 {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl PlatformBackend for HeadlessPlatform {
    fn initialize(&self, config: &PlatformConfig) {
        self.initialized.fetch_add(1, Ordering::SeqCst);
        log::debug!(
            "Headless platform initialized ({} worker threads requested)",
            config.worker_threads
        );
    }

    fn shutdown(&self) {
        self.shut_down.fetch_add(1, Ordering::SeqCst);
        log::debug!("Headless platform shut down");
    }
}

impl<B: PlatformBackend + ?Sized> PlatformBackend for Arc<B> {
    fn initialize(&self, config: &PlatformConfig) {
        (**self).initialize(config)
    }

    fn shutdown(&self) {
        (**self).shutdown()
    }
}

#[derive(Debug, Default)]
struct PlatformState {
    refcount: usize,
    initialized: bool,
    shut_down: bool,
    init_count: u64,
    shutdown_count: u64,
}

/// Point-in-time view of the platform's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformStats {
    pub refcount: usize,
    pub initialized: bool,
    pub shut_down: bool,
    pub init_count: u64,
    pub shutdown_count: u64,
}

/// Reference-counted platform service shared by all context groups.
pub struct EnginePlatform {
    backend: Box<dyn PlatformBackend>,
    config: PlatformConfig,
    state: Mutex<PlatformState>,
    allocator: Arc<GenericAllocator>,
}

impl EnginePlatform {
    /// Create an independent platform service around `backend`.
    pub fn new(backend: impl PlatformBackend + 'static, config: PlatformConfig) -> Arc<Self> {
        Arc::new(Self {
            backend: Box::new(backend),
            config,
            state: Mutex::new(PlatformState::default()),
            allocator: Arc::new(GenericAllocator::new()),
        })
    }

    /// Get the process-wide platform, creating it on first use.
    ///
    /// Uses the V8 backend when the `v8` feature is enabled, the headless
    /// backend otherwise. Configuration comes from `config::init_platform`
    /// or the environment.
    pub fn global() -> Arc<Self> {
        PLATFORM
            .get_or_init(|| {
                let config = crate::config::platform_config().clone();

                #[cfg(feature = "v8")]
                let platform = Self::new(crate::engine::v8_engine::V8Platform::new(), config);

                #[cfg(not(feature = "v8"))]
                let platform = Self::new(HeadlessPlatform::new(), config);

                platform
            })
            .clone()
    }

    /// Take one reference on the platform, initializing it on 0 → 1.
    pub fn acquire(self: &Arc<Self>) -> Result<PlatformLease, GroupError> {
        let mut state = self.state.lock().expect("platform state poisoned");

        if state.shut_down {
            log::error!("Refusing to re-initialize an engine platform that was shut down");
            return Err(GroupError::PlatformShutDown);
        }

        state.refcount += 1;

        if state.refcount == 1 && !state.initialized {
            self.backend.initialize(&self.config);
            state.initialized = true;
            state.init_count += 1;
            log::info!("Engine platform initialized");
        }

        log::debug!("Engine platform acquired (refcount: {})", state.refcount);

        Ok(PlatformLease {
            platform: Arc::clone(self),
            released: false,
        })
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("platform state poisoned");

        if state.refcount == 0 {
            log::warn!("Engine platform released more often than acquired");
            return;
        }

        state.refcount -= 1;
        log::debug!("Engine platform released (refcount: {})", state.refcount);

        if state.refcount > 0 || !state.initialized {
            return;
        }

        match self.config.teardown {
            TeardownPolicy::Retain => {
                log::debug!("Last platform reference released; teardown disabled, platform retained");
            }
            TeardownPolicy::ShutdownWhenUnused => {
                self.backend.shutdown();
                state.initialized = false;
                state.shut_down = true;
                state.shutdown_count += 1;
                log::info!("Engine platform shut down");
            }
        }
    }

    pub fn stats(&self) -> PlatformStats {
        let state = self.state.lock().expect("platform state poisoned");

        PlatformStats {
            refcount: state.refcount,
            initialized: state.initialized,
            shut_down: state.shut_down,
            init_count: state.init_count,
            shutdown_count: state.shutdown_count,
        }
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// The buffer allocator shared by every instance on this platform.
    pub fn allocator(&self) -> &Arc<GenericAllocator> {
        &self.allocator
    }
}

impl std::fmt::Debug for EnginePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePlatform")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// One reference on an `EnginePlatform`, released on drop.
pub struct PlatformLease {
    platform: Arc<EnginePlatform>,
    released: bool,
}

impl PlatformLease {
    pub fn platform(&self) -> &Arc<EnginePlatform> {
        &self.platform
    }

    /// Release the reference now rather than at drop.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.platform.release();
        }
    }
}

impl Drop for PlatformLease {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for PlatformLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformLease")
            .field("released", &self.released)
            .finish()
    }
}
