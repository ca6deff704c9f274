//! Configuration for the shared platform and for individual context groups.
//!
//! Both structs have sensible defaults and can be read from the environment:
//!
//! | Variable | Field |
//! |---|---|
//! | `CONTEXT_GROUP_TEARDOWN` | `PlatformConfig::teardown` (`retain` / `shutdown`) |
//! | `CONTEXT_GROUP_PLATFORM_THREADS` | `PlatformConfig::worker_threads` |
//! | `CONTEXT_GROUP_ENGINE_FLAGS` | `PlatformConfig::engine_flags` (space separated) |
//! | `CONTEXT_GROUP_SNAPSHOT` | `GroupConfig::snapshot_path` |
//! | `CONTEXT_GROUP_STRICT_REFS` | `GroupConfig::strict_reference_checks` (`1`/`0`) |

use std::path::PathBuf;
use std::sync::OnceLock;

/// Global configuration for the process-wide platform
static PLATFORM_CONFIG: OnceLock<PlatformConfig> = OnceLock::new();

/// Platform worker threads used when none are configured
pub const DEFAULT_PLATFORM_THREADS: u32 = 4;

/// What happens when the last platform reference is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TeardownPolicy {
    /// Never tear the platform down once it has been initialized.
    ///
    /// Re-initializing the engine platform after a real teardown crashes, so
    /// the refcount is allowed to reach zero without any shutdown.
    #[default]
    Retain,

    /// Shut the platform down when the refcount returns to zero.
    ///
    /// The platform is then gone for the rest of the process: a later
    /// `acquire()` fails with `GroupError::PlatformShutDown`.
    ShutdownWhenUnused,
}

impl TeardownPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "retain" | "never" => Some(Self::Retain),
            "shutdown" | "shutdown_when_unused" => Some(Self::ShutdownWhenUnused),
            _ => None,
        }
    }
}

/// Configuration for the shared engine platform
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub teardown: TeardownPolicy,
    /// Worker threads for the engine platform (background compilation, GC).
    /// `0` lets the engine pick.
    pub worker_threads: u32,
    /// Engine flags applied once, before initialization
    pub engine_flags: Vec<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            teardown: TeardownPolicy::Retain,
            worker_threads: DEFAULT_PLATFORM_THREADS,
            engine_flags: Vec::new(),
        }
    }
}

impl PlatformConfig {
    /// Build a config from `CONTEXT_GROUP_*` variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("CONTEXT_GROUP_TEARDOWN") {
            match TeardownPolicy::parse(&value) {
                Some(policy) => config.teardown = policy,
                None => log::warn!("Ignoring unknown CONTEXT_GROUP_TEARDOWN value: {}", value),
            }
        }

        if let Ok(value) = std::env::var("CONTEXT_GROUP_PLATFORM_THREADS") {
            match value.trim().parse() {
                Ok(threads) => config.worker_threads = threads,
                Err(e) => log::warn!(
                    "Ignoring invalid CONTEXT_GROUP_PLATFORM_THREADS value {}: {}",
                    value,
                    e
                ),
            }
        }

        if let Ok(value) = std::env::var("CONTEXT_GROUP_ENGINE_FLAGS") {
            config.engine_flags = value.split_whitespace().map(str::to_string).collect();
        }

        config
    }
}

/// Initialize the process-wide platform configuration
///
/// Must be called before the first `EnginePlatform::global()` access to have
/// any effect. Later calls are ignored with a warning.
pub fn init_platform(config: PlatformConfig) {
    if PLATFORM_CONFIG.set(config).is_err() {
        log::warn!("Engine platform configuration already initialized");
    } else {
        log::info!(
            "Engine platform configured: {:?}",
            PLATFORM_CONFIG.get()
        );
    }
}

/// The process-wide platform configuration (from the environment if never set).
pub(crate) fn platform_config() -> &'static PlatformConfig {
    PLATFORM_CONFIG.get_or_init(PlatformConfig::from_env)
}

/// Per-group configuration
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Heap snapshot used to seed owned instances
    pub snapshot_path: Option<PathBuf>,
    /// Panic when a context is collected on the host side while its process
    /// is still running. The panic comes after the whole zombie batch has
    /// been disposed. Enabled by default in debug builds.
    pub strict_reference_checks: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            strict_reference_checks: cfg!(debug_assertions),
        }
    }
}

impl GroupConfig {
    /// Build a config from `CONTEXT_GROUP_*` variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(path) = std::env::var_os("CONTEXT_GROUP_SNAPSHOT") {
            config.snapshot_path = Some(PathBuf::from(path));
        }

        if let Ok(value) = std::env::var("CONTEXT_GROUP_STRICT_REFS") {
            config.strict_reference_checks = matches!(value.trim(), "1" | "true" | "yes");
        }

        config
    }

    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn with_strict_reference_checks(mut self, strict: bool) -> Self {
        self.strict_reference_checks = strict;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teardown_policy_parse() {
        assert_eq!(TeardownPolicy::parse("retain"), Some(TeardownPolicy::Retain));
        assert_eq!(
            TeardownPolicy::parse(" Shutdown "),
            Some(TeardownPolicy::ShutdownWhenUnused)
        );
        assert_eq!(TeardownPolicy::parse("sometimes"), None);
    }

    #[test]
    fn test_defaults() {
        let platform = PlatformConfig::default();
        assert_eq!(platform.teardown, TeardownPolicy::Retain);
        assert_eq!(platform.worker_threads, DEFAULT_PLATFORM_THREADS);

        let group = GroupConfig::default();
        assert!(group.snapshot_path.is_none());
        assert_eq!(group.strict_reference_checks, cfg!(debug_assertions));
    }

    #[test]
    fn test_group_config_builders() {
        let config = GroupConfig::default()
            .with_snapshot("/tmp/heap.snap")
            .with_strict_reference_checks(false);

        assert_eq!(config.snapshot_path, Some(PathBuf::from("/tmp/heap.snap")));
        assert!(!config.strict_reference_checks);
    }
}
