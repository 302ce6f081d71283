//! Reactor Configuration
//!
//! Configuration can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `FDMUX_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `FDMUX_BACKEND` | Backend (`edge`/`poll`/`select`) | `edge` where available |
//! | `FDMUX_WAKE` | Wake transport (`pipe`/`loopback`) | `pipe` |
//! | `FDMUX_MAX_DESCRIPTOR` | Largest accepted descriptor plus one | 1048576 |
//! | `FDMUX_INITIAL_TABLE_SIZE` | Slots allocated on first use | 64 |
//! | `FDMUX_EVENTS_PER_WAIT` | Readiness entries fetched per OS call | 64 |
//! | `FDMUX_MAX_ACTIVE` | Registration cap (0 = unlimited) | 0 |
//! | `FDMUX_CLOSED_CHECK_MS` | How often the edge backend looks for closed descriptors | 1000 |
//! | `FDMUX_OBJECTS_PER_WAIT` | Objects one sharded worker waits on | 63 |
//! | `FDMUX_MAX_WORKERS` | Sharded worker cap | 1024 |
//! | `FDMUX_WORKER_IDLE_MS` | Idle time before a worker retires | 30000 |
//!
//! [`ShardConfig`] reads the same variables for its workers' reactors, except
//! that `FDMUX_BACKEND` defaults to `select` there.
//!
//! Logging is configured separately through `FDMUX_LOG_LEVEL` and
//! `FDMUX_LOG_FORMAT` (see [`crate::log::init_from_env`]).
//!
//! # Example
//!
//! ```rust
//! use fdmux::{BackendKind, ReactorConfig};
//!
//! let config = ReactorConfig::builder()
//!     .backend(BackendKind::Poll)
//!     .max_descriptor(4096)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.backend, BackendKind::Poll);
//! ```

use std::env;
use std::time::Duration;

use crate::selector::BackendKind;
use crate::waker::WakeMode;

/// Default descriptor cap.
pub const DEFAULT_MAX_DESCRIPTOR: usize = 1 << 20;

/// Default number of objects a single sharded worker waits on.
pub const DEFAULT_OBJECTS_PER_WAIT: usize = 63;

/// Default interval between closed-descriptor checks.
pub const DEFAULT_CLOSED_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration of a single reactor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorConfig {
    /// OS readiness primitive.
    /// Default: edge-oriented where available, otherwise poll.
    pub backend: BackendKind,

    /// Wake channel transport.
    /// Default: pipe.
    pub wake: WakeMode,

    /// Descriptors at or above this value are rejected.
    /// Default: 1,048,576.
    pub max_descriptor: usize,

    /// Slots allocated the first time the table grows.
    /// Default: 64.
    pub initial_table_size: usize,

    /// Readiness entries fetched from the OS per call.
    /// Default: 64.
    pub events_per_wait: usize,

    /// Maximum number of simultaneous registrations.
    /// `None` means unlimited (default).
    pub max_active: Option<usize>,

    /// How often a backend that cannot see descriptors being closed (epoll,
    /// kqueue) checks its registrations for closed ones while idle.
    /// Default: 1 second.
    pub closed_check_interval: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            wake: WakeMode::default(),
            max_descriptor: DEFAULT_MAX_DESCRIPTOR,
            initial_table_size: 64,
            events_per_wait: 64,
            max_active: None,
            closed_check_interval: DEFAULT_CLOSED_CHECK_INTERVAL,
        }
    }
}

impl ReactorConfig {
    /// Create a new builder.
    pub fn builder() -> ReactorConfigBuilder {
        ReactorConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables use defaults. Unparsable or out-of-range values are
    /// ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(kind) = env::var("FDMUX_BACKEND").ok().as_deref().and_then(BackendKind::parse) {
            if kind.is_available() {
                config.backend = kind;
            }
        }

        if let Some(mode) = env::var("FDMUX_WAKE").ok().as_deref().and_then(WakeMode::parse) {
            config.wake = mode;
        }

        if let Some(val) = parse_env_usize("FDMUX_MAX_DESCRIPTOR") {
            if val > 0 {
                config.max_descriptor = val;
                config.initial_table_size = config.initial_table_size.min(val);
            }
        }

        if let Some(val) = parse_env_usize("FDMUX_INITIAL_TABLE_SIZE") {
            if val <= config.max_descriptor {
                config.initial_table_size = val;
            }
        }

        if let Some(val) = parse_env_usize("FDMUX_EVENTS_PER_WAIT") {
            if val > 0 {
                config.events_per_wait = val;
            }
        }

        if let Some(val) = parse_env_usize("FDMUX_MAX_ACTIVE") {
            config.max_active = if val > 0 { Some(val) } else { None };
        }

        if let Some(val) = parse_env_usize("FDMUX_CLOSED_CHECK_MS") {
            if val > 0 {
                config.closed_check_interval = Duration::from_millis(val as u64);
            }
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backend.is_available() {
            return Err(ConfigError::Unsupported {
                field: "backend".into(),
                value: self.backend.as_str().into(),
            });
        }

        if self.max_descriptor == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_descriptor".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.initial_table_size > self.max_descriptor {
            return Err(ConfigError::InvalidValue {
                field: "initial_table_size".into(),
                message: "must not exceed max_descriptor".into(),
            });
        }

        if self.events_per_wait == 0 {
            return Err(ConfigError::InvalidValue {
                field: "events_per_wait".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.max_active == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "max_active".into(),
                message: "must be at least 1 when set".into(),
            });
        }

        if self.closed_check_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "closed_check_interval".into(),
                message: "must be positive".into(),
            });
        }

        Ok(())
    }
}

/// Configuration of a sharded multi-worker reactor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardConfig {
    /// Objects a single worker's wait call may observe, its wake channel
    /// included.
    /// Default: 63.
    pub objects_per_wait: usize,

    /// Maximum number of worker threads.
    /// Default: 1024.
    pub max_workers: usize,

    /// How long an unloaded worker lingers before retiring.
    /// Default: 30 seconds.
    pub worker_idle_timeout: Duration,

    /// Configuration of each worker's reactor. Its `max_active` is replaced
    /// by the worker capacity.
    /// Default: select backend.
    pub reactor: ReactorConfig,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            objects_per_wait: DEFAULT_OBJECTS_PER_WAIT,
            max_workers: 1024,
            worker_idle_timeout: Duration::from_secs(30),
            reactor: ReactorConfig {
                backend: BackendKind::Select,
                ..ReactorConfig::default()
            },
        }
    }
}

impl ShardConfig {
    /// Create a new builder.
    pub fn builder() -> ShardConfigBuilder {
        ShardConfigBuilder::default()
    }

    /// Registrations one worker can hold.
    pub fn worker_capacity(&self) -> usize {
        self.objects_per_wait.saturating_sub(1)
    }

    /// Load configuration from environment variables.
    ///
    /// The worker reactor reads the same variables as
    /// [`ReactorConfig::from_env`], except that `FDMUX_BACKEND` defaults to
    /// `select`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let backend = config.reactor.backend;
        config.reactor = ReactorConfig::from_env();
        if env::var("FDMUX_BACKEND").is_err() {
            config.reactor.backend = backend;
        }

        if let Some(val) = parse_env_usize("FDMUX_OBJECTS_PER_WAIT") {
            if val >= 2 {
                config.objects_per_wait = val;
            }
        }

        if let Some(val) = parse_env_usize("FDMUX_MAX_WORKERS") {
            if val > 0 {
                config.max_workers = val;
            }
        }

        if let Some(val) = parse_env_usize("FDMUX_WORKER_IDLE_MS") {
            config.worker_idle_timeout = Duration::from_millis(val as u64);
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.objects_per_wait < 2 {
            return Err(ConfigError::InvalidValue {
                field: "objects_per_wait".into(),
                message: "must be at least 2 (one slot is the wake channel)".into(),
            });
        }

        if self.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_workers".into(),
                message: "must be at least 1".into(),
            });
        }

        self.reactor.validate()
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid configuration value.
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// The value names something this host does not provide.
    Unsupported {
        /// Field name.
        field: String,
        /// Rejected value.
        value: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { field, message } => {
                write!(f, "invalid configuration for '{}': {}", field, message)
            }
            ConfigError::Unsupported { field, value } => {
                write!(f, "'{}' is not supported on this platform for '{}'", value, field)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Builder for [`ReactorConfig`].
#[derive(Debug, Clone, Default)]
pub struct ReactorConfigBuilder {
    config: ReactorConfig,
}

impl ReactorConfigBuilder {
    /// Set the backend.
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.config.backend = backend;
        self
    }

    /// Set the wake channel transport.
    pub fn wake(mut self, wake: WakeMode) -> Self {
        self.config.wake = wake;
        self
    }

    /// Set the descriptor cap.
    pub fn max_descriptor(mut self, max: usize) -> Self {
        self.config.max_descriptor = max;
        self.config.initial_table_size = self.config.initial_table_size.min(max);
        self
    }

    /// Set the initial table size.
    pub fn initial_table_size(mut self, size: usize) -> Self {
        self.config.initial_table_size = size;
        self
    }

    /// Set how many readiness entries one OS call may return.
    pub fn events_per_wait(mut self, n: usize) -> Self {
        self.config.events_per_wait = n;
        self
    }

    /// Cap simultaneous registrations.
    pub fn max_active(mut self, max: Option<usize>) -> Self {
        self.config.max_active = max;
        self
    }

    /// Set how often the edge backend checks for closed descriptors.
    pub fn closed_check_interval(mut self, interval: Duration) -> Self {
        self.config.closed_check_interval = interval;
        self
    }

    /// Build the configuration, validating it.
    pub fn build(self) -> Result<ReactorConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Builder for [`ShardConfig`].
#[derive(Debug, Clone, Default)]
pub struct ShardConfigBuilder {
    config: ShardConfig,
}

impl ShardConfigBuilder {
    /// Set the per-worker object limit.
    pub fn objects_per_wait(mut self, n: usize) -> Self {
        self.config.objects_per_wait = n;
        self
    }

    /// Set the worker cap.
    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.max_workers = n;
        self
    }

    /// Set the idle time before a worker retires.
    pub fn worker_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.worker_idle_timeout = timeout;
        self
    }

    /// Set the worker reactor configuration.
    pub fn reactor(mut self, reactor: ReactorConfig) -> Self {
        self.config.reactor = reactor;
        self
    }

    /// Build the configuration, validating it.
    pub fn build(self) -> Result<ShardConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReactorConfig::default();
        assert!(config.backend.is_available());
        assert_eq!(config.wake, WakeMode::Pipe);
        assert_eq!(config.max_descriptor, 1_048_576);
        assert_eq!(config.initial_table_size, 64);
        assert_eq!(config.events_per_wait, 64);
        assert_eq!(config.max_active, None);
        assert_eq!(config.closed_check_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());

        let shard = ShardConfig::default();
        assert_eq!(shard.objects_per_wait, 63);
        assert_eq!(shard.worker_capacity(), 62);
        assert_eq!(shard.reactor.backend, BackendKind::Select);
        assert!(shard.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ReactorConfig::builder()
            .backend(BackendKind::Select)
            .wake(WakeMode::Loopback)
            .max_descriptor(32)
            .events_per_wait(8)
            .max_active(Some(10))
            .build()
            .unwrap();

        assert_eq!(config.backend, BackendKind::Select);
        assert_eq!(config.wake, WakeMode::Loopback);
        assert_eq!(config.initial_table_size, 32);
        assert_eq!(config.max_active, Some(10));
    }

    #[test]
    fn test_builder_validation() {
        assert!(ReactorConfig::builder().max_descriptor(0).build().is_err());
        assert!(ReactorConfig::builder().events_per_wait(0).build().is_err());
        assert!(ReactorConfig::builder().max_active(Some(0)).build().is_err());
        assert!(ReactorConfig::builder()
            .closed_check_interval(Duration::ZERO)
            .build()
            .is_err());
        assert!(ReactorConfig::builder()
            .max_descriptor(16)
            .initial_table_size(17)
            .build()
            .is_err());
        assert!(ShardConfig::builder().objects_per_wait(1).build().is_err());
        assert!(ShardConfig::builder().max_workers(0).build().is_err());
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )))]
    #[test]
    fn test_unavailable_backend_rejected() {
        let err = ReactorConfig::builder().backend(BackendKind::Edge).build().unwrap_err();
        assert!(matches!(err, ConfigError::Unsupported { .. }));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "events_per_wait".into(),
            message: "must be at least 1".into(),
        };
        assert!(err.to_string().contains("events_per_wait"));
        let err = ConfigError::Unsupported {
            field: "backend".into(),
            value: "edge".into(),
        };
        assert!(err.to_string().contains("edge"));
    }

    #[test]
    fn test_from_env_with_no_vars() {
        for var in ["FDMUX_BACKEND", "FDMUX_MAX_DESCRIPTOR", "FDMUX_OBJECTS_PER_WAIT"] {
            env::remove_var(var);
        }
        let config = ReactorConfig::from_env();
        assert_eq!(config.max_descriptor, DEFAULT_MAX_DESCRIPTOR);
        let shard = ShardConfig::from_env();
        assert_eq!(shard.objects_per_wait, DEFAULT_OBJECTS_PER_WAIT);
        assert_eq!(shard.reactor.backend, BackendKind::Select);
    }
}
