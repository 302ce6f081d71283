//! Error type shared by every reactor flavour.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use crate::config::ConfigError;

/// Error returned by reactor operations.
///
/// Descriptor, capacity and configuration errors are caused by the caller
/// and leave the reactor usable. `Io` and `WorkerFailed` come
/// from the operating system; the instance that produced them should be torn
/// down and recreated.
#[derive(Debug)]
pub enum ReactorError {
    /// The descriptor is negative.
    InvalidDescriptor(RawFd),
    /// The descriptor is beyond the configured table cap.
    DescriptorOutOfRange {
        /// Offending descriptor.
        fd: RawFd,
        /// Largest descriptor value accepted plus one.
        max: usize,
    },
    /// The instance cannot accept another registration.
    CapacityExceeded {
        /// Maximum number of simultaneous registrations.
        limit: usize,
    },
    /// Hard OS failure.
    Io(io::Error),
    /// A worker of a sharded reactor failed and was retired.
    WorkerFailed {
        /// Worker identifier.
        worker: usize,
        /// Failure reported by the worker's reactor.
        source: io::Error,
    },
    /// The reactor has been shut down.
    Shutdown,
    /// The configuration was rejected at construction.
    Config(ConfigError),
}

impl ReactorError {
    /// Whether the error was caused by the caller rather than the OS.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            ReactorError::InvalidDescriptor(_)
                | ReactorError::DescriptorOutOfRange { .. }
                | ReactorError::CapacityExceeded { .. }
                | ReactorError::Config(_)
        )
    }
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactorError::InvalidDescriptor(fd) => write!(f, "invalid descriptor: {}", fd),
            ReactorError::DescriptorOutOfRange { fd, max } => {
                write!(f, "descriptor {} out of range (limit {})", fd, max)
            }
            ReactorError::CapacityExceeded { limit } => {
                write!(f, "registration capacity of {} exceeded", limit)
            }
            ReactorError::Io(e) => write!(f, "I/O error: {}", e),
            ReactorError::WorkerFailed { worker, source } => {
                write!(f, "worker {} failed: {}", worker, source)
            }
            ReactorError::Shutdown => write!(f, "reactor has been shut down"),
            ReactorError::Config(e) => write!(f, "configuration error: {}", e),
        }
    }
}

impl std::error::Error for ReactorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReactorError::Io(e) => Some(e),
            ReactorError::WorkerFailed { source, .. } => Some(source),
            ReactorError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ReactorError {
    fn from(err: io::Error) -> Self {
        ReactorError::Io(err)
    }
}

impl From<ConfigError> for ReactorError {
    fn from(err: ConfigError) -> Self {
        ReactorError::Config(err)
    }
}

/// Result type for reactor operations.
pub type Result<T> = std::result::Result<T, ReactorError>;
