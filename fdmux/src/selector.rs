//! OS readiness backends.
//!
//! Every backend implements [`Selector`]; the reactor owns one as a
//! `Box<dyn Selector>` picked at construction from a [`BackendKind`]. The
//! backend only talks to the OS. Registration state, deadlines and the
//! oneshot rule live in the reactor.
//!
//! ```text
//!             ┌───────────────────────────┐
//!             │          Reactor          │
//!             └─────────────┬─────────────┘
//!                           │ dyn Selector
//!      ┌──────────────┬─────┴────────┬──────────────┐
//!      ▼              ▼              ▼              ▼
//! ┌─────────┐    ┌─────────┐    ┌─────────┐    ┌─────────┐
//! │  epoll  │    │ kqueue  │    │  poll   │    │ select  │
//! │ (Edge)  │    │ (Edge)  │    │         │    │         │
//! └─────────┘    └─────────┘    └─────────┘    └─────────┘
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::libc;

use crate::event::Interest;

/// Which OS primitive a reactor uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// `epoll` with `EPOLLONESHOT`, or `kqueue` with `EV_ONESHOT`.
    Edge,
    /// `poll(2)` over a compacted descriptor array.
    Poll,
    /// `select(2)` over growable bitsets.
    Select,
}

impl BackendKind {
    /// Every backend kind, in order of preference.
    pub const ALL: [BackendKind; 3] = [BackendKind::Edge, BackendKind::Poll, BackendKind::Select];

    /// Check whether this backend exists on the host.
    pub fn is_available(self) -> bool {
        match self {
            BackendKind::Edge => cfg!(any(
                target_os = "linux",
                target_os = "android",
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            )),
            BackendKind::Poll | BackendKind::Select => true,
        }
    }

    /// Backends available on the host.
    pub fn available() -> Vec<BackendKind> {
        Self::ALL.into_iter().filter(|kind| kind.is_available()).collect()
    }

    /// Lower-case name, as accepted by `FDMUX_BACKEND`.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Edge => "edge",
            BackendKind::Poll => "poll",
            BackendKind::Select => "select",
        }
    }

    /// Parse a backend name. `epoll` and `kqueue` are accepted for `edge`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "edge" | "epoll" | "kqueue" => Some(BackendKind::Edge),
            "poll" => Some(BackendKind::Poll),
            "select" => Some(BackendKind::Select),
            _ => None,
        }
    }
}

impl Default for BackendKind {
    fn default() -> Self {
        if BackendKind::Edge.is_available() {
            BackendKind::Edge
        } else {
            BackendKind::Poll
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Readiness reported by one OS call for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorEvent {
    /// Ready descriptor.
    pub fd: RawFd,
    /// Translated conditions, never empty.
    pub ready: Interest,
}

/// A descriptor whose backend index changed during a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocated {
    /// Descriptor that moved.
    pub fd: RawFd,
    /// Its new index.
    pub index: usize,
}

/// Interface to an OS readiness primitive.
///
/// `aux` is the per-descriptor bookkeeping value kept in the descriptor table
/// on the backend's behalf: an array index for poll, a "known to the kernel"
/// marker for the edge backends.
pub trait Selector: Send {
    /// Backend kind.
    fn kind(&self) -> BackendKind;

    /// Permanently watch `fd` for readability, level-triggered.
    ///
    /// Called once, before any other registration.
    fn watch_waker(&mut self, fd: RawFd) -> io::Result<()>;

    /// Arm `fd` for `interest`, replacing any earlier interest.
    fn register(&mut self, fd: RawFd, interest: Interest, aux: &mut Option<usize>) -> io::Result<()>;

    /// Forget `fd` entirely.
    ///
    /// Returns the descriptor that moved to fill the hole, if any.
    fn deregister(&mut self, fd: RawFd, aux: &mut Option<usize>) -> io::Result<Option<Relocated>>;

    /// Stop reporting `fd` after its readiness was delivered.
    ///
    /// Backends whose kernel already disarmed the registration may keep it
    /// known so the next `register` is a cheap modification.
    fn disarm(&mut self, fd: RawFd, aux: &mut Option<usize>) -> io::Result<Option<Relocated>> {
        self.deregister(fd, aux)
    }

    /// Block for at most `timeout` (`None` blocks indefinitely) and append
    /// every ready descriptor to `events`.
    ///
    /// An interrupted call fails with `ErrorKind::Interrupted`.
    fn select(&mut self, timeout: Option<Duration>, events: &mut VecDeque<SelectorEvent>) -> io::Result<()>;

    /// Whether closing a registered descriptor surfaces from `select`,
    /// either as an event (`POLLNVAL`) or as an `EBADF` failure.
    ///
    /// Kernels that silently drop closed descriptors from their interest
    /// list return `false`; the reactor then checks for them while idle.
    fn sees_closed(&self) -> bool {
        true
    }
}

/// Create the selector for `kind`.
pub fn create_selector(kind: BackendKind, events_per_wait: usize) -> io::Result<Box<dyn Selector>> {
    match kind {
        BackendKind::Edge => create_edge_selector(events_per_wait),
        BackendKind::Poll => Ok(Box::new(crate::poll::PollSelector::new())),
        BackendKind::Select => Ok(Box::new(crate::select::SelectSelector::new())),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn create_edge_selector(events_per_wait: usize) -> io::Result<Box<dyn Selector>> {
    Ok(Box::new(crate::epoll::EpollSelector::new(events_per_wait)?))
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn create_edge_selector(events_per_wait: usize) -> io::Result<Box<dyn Selector>> {
    Ok(Box::new(crate::kqueue::KqueueSelector::new(events_per_wait)?))
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
fn create_edge_selector(_events_per_wait: usize) -> io::Result<Box<dyn Selector>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "no edge-oriented readiness primitive on this platform",
    ))
}

/// Check whether `fd` no longer names an open descriptor.
pub(crate) fn is_closed(fd: RawFd) -> bool {
    let rc = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    rc == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::EBADF)
}

/// Millisecond timeout for `epoll_wait`/`poll`, rounded up.
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_millis() + u128::from(d.subsec_nanos() % 1_000_000 != 0);
            ms.min(i32::MAX as u128) as i32
        }
    }
}

/// Map error and hang-up conditions onto the caller's interest.
///
/// The conditions count as the requested read/write readiness so the caller's
/// next I/O call observes the error; with neither requested they surface as
/// exceptional.
pub(crate) fn error_readiness(requested: Interest) -> Interest {
    let rw = requested.intersection(Interest::READABLE | Interest::WRITABLE);
    if rw.is_empty() {
        Interest::EXCEPTIONAL
    } else {
        rw
    }
}
