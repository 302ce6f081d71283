//! # fdmux
//!
//! I/O readiness multiplexing with per-descriptor timeouts.
//!
//! - **Reactor**: register a descriptor for read, write or exceptional
//!   readiness with an optional deadline and an opaque tag, then wait for
//!   exactly one event at a time
//! - **Backends**: `epoll`/`kqueue` in oneshot mode, `poll(2)` and
//!   `select(2)` behind one [`Selector`](selector::Selector) trait
//! - **Wake channel**: interrupt a blocked wait from any thread
//! - **Sharded reactor**: spread descriptors over worker threads when one
//!   wait call can observe only a bounded number of objects
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            REACTOR                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │  Descriptor  │  │   Timeout    │  │     Wake     │          │
//! │  │    Table     │◄─┤    Heap      │  │   Channel    │          │
//! │  │  (table.rs)  │  │  (heap.rs)   │  │  (waker.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                                   │                   │
//! │         └─────────────────┬─────────────────┘                   │
//! │                           ▼                                     │
//! │  ┌───────────────────────────────────────────────────────┐     │
//! │  │              Selector (selector.rs)                   │     │
//! │  │   epoll.rs / kqueue.rs  │  poll.rs  │  select.rs      │     │
//! │  └───────────────────────────────────────────────────────┘     │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::os::unix::io::AsRawFd;
//! use std::time::Duration;
//!
//! use fdmux::{Deadline, Event, Interest, Reactor};
//!
//! # fn main() -> fdmux::Result<()> {
//! let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
//! let mut reactor = Reactor::new()?;
//! reactor.set(
//!     socket.as_raw_fd(),
//!     Interest::READABLE,
//!     Deadline::after(Duration::from_millis(100)),
//!     "socket",
//! )?;
//!
//! match reactor.wait(Deadline::never())? {
//!     Event::Ready { tag, .. } => println!("{} is readable", tag),
//!     Event::Expired { tag, .. } => println!("{} timed out", tag),
//!     _ => {}
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod deadline;
pub mod error;
pub mod event;
pub mod heap;
pub mod log;
pub mod poll;
pub mod reactor;
pub mod select;
pub mod selector;
pub mod sharded;
pub mod table;
pub mod waker;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub mod kqueue;

// Re-exports
pub use config::{ConfigError, ReactorConfig, ReactorConfigBuilder, ShardConfig, ShardConfigBuilder};
pub use deadline::Deadline;
pub use error::{ReactorError, Result};
pub use event::{Event, Interest};
pub use reactor::{Multiplexer, Reactor};
pub use selector::BackendKind;
pub use sharded::ShardedReactor;
pub use waker::{WakeHandle, WakeMode};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
