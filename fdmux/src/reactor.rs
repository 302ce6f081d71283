//! Reactor
//!
//! The single-threaded multiplexer. It combines the descriptor table, the
//! timeout heap, the wake channel and one OS backend, and implements the wait
//! loop shared by every backend:
//!
//! 1. Hand out readiness cached from an earlier OS call. One OS call may
//!    report many descriptors but `wait` returns exactly one event.
//! 2. Fire the earliest descriptor deadline if it is due.
//! 3. Report `TimedOut` once the caller's deadline has passed.
//! 4. Block in the backend until the earlier of the caller's deadline and
//!    the earliest descriptor deadline, retrying on `EINTR`.
//!
//! Registrations are oneshot: delivering `Ready` or `Expired` for a
//! descriptor ends its registration.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::libc;

use crate::config::ReactorConfig;
use crate::deadline::Deadline;
use crate::error::{ReactorError, Result};
use crate::event::{Event, Interest};
use crate::heap::TimeoutHeap;
use crate::log::{self, LogBuilder, LogLevel};
use crate::selector::{create_selector, error_readiness, is_closed, BackendKind, Relocated, Selector, SelectorEvent};
use crate::table::DescriptorTable;
use crate::waker::{WakeChannel, WakeHandle};

/// Operations shared by [`Reactor`] and [`ShardedReactor`](crate::ShardedReactor).
pub trait Multiplexer<T> {
    /// Register `fd` for `interest` until `deadline`, replacing any earlier
    /// registration. An empty `interest` is equivalent to [`unset`](Self::unset).
    fn set(&mut self, fd: RawFd, interest: Interest, deadline: Deadline, tag: T) -> Result<()>;

    /// Drop the registration of `fd`, if any.
    fn unset(&mut self, fd: RawFd) -> Result<()>;

    /// Wait for the next event, or until `deadline`.
    fn wait(&mut self, deadline: Deadline) -> Result<Event<T>>;

    /// Make a concurrent or subsequent `wait` return `WokenUp`.
    fn wake_up(&mut self, reason: u32) -> Result<()>;

    /// Drop every registration, handing each tag to `callback` exactly once.
    /// Returns the number of registrations dropped.
    fn cancel_all<F: FnMut(RawFd, T)>(&mut self, callback: F) -> usize;
}

/// Single-threaded I/O readiness multiplexer with per-descriptor timeouts.
///
/// Mutating methods take `&mut self`, so registration and waiting are
/// serialized by the borrow checker. Other threads interrupt a wait through a
/// [`WakeHandle`].
pub struct Reactor<T> {
    table: DescriptorTable<T>,
    heap: TimeoutHeap,
    selector: Box<dyn Selector>,
    waker: WakeChannel,
    pending: VecDeque<SelectorEvent>,
    max_active: Option<usize>,
    closed_check_interval: Duration,
    last_closed_check: Instant,
}

impl<T> Reactor<T> {
    /// Create a reactor with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(ReactorConfig::default())
    }

    /// Create a reactor with `config`.
    pub fn with_config(config: ReactorConfig) -> Result<Self> {
        config.validate()?;
        let mut selector = create_selector(config.backend, config.events_per_wait)?;
        let waker = WakeChannel::new(config.wake)?;
        selector.watch_waker(waker.read_fd())?;

        LogBuilder::new(LogLevel::Debug)
            .target("fdmux::reactor")
            .message("reactor created")
            .field_str("backend", config.backend.as_str())
            .field_str("wake", config.wake.as_str())
            .field_int("max_descriptor", config.max_descriptor as i64)
            .emit();

        Ok(Self {
            table: DescriptorTable::new(config.initial_table_size, config.max_descriptor),
            heap: TimeoutHeap::new(),
            selector,
            waker,
            pending: VecDeque::with_capacity(config.events_per_wait),
            max_active: config.max_active,
            closed_check_interval: config.closed_check_interval,
            last_closed_check: Instant::now(),
        })
    }

    /// Backend in use.
    pub fn backend(&self) -> BackendKind {
        self.selector.kind()
    }

    /// Number of live registrations.
    pub fn active_count(&self) -> usize {
        self.table.active_count()
    }

    /// Check whether `fd` is registered.
    pub fn is_active(&self, fd: RawFd) -> bool {
        self.table.is_active(fd)
    }

    /// Tag of the live registration for `fd`.
    pub fn lookup_tag(&self, fd: RawFd) -> Option<&T> {
        self.table.lookup_tag(fd)
    }

    /// Number of registrations with a finite deadline.
    pub fn pending_timers(&self) -> usize {
        self.heap.len()
    }

    /// A cloneable handle other threads can use to interrupt `wait`.
    pub fn wake_handle(&self) -> WakeHandle {
        self.waker.handle()
    }

    /// Register `fd` for `interest` until `deadline`.
    ///
    /// Interest, deadline and tag replace any earlier registration wholesale,
    /// and readiness already fetched for `fd` is discarded. An empty
    /// `interest` is the same as [`unset`](Self::unset).
    pub fn set(&mut self, fd: RawFd, interest: Interest, deadline: Deadline, tag: T) -> Result<()> {
        let key = self.table.check(fd)?;
        if interest.is_empty() {
            return self.unset(fd);
        }
        // The number of a closed descriptor may now belong to the wake channel.
        if fd == self.waker.read_fd() {
            return Err(ReactorError::InvalidDescriptor(fd));
        }
        if let Some(limit) = self.max_active {
            if !self.table.is_active(fd) && self.table.active_count() >= limit {
                return Err(ReactorError::CapacityExceeded { limit });
            }
        }

        self.pending.retain(|e| e.fd != fd);
        self.table.reserve(fd)?;
        self.cancel_timer(fd);

        if let Some(aux) = self.table.aux_mut(fd) {
            if let Err(e) = self.selector.register(fd, interest, aux) {
                self.table.clear(fd);
                return Err(self.os_error("register", fd, e));
            }
        }
        self.table.set(fd, interest, deadline, tag)?;
        if let Some(at) = deadline.instant() {
            self.heap.push(key, at, &mut self.table);
        }
        Ok(())
    }

    /// Drop the registration of `fd`. Unregistered descriptors are ignored.
    pub fn unset(&mut self, fd: RawFd) -> Result<()> {
        self.table.check(fd)?;
        self.pending.retain(|e| e.fd != fd);
        if !self.table.is_active(fd) {
            return Ok(());
        }
        self.cancel_timer(fd);
        self.table.clear(fd);
        self.release(fd, true).map_err(|e| self.os_error("deregister", fd, e))
    }

    /// Wait for the next event, or until `deadline`.
    ///
    /// An already elapsed `deadline` still collects readiness once without
    /// blocking before reporting `TimedOut`.
    pub fn wait(&mut self, deadline: Deadline) -> Result<Event<T>> {
        let mut polled = false;
        loop {
            while let Some(ready) = self.pending.pop_front() {
                if ready.fd == self.waker.read_fd() {
                    match self.waker.drain()? {
                        Some(reason) => return Ok(Event::WokenUp { reason }),
                        None => continue,
                    }
                }
                if let Some(event) = self.deliver(ready)? {
                    return Ok(event);
                }
            }

            let now = Instant::now();
            if let Some((key, at)) = self.heap.peek() {
                if at <= now {
                    if let Some(event) = self.expire(key)? {
                        return Ok(event);
                    }
                    continue;
                }
            }
            if polled && deadline.is_expired_at(now) {
                return Ok(Event::TimedOut);
            }

            let next_timer = Deadline::from(self.heap.peek().map(|(_, at)| at));
            let mut wake_at = deadline.min(next_timer);
            let watch_closed = !self.selector.sees_closed() && self.table.active_count() > 0;
            if watch_closed {
                wake_at = wake_at.min(self.next_closed_check());
            }
            match self.selector.select(wake_at.remaining_at(now), &mut self.pending) {
                Ok(()) => {
                    polled = true;
                    if watch_closed && self.next_closed_check().is_expired() {
                        self.sweep_closed();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.raw_os_error() == Some(libc::EBADF) => {
                    if self.sweep_closed() == 0 {
                        return Err(self.os_error("wait", -1, e));
                    }
                    polled = true;
                }
                Err(e) => return Err(self.os_error("wait", -1, e)),
            }
        }
    }

    /// Interrupt a concurrent or subsequent `wait`.
    pub fn wake_up(&self, reason: u32) -> Result<()> {
        self.waker.handle().wake_up(reason)?;
        Ok(())
    }

    /// Drop every registration in ascending descriptor order, handing each
    /// tag to `callback` exactly once. The OS wait is not called.
    pub fn cancel_all<F: FnMut(RawFd, T)>(&mut self, mut callback: F) -> usize {
        let mut count = 0;
        for fd in self.table.active_descriptors() {
            self.cancel_timer(fd);
            if let Err(e) = self.release(fd, true) {
                LogBuilder::new(LogLevel::Warn)
                    .target("fdmux::reactor")
                    .message("deregistration failed during cancel_all")
                    .field_int("fd", fd as i64)
                    .field_str("error", e.to_string())
                    .emit();
            }
            if let Some(tag) = self.table.clear(fd) {
                callback(fd, tag);
                count += 1;
            }
        }
        self.pending.clear();
        self.heap.clear(&mut self.table);

        if log::would_log(LogLevel::Debug) {
            LogBuilder::new(LogLevel::Debug)
                .target("fdmux::reactor")
                .message("cancelled all registrations")
                .field_int("count", count as i64)
                .emit();
        }
        count
    }

    /// Turn cached readiness into `Ready`, ending the registration.
    fn deliver(&mut self, ready: SelectorEvent) -> Result<Option<Event<T>>> {
        let fd = ready.fd;
        if !self.table.is_active(fd) {
            return Ok(None);
        }
        self.cancel_timer(fd);
        self.release(fd, false).map_err(|e| self.os_error("disarm", fd, e))?;
        Ok(self.table.clear(fd).map(|tag| Event::Ready {
            fd,
            ready: ready.ready,
            tag,
        }))
    }

    /// Fire the deadline at the top of the heap, ending the registration.
    fn expire(&mut self, key: usize) -> Result<Option<Event<T>>> {
        self.heap.pop(&mut self.table);
        let fd = key as RawFd;
        self.pending.retain(|e| e.fd != fd);
        self.release(fd, true).map_err(|e| self.os_error("deregister", fd, e))?;
        Ok(self.table.clear(fd).map(|tag| Event::Expired { fd, tag }))
    }

    fn next_closed_check(&self) -> Deadline {
        Deadline::from(self.last_closed_check.checked_add(self.closed_check_interval))
    }

    /// Queue error readiness for every registration whose descriptor was
    /// closed without `unset`. Returns how many were found.
    ///
    /// A closed number already reused by another open file goes unnoticed.
    fn sweep_closed(&mut self) -> usize {
        self.last_closed_check = Instant::now();
        let mut found = 0;
        for fd in self.table.active_descriptors() {
            if !is_closed(fd) {
                continue;
            }
            let interest = self.table.slot(fd).map_or(Interest::EMPTY, |slot| slot.interest());
            self.pending.retain(|e| e.fd != fd);
            self.pending.push_back(SelectorEvent {
                fd,
                ready: error_readiness(interest),
            });
            found += 1;
        }
        if found > 0 {
            LogBuilder::new(LogLevel::Debug)
                .target("fdmux::reactor")
                .message("registered descriptors were closed")
                .field_str("backend", self.backend().as_str())
                .field_int("count", found as i64)
                .emit();
        }
        found
    }

    fn cancel_timer(&mut self, fd: RawFd) {
        if let Some(pos) = self.table.slot(fd).and_then(|slot| slot.heap_index()) {
            self.heap.remove_at(pos, &mut self.table);
        }
    }

    /// Remove `fd` from the backend, following any relocation it causes.
    fn release(&mut self, fd: RawFd, full: bool) -> io::Result<()> {
        let Some(aux) = self.table.aux_mut(fd) else {
            return Ok(());
        };
        let moved = if full {
            self.selector.deregister(fd, aux)?
        } else {
            self.selector.disarm(fd, aux)?
        };
        if let Some(Relocated { fd: moved, index }) = moved {
            if let Some(aux) = self.table.aux_mut(moved) {
                *aux = Some(index);
            }
        }
        Ok(())
    }

    fn os_error(&self, op: &str, fd: RawFd, err: io::Error) -> ReactorError {
        LogBuilder::new(LogLevel::Error)
            .target("fdmux::reactor")
            .message(format!("{} failed", op))
            .field_str("backend", self.backend().as_str())
            .field_int("fd", fd as i64)
            .field_str("error", err.to_string())
            .emit();
        ReactorError::Io(err)
    }
}

impl<T> Multiplexer<T> for Reactor<T> {
    fn set(&mut self, fd: RawFd, interest: Interest, deadline: Deadline, tag: T) -> Result<()> {
        Reactor::set(self, fd, interest, deadline, tag)
    }

    fn unset(&mut self, fd: RawFd) -> Result<()> {
        Reactor::unset(self, fd)
    }

    fn wait(&mut self, deadline: Deadline) -> Result<Event<T>> {
        Reactor::wait(self, deadline)
    }

    fn wake_up(&mut self, reason: u32) -> Result<()> {
        Reactor::wake_up(self, reason)
    }

    fn cancel_all<F: FnMut(RawFd, T)>(&mut self, callback: F) -> usize {
        Reactor::cancel_all(self, callback)
    }
}

impl<T> std::fmt::Debug for Reactor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("backend", &self.backend())
            .field("active", &self.table.active_count())
            .field("timers", &self.heap.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
