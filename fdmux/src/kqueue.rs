//! `kqueue` backend (macOS, iOS, BSDs).
//!
//! Read and write interest map to one `EV_ONESHOT` filter each. Exceptional
//! interest has no filter of its own and rides on `EVFILT_READ`; it is
//! reported on end-of-file, error or out-of-band data.
//!
//! A descriptor registered for both directions may fire one filter while the
//! other stays armed, so delivery deletes whatever filters remain.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::libc;

use crate::event::Interest;
use crate::selector::{error_readiness, BackendKind, Relocated, Selector, SelectorEvent};

/// Marker stored in `aux` while the kernel knows the descriptor.
const IN_KERNEL: Option<usize> = Some(0);

/// Selector built on `kqueue`.
pub struct KqueueSelector {
    kq: RawFd,
    events: Vec<libc::kevent>,
    /// Filters armed per descriptor, as requested interest.
    armed: HashMap<RawFd, Interest>,
}

// The raw `udata` pointer inside `libc::kevent` is never used.
unsafe impl Send for KqueueSelector {}

fn filter_change(fd: RawFd, filter: FilterKind, flags: EventFlags) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
    ev.ident = fd as libc::uintptr_t;
    ev.filter = filter.native();
    ev.flags = flags.0;
    ev
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FilterKind {
    Read,
    Write,
}

impl FilterKind {
    #[allow(clippy::unnecessary_cast)]
    fn native(self) -> FilterCode {
        match self {
            FilterKind::Read => libc::EVFILT_READ as FilterCode,
            FilterKind::Write => libc::EVFILT_WRITE as FilterCode,
        }
    }

    fn wanted(self, interest: Interest) -> bool {
        match self {
            FilterKind::Read => interest.is_readable() || interest.is_exceptional(),
            FilterKind::Write => interest.is_writable(),
        }
    }
}

#[cfg(target_os = "netbsd")]
type FilterCode = u32;
#[cfg(not(target_os = "netbsd"))]
type FilterCode = i16;

#[cfg(target_os = "netbsd")]
type FlagCode = u32;
#[cfg(not(target_os = "netbsd"))]
type FlagCode = u16;

#[derive(Clone, Copy)]
struct EventFlags(FlagCode);

impl EventFlags {
    #[allow(clippy::unnecessary_cast)]
    fn arm_oneshot() -> Self {
        Self((libc::EV_ADD | libc::EV_ENABLE | libc::EV_ONESHOT) as FlagCode)
    }

    #[allow(clippy::unnecessary_cast)]
    fn arm_level() -> Self {
        Self((libc::EV_ADD | libc::EV_ENABLE) as FlagCode)
    }

    #[allow(clippy::unnecessary_cast)]
    fn delete() -> Self {
        Self(libc::EV_DELETE as FlagCode)
    }
}

impl KqueueSelector {
    /// Create a kqueue reporting at most `events_per_wait` filters per call.
    pub fn new(events_per_wait: usize) -> io::Result<Self> {
        let kq = nix::sys::event::kqueue()?;
        if unsafe { libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            let err = io::Error::last_os_error();
            let _ = nix::unistd::close(kq);
            return Err(err);
        }
        Ok(Self {
            kq,
            events: (0..events_per_wait.max(1)).map(|_| unsafe { std::mem::zeroed() }).collect(),
            armed: HashMap::new(),
        })
    }

    fn change(&self, change: libc::kevent) -> io::Result<()> {
        let n = unsafe { libc::kevent(self.kq, &change, 1, std::ptr::null_mut(), 0, std::ptr::null()) };
        if n == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Delete a filter that may already be gone.
    fn delete(&self, fd: RawFd, filter: FilterKind) -> io::Result<()> {
        match self.change(filter_change(fd, filter, EventFlags::delete())) {
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) => Ok(()),
            other => other,
        }
    }

    fn delete_all(&mut self, fd: RawFd, aux: &mut Option<usize>) -> io::Result<()> {
        *aux = None;
        if let Some(old) = self.armed.remove(&fd) {
            for filter in [FilterKind::Read, FilterKind::Write] {
                if filter.wanted(old) {
                    self.delete(fd, filter)?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for KqueueSelector {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.kq);
    }
}

impl std::fmt::Debug for KqueueSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KqueueSelector")
            .field("kq", &self.kq)
            .field("armed", &self.armed.len())
            .finish()
    }
}

#[allow(clippy::unnecessary_cast)]
fn translate(ev: &libc::kevent, requested: Interest) -> Interest {
    let mut ready = Interest::EMPTY;
    let flags = ev.flags as FlagCode;
    let failed = flags & (libc::EV_EOF | libc::EV_ERROR) as FlagCode != 0;

    if ev.filter == FilterKind::Read.native() {
        if requested.is_readable() {
            ready |= Interest::READABLE;
        }
        if requested.is_exceptional() && (failed || requested.difference(Interest::EXCEPTIONAL).is_empty()) {
            ready |= Interest::EXCEPTIONAL;
        }
    } else if ev.filter == FilterKind::Write.native() {
        ready |= Interest::WRITABLE;
    }
    if failed {
        ready |= error_readiness(requested);
    }
    if ready.is_empty() {
        ready = error_readiness(requested);
    }
    ready
}

impl Selector for KqueueSelector {
    fn kind(&self) -> BackendKind {
        BackendKind::Edge
    }

    fn sees_closed(&self) -> bool {
        false
    }

    fn watch_waker(&mut self, fd: RawFd) -> io::Result<()> {
        self.change(filter_change(fd, FilterKind::Read, EventFlags::arm_level()))
    }

    fn register(&mut self, fd: RawFd, interest: Interest, aux: &mut Option<usize>) -> io::Result<()> {
        let previous = self.armed.get(&fd).copied().unwrap_or(Interest::EMPTY);
        for filter in [FilterKind::Read, FilterKind::Write] {
            if filter.wanted(interest) {
                if let Err(e) = self.change(filter_change(fd, filter, EventFlags::arm_oneshot())) {
                    let _ = self.delete_all(fd, aux);
                    return Err(e);
                }
            } else if filter.wanted(previous) {
                self.delete(fd, filter)?;
            }
        }
        self.armed.insert(fd, interest);
        *aux = IN_KERNEL;
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd, aux: &mut Option<usize>) -> io::Result<Option<Relocated>> {
        self.delete_all(fd, aux)?;
        Ok(None)
    }

    fn select(&mut self, timeout: Option<Duration>, events: &mut VecDeque<SelectorEvent>) -> io::Result<()> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as _,
        });
        let ts_ptr = ts.as_ref().map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

        let n = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.len() as _,
                ts_ptr,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let first = events.len();
        for ev in &self.events[..n as usize] {
            let fd = ev.ident as RawFd;
            let requested = self.armed.get(&fd).copied().unwrap_or(Interest::READABLE);
            let ready = translate(ev, requested);
            // Both filters of one descriptor may fire in the same batch.
            match events.iter_mut().skip(first).find(|e| e.fd == fd) {
                Some(existing) => existing.ready |= ready,
                None => events.push_back(SelectorEvent { fd, ready }),
            }
        }
        Ok(())
    }
}
