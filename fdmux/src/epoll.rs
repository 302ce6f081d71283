//! `epoll` backend (Linux, Android).
//!
//! Descriptors are armed with `EPOLLONESHOT`: once the kernel reports one it
//! stays in the interest list but disarmed, so delivery needs no system call
//! and re-arming is a single `EPOLL_CTL_MOD`.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::libc;
use nix::sys::epoll::{Epoll, EpollCreateFlags};

use crate::event::Interest;
use crate::selector::{error_readiness, timeout_ms, BackendKind, Relocated, Selector, SelectorEvent};

/// Marker stored in `aux` while the kernel knows the descriptor.
const IN_KERNEL: Option<usize> = Some(0);

/// Selector built on `epoll`.
pub struct EpollSelector {
    epoll: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl EpollSelector {
    /// Create an epoll instance reporting at most `events_per_wait` descriptors per call.
    pub fn new(events_per_wait: usize) -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            epoll: epoll.0,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; events_per_wait.max(1)],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, data: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: data };
        let ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut event as *mut libc::epoll_event
        };
        if unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, ptr) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl std::fmt::Debug for EpollSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpollSelector")
            .field("epoll", &self.epoll)
            .field("capacity", &self.events.len())
            .finish()
    }
}

/// The requested interest travels with the event so error conditions can be
/// mapped back onto it.
fn pack(fd: RawFd, interest: Interest) -> u64 {
    (fd as u32 as u64) | (u64::from(interest.bits()) << 32)
}

fn unpack(data: u64) -> (RawFd, Interest) {
    (data as u32 as RawFd, Interest::from_bits_truncate((data >> 32) as u8))
}

fn native_mask(interest: Interest) -> u32 {
    let mut mask = 0;
    if interest.is_readable() {
        mask |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        mask |= libc::EPOLLOUT as u32;
    }
    if interest.is_exceptional() {
        mask |= libc::EPOLLPRI as u32;
    }
    mask
}

fn translate(events: u32, requested: Interest) -> Interest {
    let mut ready = Interest::EMPTY;
    if events & libc::EPOLLIN as u32 != 0 {
        ready |= Interest::READABLE;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        ready |= Interest::WRITABLE;
    }
    if events & libc::EPOLLPRI as u32 != 0 {
        ready |= Interest::EXCEPTIONAL;
    }
    if events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
        ready |= error_readiness(requested);
    }
    if ready.is_empty() {
        ready = error_readiness(requested);
    }
    ready
}

impl Selector for EpollSelector {
    fn kind(&self) -> BackendKind {
        BackendKind::Edge
    }

    fn sees_closed(&self) -> bool {
        false
    }

    fn watch_waker(&mut self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN as u32, pack(fd, Interest::READABLE))
    }

    fn register(&mut self, fd: RawFd, interest: Interest, aux: &mut Option<usize>) -> io::Result<()> {
        let events = native_mask(interest) | libc::EPOLLONESHOT as u32;
        let data = pack(fd, interest);
        // The kernel may disagree with `aux` when a descriptor number was
        // closed and reused, so each operation falls back to the other.
        let result = if aux.is_some() {
            match self.ctl(libc::EPOLL_CTL_MOD, fd, events, data) {
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => self.ctl(libc::EPOLL_CTL_ADD, fd, events, data),
                other => other,
            }
        } else {
            match self.ctl(libc::EPOLL_CTL_ADD, fd, events, data) {
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => self.ctl(libc::EPOLL_CTL_MOD, fd, events, data),
                other => other,
            }
        };
        match result {
            Ok(()) => {
                *aux = IN_KERNEL;
                Ok(())
            }
            Err(e) => {
                *aux = None;
                Err(e)
            }
        }
    }

    fn deregister(&mut self, fd: RawFd, aux: &mut Option<usize>) -> io::Result<Option<Relocated>> {
        if aux.take().is_some() {
            match self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0) {
                Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) => {}
                other => other?,
            }
        }
        Ok(None)
    }

    fn disarm(&mut self, _fd: RawFd, _aux: &mut Option<usize>) -> io::Result<Option<Relocated>> {
        // EPOLLONESHOT already disarmed it in the kernel.
        Ok(None)
    }

    fn select(&mut self, timeout: Option<Duration>, events: &mut VecDeque<SelectorEvent>) -> io::Result<()> {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        for event in &self.events[..n as usize] {
            let (fd, requested) = unpack(event.u64);
            events.push_back(SelectorEvent {
                fd,
                ready: translate(event.events, requested),
            });
        }
        Ok(())
    }
}
