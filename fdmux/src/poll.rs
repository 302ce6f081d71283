//! `poll(2)` backend.
//!
//! Registrations live in a compact `pollfd` array with the wake channel at
//! index 0. A descriptor's `aux` is its array index; removal moves the last
//! entry into the hole and reports the move so the table can follow it.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::libc;

use crate::event::Interest;
use crate::selector::{error_readiness, timeout_ms, BackendKind, Relocated, Selector, SelectorEvent};

/// Selector built on `poll(2)`.
#[derive(Default)]
pub struct PollSelector {
    fds: Vec<libc::pollfd>,
}

impl std::fmt::Debug for PollSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.fds.iter().map(|p| (p.fd, p.events))).finish()
    }
}

impl PollSelector {
    /// Create an empty selector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of watched descriptors, the wake channel included.
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// Check whether nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }
}

fn native_mask(interest: Interest) -> libc::c_short {
    let mut mask = 0;
    if interest.is_readable() {
        mask |= libc::POLLIN;
    }
    if interest.is_writable() {
        mask |= libc::POLLOUT;
    }
    if interest.is_exceptional() {
        mask |= libc::POLLPRI;
    }
    mask
}

fn requested(mask: libc::c_short) -> Interest {
    let mut interest = Interest::EMPTY;
    if mask & libc::POLLIN != 0 {
        interest |= Interest::READABLE;
    }
    if mask & libc::POLLOUT != 0 {
        interest |= Interest::WRITABLE;
    }
    if mask & libc::POLLPRI != 0 {
        interest |= Interest::EXCEPTIONAL;
    }
    interest
}

fn translate(revents: libc::c_short, events: libc::c_short) -> Interest {
    let mut ready = requested(revents);
    // A descriptor closed while registered shows up as POLLNVAL.
    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        ready |= error_readiness(requested(events));
    }
    ready
}

impl Selector for PollSelector {
    fn kind(&self) -> BackendKind {
        BackendKind::Poll
    }

    fn watch_waker(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.insert(0, libc::pollfd { fd, events: libc::POLLIN, revents: 0 });
        Ok(())
    }

    fn register(&mut self, fd: RawFd, interest: Interest, aux: &mut Option<usize>) -> io::Result<()> {
        let events = native_mask(interest);
        match *aux {
            Some(index) if self.fds.get(index).map_or(false, |p| p.fd == fd) => {
                self.fds[index].events = events;
            }
            _ => {
                *aux = Some(self.fds.len());
                self.fds.push(libc::pollfd { fd, events, revents: 0 });
            }
        }
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd, aux: &mut Option<usize>) -> io::Result<Option<Relocated>> {
        let index = match aux.take() {
            Some(index) if self.fds.get(index).map_or(false, |p| p.fd == fd) => index,
            _ => return Ok(None),
        };
        self.fds.swap_remove(index);
        Ok(self.fds.get(index).map(|moved| Relocated { fd: moved.fd, index }))
    }

    fn select(&mut self, timeout: Option<Duration>, events: &mut VecDeque<SelectorEvent>) -> io::Result<()> {
        let n = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms(timeout)) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut remaining = n as usize;
        for pfd in &self.fds {
            if remaining == 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            remaining -= 1;
            let ready = translate(pfd.revents, pfd.events);
            if !ready.is_empty() {
                events.push_back(SelectorEvent { fd: pfd.fd, ready });
            }
        }
        Ok(())
    }
}
