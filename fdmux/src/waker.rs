//! Wake Channel
//!
//! A descriptor the reactor watches permanently so that another thread can
//! interrupt a blocking wait. Two transports exist: a non-blocking
//! close-on-exec self-pipe, and a UDP socket on the loopback interface that is
//! connected to itself (for hosts where only sockets can be waited on).
//!
//! Wakes coalesce. A `pending` flag keeps at most one byte in flight; wakes
//! issued before the consumer drains the channel collapse into a single
//! delivery carrying the most recent reason code. A wake is never lost: one
//! that races with the drain leaves a byte behind and is seen by the next
//! wait.

use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use nix::libc;

/// Transport used by the wake channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeMode {
    /// Anonymous pipe.
    #[default]
    Pipe,
    /// Loopback UDP socket connected to itself.
    Loopback,
}

impl WakeMode {
    /// Lower-case name, as accepted by `FDMUX_WAKE`.
    pub fn as_str(&self) -> &'static str {
        match self {
            WakeMode::Pipe => "pipe",
            WakeMode::Loopback => "loopback",
        }
    }

    /// Parse a mode name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pipe" => Some(WakeMode::Pipe),
            "loopback" | "socket" | "udp" => Some(WakeMode::Loopback),
            _ => None,
        }
    }
}

enum Transport {
    Pipe { read: RawFd, write: RawFd },
    Loopback(UdpSocket),
}

struct Inner {
    transport: Transport,
    pending: AtomicBool,
    reason: AtomicU32,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Transport::Pipe { read, write } = self.transport {
            let _ = nix::unistd::close(read);
            let _ = nix::unistd::close(write);
        }
    }
}

/// Receiving end of the wake channel, owned by a reactor.
pub struct WakeChannel {
    inner: Arc<Inner>,
}

/// Cloneable sending end; may be used from any thread.
#[derive(Clone)]
pub struct WakeHandle {
    inner: Arc<Inner>,
}

impl WakeChannel {
    /// Create a wake channel using `mode`.
    pub fn new(mode: WakeMode) -> io::Result<Self> {
        let transport = match mode {
            WakeMode::Pipe => {
                let (read, write) = nonblocking_pipe()?;
                Transport::Pipe { read, write }
            }
            WakeMode::Loopback => {
                let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
                socket.connect(socket.local_addr()?)?;
                socket.set_nonblocking(true)?;
                Transport::Loopback(socket)
            }
        };
        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                pending: AtomicBool::new(false),
                reason: AtomicU32::new(0),
            }),
        })
    }

    /// Transport in use.
    pub fn mode(&self) -> WakeMode {
        match self.inner.transport {
            Transport::Pipe { .. } => WakeMode::Pipe,
            Transport::Loopback(_) => WakeMode::Loopback,
        }
    }

    /// Descriptor to watch for readability.
    pub fn read_fd(&self) -> RawFd {
        match &self.inner.transport {
            Transport::Pipe { read, .. } => *read,
            Transport::Loopback(socket) => socket.as_raw_fd(),
        }
    }

    /// A sending handle for other threads.
    pub fn handle(&self) -> WakeHandle {
        WakeHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Consume every byte in flight.
    ///
    /// Returns the latest reason code if a wake was pending, or `None` when
    /// the readiness was left over from a wake already delivered.
    pub fn drain(&self) -> io::Result<Option<u32>> {
        let mut buf = [0u8; 64];
        loop {
            let n = match &self.inner.transport {
                Transport::Pipe { read, .. } => {
                    let n = unsafe { libc::read(*read, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                }
                Transport::Loopback(socket) => socket.recv(&mut buf),
            };
            match n {
                // A zero-length pipe read means the write end is gone.
                Ok(0) if self.mode() == WakeMode::Pipe => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.inner.pending.swap(false, Ordering::AcqRel) {
            Ok(Some(self.inner.reason.load(Ordering::Acquire)))
        } else {
            Ok(None)
        }
    }
}

impl WakeHandle {
    /// Interrupt the owning reactor's wait with `reason`.
    pub fn wake_up(&self, reason: u32) -> io::Result<()> {
        self.inner.reason.store(reason, Ordering::Release);
        if self.inner.pending.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        loop {
            let result = match &self.inner.transport {
                Transport::Pipe { write, .. } => {
                    let byte = 1u8;
                    let n = unsafe { libc::write(*write, &byte as *const u8 as *const libc::c_void, 1) };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(())
                    }
                }
                Transport::Loopback(socket) => socket.send(&[1]).map(|_| ()),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // A full buffer already makes the channel readable.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    self.inner.pending.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        }
    }
}

impl std::fmt::Debug for WakeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeChannel")
            .field("mode", &self.mode())
            .field("fd", &self.read_fd())
            .finish()
    }
}

impl std::fmt::Debug for WakeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeHandle")
            .field("pending", &self.inner.pending.load(Ordering::Relaxed))
            .finish()
    }
}

fn nonblocking_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    for &fd in &fds {
        let configured = unsafe {
            libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) != -1
                && libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) != -1
        };
        if !configured {
            let err = io::Error::last_os_error();
            let _ = nix::unistd::close(fds[0]);
            let _ = nix::unistd::close(fds[1]);
            return Err(err);
        }
    }
    Ok((fds[0], fds[1]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn modes() -> [WakeMode; 2] {
        [WakeMode::Pipe, WakeMode::Loopback]
    }

    #[test]
    fn test_drain_without_wake() {
        for mode in modes() {
            let channel = WakeChannel::new(mode).unwrap();
            assert_eq!(channel.mode(), mode);
            assert_eq!(channel.drain().unwrap(), None);
        }
    }

    #[test]
    fn test_wakes_coalesce_to_latest_reason() {
        for mode in modes() {
            let channel = WakeChannel::new(mode).unwrap();
            let handle = channel.handle();
            handle.wake_up(1).unwrap();
            handle.wake_up(2).unwrap();
            handle.wake_up(3).unwrap();
            assert_eq!(channel.drain().unwrap(), Some(3));
            assert_eq!(channel.drain().unwrap(), None);
        }
    }

    #[test]
    fn test_wake_from_other_thread() {
        let channel = WakeChannel::new(WakeMode::Pipe).unwrap();
        let handle = channel.handle();
        thread::spawn(move || handle.wake_up(42).unwrap()).join().unwrap();
        assert_eq!(channel.drain().unwrap(), Some(42));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(WakeMode::parse("pipe"), Some(WakeMode::Pipe));
        assert_eq!(WakeMode::parse("LOOPBACK"), Some(WakeMode::Loopback));
        assert_eq!(WakeMode::parse("eventfd"), None);
        assert_eq!(WakeMode::default().as_str(), "pipe");
    }
}
