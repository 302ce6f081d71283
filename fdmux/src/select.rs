//! `select(2)` backend.
//!
//! The three descriptor sets are growable bitsets sized to the highest
//! registered descriptor rather than fixed `fd_set`s, so descriptors beyond
//! `FD_SETSIZE` can be watched where the kernel accepts them.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::libc;

use crate::event::Interest;
use crate::selector::{BackendKind, Relocated, Selector, SelectorEvent};

// Word type of the platform's `fd_set`, so the bit layout matches on
// big-endian hosts as well.
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "openbsd", target_os = "netbsd"))]
type Word = u32;
#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "openbsd", target_os = "netbsd")))]
type Word = libc::c_ulong;

const WORD_BITS: usize = Word::BITS as usize;

fn bit(fd: usize) -> Word {
    (1 as Word) << (fd % WORD_BITS)
}

/// Descriptor bitset that grows on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct FdBits {
    words: Vec<Word>,
}

impl FdBits {
    fn insert(&mut self, fd: usize) {
        let word = fd / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= bit(fd);
    }

    fn remove(&mut self, fd: usize) {
        if let Some(w) = self.words.get_mut(fd / WORD_BITS) {
            *w &= !bit(fd);
        }
    }

    fn contains(&self, fd: usize) -> bool {
        self.words
            .get(fd / WORD_BITS)
            .map_or(false, |w| *w & bit(fd) != 0)
    }

    fn set(&mut self, fd: usize, on: bool) {
        if on {
            self.insert(fd);
        } else {
            self.remove(fd);
        }
    }

    /// Copy `other` into `self`, padded to `words` words.
    fn load(&mut self, other: &FdBits, words: usize) {
        self.words.clear();
        self.words.extend_from_slice(&other.words[..other.words.len().min(words)]);
        self.words.resize(words, 0);
    }

    fn highest(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .rev()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * WORD_BITS + (WORD_BITS - 1 - w.leading_zeros() as usize))
    }

    fn as_fd_set(&mut self) -> *mut libc::fd_set {
        if self.words.is_empty() {
            std::ptr::null_mut()
        } else {
            self.words.as_mut_ptr() as *mut libc::fd_set
        }
    }
}

/// Selector built on `select(2)`.
#[derive(Debug, Default)]
pub struct SelectSelector {
    read: FdBits,
    write: FdBits,
    except: FdBits,
    ready_read: FdBits,
    ready_write: FdBits,
    ready_except: FdBits,
    nfds: usize,
}

impl SelectSelector {
    /// Create an empty selector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest watched descriptor plus one.
    pub fn nfds(&self) -> usize {
        self.nfds
    }

    fn recompute_nfds(&mut self) {
        self.nfds = [self.read.highest(), self.write.highest(), self.except.highest()]
            .into_iter()
            .flatten()
            .max()
            .map_or(0, |fd| fd + 1);
    }
}

fn index(fd: RawFd) -> io::Result<usize> {
    usize::try_from(fd).map_err(|_| io::Error::from_raw_os_error(libc::EBADF))
}

impl Selector for SelectSelector {
    fn kind(&self) -> BackendKind {
        BackendKind::Select
    }

    fn watch_waker(&mut self, fd: RawFd) -> io::Result<()> {
        let i = index(fd)?;
        self.read.insert(i);
        self.nfds = self.nfds.max(i + 1);
        Ok(())
    }

    fn register(&mut self, fd: RawFd, interest: Interest, _aux: &mut Option<usize>) -> io::Result<()> {
        let i = index(fd)?;
        self.read.set(i, interest.is_readable());
        self.write.set(i, interest.is_writable());
        self.except.set(i, interest.is_exceptional());
        self.recompute_nfds();
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd, _aux: &mut Option<usize>) -> io::Result<Option<Relocated>> {
        let i = index(fd)?;
        self.read.remove(i);
        self.write.remove(i);
        self.except.remove(i);
        if i + 1 >= self.nfds {
            self.recompute_nfds();
        }
        Ok(None)
    }

    fn select(&mut self, timeout: Option<Duration>, events: &mut VecDeque<SelectorEvent>) -> io::Result<()> {
        let words = (self.nfds + WORD_BITS - 1) / WORD_BITS;
        self.ready_read.load(&self.read, words);
        self.ready_write.load(&self.write, words);
        self.ready_except.load(&self.except, words);

        let mut tv = timeout.map(|d| {
            // Round up so a sub-microsecond remainder does not spin.
            let micros = d.as_micros() + u128::from(d.subsec_nanos() % 1000 != 0);
            libc::timeval {
                tv_sec: (micros / 1_000_000).min(libc::time_t::MAX as u128) as libc::time_t,
                tv_usec: (micros % 1_000_000) as libc::suseconds_t,
            }
        });
        let tv_ptr = tv.as_mut().map_or(std::ptr::null_mut(), |tv| tv as *mut libc::timeval);

        let n = unsafe {
            libc::select(
                self.nfds as libc::c_int,
                self.ready_read.as_fd_set(),
                self.ready_write.as_fd_set(),
                self.ready_except.as_fd_set(),
                tv_ptr,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n == 0 {
            return Ok(());
        }

        for word in 0..words {
            let bits = self.ready_read.words[word] | self.ready_write.words[word] | self.ready_except.words[word];
            if bits == 0 {
                continue;
            }
            for offset in 0..WORD_BITS {
                let fd = word * WORD_BITS + offset;
                if bits & bit(fd) == 0 {
                    continue;
                }
                let mut ready = Interest::EMPTY;
                if self.ready_read.contains(fd) {
                    ready |= Interest::READABLE;
                }
                if self.ready_write.contains(fd) {
                    ready |= Interest::WRITABLE;
                }
                if self.ready_except.contains(fd) {
                    ready |= Interest::EXCEPTIONAL;
                }
                events.push_back(SelectorEvent { fd: fd as RawFd, ready });
            }
        }
        Ok(())
    }
}
