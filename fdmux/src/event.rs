//! Interest flags and delivered events.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::RawFd;

/// Readiness interest, also used for the readiness reported back.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    /// No interest. Setting it is equivalent to `unset`.
    pub const EMPTY: Self = Self(0);
    /// Interested in read readiness.
    pub const READABLE: Self = Self(0b001);
    /// Interested in write readiness.
    pub const WRITABLE: Self = Self(0b010);
    /// Interested in exceptional conditions (priority data, errors).
    pub const EXCEPTIONAL: Self = Self(0b100);
    /// All three conditions.
    pub const ALL: Self = Self(0b111);

    /// Combine interests.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Bits present in both sets.
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Bits of `self` that are not in `other`.
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Check whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Check if readable interest is set.
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Check if writable interest is set.
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Check if exceptional interest is set.
    pub const fn is_exceptional(self) -> bool {
        self.0 & Self::EXCEPTIONAL.0 != 0
    }

    /// Raw bit representation.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Build from raw bits, dropping unknown ones.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }
}

impl BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("EMPTY");
        }
        let mut sep = "";
        for (flag, name) in [
            (Self::READABLE, "READABLE"),
            (Self::WRITABLE, "WRITABLE"),
            (Self::EXCEPTIONAL, "EXCEPTIONAL"),
        ] {
            if self.contains(flag) {
                write!(f, "{}{}", sep, name)?;
                sep = " | ";
            }
        }
        Ok(())
    }
}

/// One result of [`wait`](crate::Multiplexer::wait).
///
/// Each call yields exactly one event. Both `Ready` and `Expired` end the
/// registration: the descriptor must be `set` again to be observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<T> {
    /// The OS reported the descriptor ready. `ready` is never empty.
    Ready {
        /// Descriptor that became ready.
        fd: RawFd,
        /// Conditions reported by the backend.
        ready: Interest,
        /// Tag supplied at registration.
        tag: T,
    },
    /// The descriptor's own deadline passed before it became ready.
    Expired {
        /// Descriptor whose deadline fired.
        fd: RawFd,
        /// Tag supplied at registration.
        tag: T,
    },
    /// The deadline passed to `wait` elapsed with nothing else to report.
    TimedOut,
    /// Another thread called `wake_up`.
    WokenUp {
        /// Reason code of the most recent wake.
        reason: u32,
    },
}

impl<T> Event<T> {
    /// Descriptor this event refers to, if any.
    pub fn fd(&self) -> Option<RawFd> {
        match self {
            Event::Ready { fd, .. } | Event::Expired { fd, .. } => Some(*fd),
            Event::TimedOut | Event::WokenUp { .. } => None,
        }
    }

    /// Tag carried by this event, if any.
    pub fn tag(&self) -> Option<&T> {
        match self {
            Event::Ready { tag, .. } | Event::Expired { tag, .. } => Some(tag),
            Event::TimedOut | Event::WokenUp { .. } => None,
        }
    }

    /// Map the tag, keeping everything else.
    pub fn map_tag<U>(self, f: impl FnOnce(T) -> U) -> Event<U> {
        match self {
            Event::Ready { fd, ready, tag } => Event::Ready { fd, ready, tag: f(tag) },
            Event::Expired { fd, tag } => Event::Expired { fd, tag: f(tag) },
            Event::TimedOut => Event::TimedOut,
            Event::WokenUp { reason } => Event::WokenUp { reason },
        }
    }
}
