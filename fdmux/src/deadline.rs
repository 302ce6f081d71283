//! Absolute Deadlines
//!
//! Both the caller-level timeout of `wait` and the per-descriptor timeout of
//! `set` are absolute points in time, computed once when they are created.
//! Repeated partial waits (after `EINTR` or a spurious early return) recompute
//! the remaining time from the same instant, so they never drift.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

/// An absolute expiry time, or never.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Deadline {
    /// `None` means the deadline never expires.
    instant: Option<Instant>,
}

impl Deadline {
    /// A deadline that never expires.
    pub const fn never() -> Self {
        Self { instant: None }
    }

    /// Create a deadline at a specific instant.
    pub fn at(instant: Instant) -> Self {
        Self { instant: Some(instant) }
    }

    /// Create a deadline that expires after a duration from now.
    ///
    /// Durations too large to represent are treated as never.
    pub fn after(duration: Duration) -> Self {
        Self {
            instant: Instant::now().checked_add(duration),
        }
    }

    /// Get the underlying instant, `None` for never.
    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }

    /// Check whether this deadline never expires.
    pub fn is_never(&self) -> bool {
        self.instant.is_none()
    }

    /// Check if the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Check if the deadline has passed at `now`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        matches!(self.instant, Some(at) if now >= at)
    }

    /// Time left at `now`.
    ///
    /// Returns `None` for a deadline that never expires and `Duration::ZERO`
    /// once it has passed.
    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        self.instant.map(|at| at.saturating_duration_since(now))
    }

    /// The earlier of two deadlines.
    pub fn min(self, other: Self) -> Self {
        if other < self {
            other
        } else {
            self
        }
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.instant, other.instant) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(&b),
        }
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Self::at(instant)
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Self {
        Self::after(duration)
    }
}

impl From<Option<Instant>> for Deadline {
    fn from(instant: Option<Instant>) -> Self {
        Self { instant }
    }
}
