//! Descriptor Table
//!
//! One [`Slot`] per descriptor number, stored in a dense vector addressed by
//! the descriptor value itself. The table grows geometrically on demand and
//! never shrinks; slots are only ever marked inactive.

use std::os::unix::io::RawFd;

use crate::deadline::Deadline;
use crate::error::{ReactorError, Result};
use crate::event::Interest;
use crate::heap::HeapIndex;
use crate::log::{self, LogBuilder, LogLevel};

/// Per-descriptor registration state.
#[derive(Debug)]
pub struct Slot<T> {
    interest: Interest,
    deadline: Deadline,
    tag: Option<T>,
    heap_index: Option<usize>,
    aux: Option<usize>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            interest: Interest::EMPTY,
            deadline: Deadline::never(),
            tag: None,
            heap_index: None,
            aux: None,
        }
    }
}

impl<T> Slot<T> {
    /// Requested interest, empty when inactive.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// Registration deadline.
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Caller tag, present while active.
    pub fn tag(&self) -> Option<&T> {
        self.tag.as_ref()
    }

    /// Position in the timeout heap.
    pub fn heap_index(&self) -> Option<usize> {
        self.heap_index
    }

    /// Backend bookkeeping value.
    pub fn aux(&self) -> Option<usize> {
        self.aux
    }

    /// Check if a registration is live.
    pub fn is_active(&self) -> bool {
        !self.interest.is_empty()
    }
}

/// Dense descriptor-indexed registration table.
#[derive(Debug)]
pub struct DescriptorTable<T> {
    slots: Vec<Slot<T>>,
    initial_size: usize,
    max_descriptor: usize,
    active: usize,
}

impl<T> DescriptorTable<T> {
    /// Create an empty table.
    ///
    /// No slot is allocated until the first descriptor is stored; the first
    /// allocation holds at least `initial_size` slots. Descriptors at or above
    /// `max_descriptor` are rejected.
    pub fn new(initial_size: usize, max_descriptor: usize) -> Self {
        Self {
            slots: Vec::new(),
            initial_size: initial_size.min(max_descriptor),
            max_descriptor,
            active: 0,
        }
    }

    /// Validate a descriptor value against the table bounds.
    pub fn check(&self, fd: RawFd) -> Result<usize> {
        if fd < 0 {
            return Err(ReactorError::InvalidDescriptor(fd));
        }
        let index = fd as usize;
        if index >= self.max_descriptor {
            return Err(ReactorError::DescriptorOutOfRange {
                fd,
                max: self.max_descriptor,
            });
        }
        Ok(index)
    }

    /// Number of slots currently allocated.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Largest accepted descriptor plus one.
    pub fn max_descriptor(&self) -> usize {
        self.max_descriptor
    }

    /// Number of active registrations.
    pub fn active_count(&self) -> usize {
        self.active
    }

    /// Slot for `fd`, if one was ever allocated.
    pub fn slot(&self, fd: RawFd) -> Option<&Slot<T>> {
        usize::try_from(fd).ok().and_then(|i| self.slots.get(i))
    }

    /// Check whether `fd` has a live registration.
    pub fn is_active(&self, fd: RawFd) -> bool {
        self.slot(fd).map_or(false, Slot::is_active)
    }

    /// Tag of the live registration for `fd`.
    pub fn lookup_tag(&self, fd: RawFd) -> Option<&T> {
        self.slot(fd).and_then(Slot::tag)
    }

    /// Every active descriptor in ascending order.
    pub fn active_descriptors(&self) -> Vec<RawFd> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_active())
            .map(|(i, _)| i as RawFd)
            .collect()
    }

    /// Make sure a slot exists for `fd`, growing the table if needed.
    pub fn reserve(&mut self, fd: RawFd) -> Result<usize> {
        let index = self.check(fd)?;
        if index >= self.slots.len() {
            let doubled = self.slots.len().saturating_mul(2);
            let new_len = (index + 1)
                .max(doubled)
                .max(self.initial_size)
                .min(self.max_descriptor);
            if log::would_log(LogLevel::Trace) {
                LogBuilder::new(LogLevel::Trace)
                    .target("fdmux::table")
                    .message("growing descriptor table")
                    .field_int("from", self.slots.len() as i64)
                    .field_int("to", new_len as i64)
                    .emit();
            }
            self.slots.resize_with(new_len, Slot::default);
        }
        Ok(index)
    }

    /// Store a registration, replacing interest, deadline and tag wholesale.
    ///
    /// An empty `interest` clears the slot. Returns the previous tag. The
    /// heap and backend bookkeeping fields are left untouched.
    pub fn set(&mut self, fd: RawFd, interest: Interest, deadline: Deadline, tag: T) -> Result<Option<T>> {
        if interest.is_empty() {
            self.check(fd)?;
            return Ok(self.clear(fd));
        }
        let index = self.reserve(fd)?;
        let slot = &mut self.slots[index];
        if !slot.is_active() {
            self.active += 1;
        }
        slot.interest = interest;
        slot.deadline = deadline;
        Ok(slot.tag.replace(tag))
    }

    /// Mark `fd` inactive and return its tag.
    pub fn clear(&mut self, fd: RawFd) -> Option<T> {
        let index = usize::try_from(fd).ok()?;
        let slot = self.slots.get_mut(index)?;
        if slot.is_active() {
            self.active -= 1;
        }
        slot.interest = Interest::EMPTY;
        slot.deadline = Deadline::never();
        slot.tag.take()
    }

    /// Backend bookkeeping slot for `fd`.
    pub fn aux_mut(&mut self, fd: RawFd) -> Option<&mut Option<usize>> {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.slots.get_mut(i))
            .map(|slot| &mut slot.aux)
    }
}

impl<T> HeapIndex for DescriptorTable<T> {
    fn set_heap_index(&mut self, key: usize, index: Option<usize>) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.heap_index = index;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_descriptors() {
        let mut table: DescriptorTable<u32> = DescriptorTable::new(8, 100);
        assert!(matches!(
            table.set(-1, Interest::READABLE, Deadline::never(), 0),
            Err(ReactorError::InvalidDescriptor(-1))
        ));
        assert!(matches!(
            table.set(100, Interest::READABLE, Deadline::never(), 0),
            Err(ReactorError::DescriptorOutOfRange { fd: 100, max: 100 })
        ));
        assert_eq!(table.capacity(), 0);
    }

    #[test]
    fn test_geometric_growth() {
        let mut table: DescriptorTable<()> = DescriptorTable::new(4, 1 << 20);
        table.reserve(0).unwrap();
        assert_eq!(table.capacity(), 4);
        table.reserve(4).unwrap();
        assert_eq!(table.capacity(), 8);
        table.reserve(100).unwrap();
        assert_eq!(table.capacity(), 101);
        table.reserve(3).unwrap();
        assert_eq!(table.capacity(), 101);
    }

    #[test]
    fn test_growth_respects_cap() {
        let mut table: DescriptorTable<()> = DescriptorTable::new(64, 10);
        table.reserve(9).unwrap();
        assert_eq!(table.capacity(), 10);
    }

    #[test]
    fn test_set_replaces_wholesale() {
        let mut table = DescriptorTable::new(8, 1024);
        assert_eq!(table.set(5, Interest::READABLE, Deadline::never(), "a").unwrap(), None);
        assert_eq!(table.set(5, Interest::WRITABLE, Deadline::never(), "b").unwrap(), Some("a"));
        assert_eq!(table.active_count(), 1);
        assert_eq!(table.lookup_tag(5), Some(&"b"));
        assert_eq!(table.slot(5).unwrap().interest(), Interest::WRITABLE);
    }

    #[test]
    fn test_empty_interest_clears() {
        let mut table = DescriptorTable::new(8, 1024);
        table.set(3, Interest::READABLE, Deadline::never(), 1).unwrap();
        table.set(7, Interest::READABLE, Deadline::never(), 2).unwrap();
        assert_eq!(table.active_descriptors(), vec![3, 7]);

        assert_eq!(table.set(3, Interest::EMPTY, Deadline::never(), 9).unwrap(), Some(1));
        assert!(!table.is_active(3));
        assert_eq!(table.active_count(), 1);
        assert_eq!(table.clear(7), Some(2));
        assert_eq!(table.clear(7), None);
        assert_eq!(table.active_count(), 0);
        assert!(table.active_descriptors().is_empty());
    }

    #[test]
    fn test_heap_index_back_reference() {
        let mut table: DescriptorTable<()> = DescriptorTable::new(8, 1024);
        table.reserve(2).unwrap();
        table.set_heap_index(2, Some(5));
        assert_eq!(table.slot(2).unwrap().heap_index(), Some(5));
        table.set_heap_index(2, None);
        assert_eq!(table.slot(2).unwrap().heap_index(), None);
        *table.aux_mut(2).unwrap() = Some(1);
        assert_eq!(table.slot(2).unwrap().aux(), Some(1));
    }
}
