//! Property-based tests for the timeout heap, the descriptor table and
//! deadlines.
//!
//! Uses proptest to generate random operation sequences and checks the
//! bookkeeping against a plain model after every step.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use fdmux::heap::TimeoutHeap;
use fdmux::table::DescriptorTable;
use fdmux::{Deadline, Interest};
use proptest::prelude::*;

const MAX_FD: RawFd = 48;

#[derive(Debug, Clone)]
enum Op {
    /// Register with a deadline `ms` after the base instant.
    Arm(RawFd, u64),
    /// Register without a deadline.
    ArmForever(RawFd),
    Clear(RawFd),
    Pop,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..MAX_FD, 0u64..50).prop_map(|(fd, ms)| Op::Arm(fd, ms)),
        1 => (0..MAX_FD).prop_map(Op::ArmForever),
        2 => (0..MAX_FD).prop_map(Op::Clear),
        2 => Just(Op::Pop),
    ]
}

fn interest() -> impl Strategy<Value = Interest> {
    (0u8..8).prop_map(Interest::from_bits_truncate)
}

/// Drop the timer of `fd`, as the reactor does before rearming or clearing.
fn cancel(heap: &mut TimeoutHeap, table: &mut DescriptorTable<u32>, fd: RawFd) {
    if let Some(pos) = table.slot(fd).and_then(|slot| slot.heap_index()) {
        heap.remove_at(pos, table);
    }
}

/// Every timed registration is in the heap exactly once, at the position
/// its slot records.
fn consistent(heap: &TimeoutHeap, table: &DescriptorTable<u32>, model: &HashMap<RawFd, Instant>) -> bool {
    if heap.len() != model.len() {
        return false;
    }
    (0..MAX_FD).all(|fd| {
        let index = table.slot(fd).and_then(|slot| slot.heap_index());
        match (model.contains_key(&fd), index) {
            (true, Some(pos)) => heap.key_at(pos) == Some(fd as usize),
            (false, None) => true,
            _ => false,
        }
    })
}

proptest! {
    /// Random arm/clear/pop sequences keep heap positions and slots in step,
    /// and pops come out in deadline order.
    #[test]
    fn heap_tracks_table(ops in prop::collection::vec(op(), 1..200)) {
        let base = Instant::now();
        let mut heap = TimeoutHeap::new();
        let mut table: DescriptorTable<u32> = DescriptorTable::new(4, MAX_FD as usize);
        let mut model: HashMap<RawFd, Instant> = HashMap::new();

        for op in ops {
            match op {
                Op::Arm(fd, ms) => {
                    let at = base + Duration::from_millis(ms);
                    cancel(&mut heap, &mut table, fd);
                    table.set(fd, Interest::READABLE, Deadline::at(at), 0).unwrap();
                    heap.push(fd as usize, at, &mut table);
                    model.insert(fd, at);
                }
                Op::ArmForever(fd) => {
                    cancel(&mut heap, &mut table, fd);
                    table.set(fd, Interest::WRITABLE, Deadline::never(), 0).unwrap();
                    model.remove(&fd);
                }
                Op::Clear(fd) => {
                    cancel(&mut heap, &mut table, fd);
                    table.clear(fd);
                    model.remove(&fd);
                }
                Op::Pop => {
                    let earliest = model.values().min().copied();
                    match heap.pop(&mut table) {
                        Some((key, at)) => {
                            prop_assert_eq!(Some(at), earliest);
                            prop_assert_eq!(model.remove(&(key as RawFd)), Some(at));
                            table.clear(key as RawFd);
                        }
                        None => prop_assert!(model.is_empty()),
                    }
                }
            }
            prop_assert!(consistent(&heap, &table, &model));
            prop_assert_eq!(heap.peek().map(|(_, at)| at), model.values().min().copied());
        }
    }

    /// Draining the heap yields non-decreasing deadlines and leaves no slot
    /// pointing into it.
    #[test]
    fn heap_drains_in_order(deadlines in prop::collection::vec(0u64..1000, 0..64)) {
        let base = Instant::now();
        let mut heap = TimeoutHeap::new();
        let mut table: DescriptorTable<u32> = DescriptorTable::new(4, 64);
        for (fd, ms) in deadlines.iter().enumerate() {
            let at = base + Duration::from_millis(*ms);
            table.set(fd as RawFd, Interest::READABLE, Deadline::at(at), 0).unwrap();
            heap.push(fd, at, &mut table);
        }

        let mut last = None;
        while let Some((key, at)) = heap.pop(&mut table) {
            prop_assert!(last.map_or(true, |prev| prev <= at));
            prop_assert!(table.slot(key as RawFd).unwrap().heap_index().is_none());
            last = Some(at);
        }
        prop_assert_eq!(heap.len(), 0);
    }

    /// Each descriptor holds at most one registration and the active count
    /// matches the model.
    #[test]
    fn table_single_registration(
        ops in prop::collection::vec((0..MAX_FD, interest(), any::<u32>()), 1..200)
    ) {
        let mut table: DescriptorTable<u32> = DescriptorTable::new(2, MAX_FD as usize);
        let mut model: HashMap<RawFd, (Interest, u32)> = HashMap::new();

        for (fd, interest, tag) in ops {
            let previous = table.set(fd, interest, Deadline::never(), tag).unwrap();
            let expected = if interest.is_empty() {
                model.remove(&fd)
            } else {
                model.insert(fd, (interest, tag))
            };
            prop_assert_eq!(previous, expected.map(|(_, tag)| tag));

            prop_assert_eq!(table.active_count(), model.len());
            prop_assert!(table.capacity() <= MAX_FD as usize);
            if let Some((interest, tag)) = model.get(&fd) {
                let slot = table.slot(fd).unwrap();
                prop_assert_eq!(slot.interest(), *interest);
                prop_assert_eq!(slot.tag(), Some(tag));
            } else {
                prop_assert!(!table.is_active(fd));
            }
        }

        let mut expected: Vec<RawFd> = model.keys().copied().collect();
        expected.sort_unstable();
        prop_assert_eq!(table.active_descriptors(), expected);
    }

    /// `never` sorts after every finite deadline and `min` picks the earlier.
    #[test]
    fn deadline_ordering(a in 0u64..10_000, b in 0u64..10_000) {
        let base = Instant::now();
        let da = Deadline::at(base + Duration::from_millis(a));
        let db = Deadline::at(base + Duration::from_millis(b));

        prop_assert!(da < Deadline::never());
        prop_assert_eq!(da.min(Deadline::never()), da);
        prop_assert_eq!(da.min(db), if a <= b { da } else { db });
        prop_assert_eq!(da.remaining_at(base), Some(Duration::from_millis(a)));
    }

    /// Interest union and difference behave like set operations.
    #[test]
    fn interest_set_algebra(a in interest(), b in interest()) {
        let both = a | b;
        prop_assert!(both.contains(a));
        prop_assert!(both.contains(b));
        prop_assert_eq!(both.difference(b).intersection(b), Interest::EMPTY);
        prop_assert_eq!(a.intersection(b), b.intersection(a));
        prop_assert_eq!(both.is_empty(), a.is_empty() && b.is_empty());
    }
}
