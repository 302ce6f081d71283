//! # Sharded Multi-Worker Reactor
//!
//! For hosts that cap how many objects one wait call may observe. The
//! descriptors are spread over a pool of worker threads, each owning a
//! [`Reactor`] that holds at most `objects_per_wait - 1` registrations (one
//! slot is its wake channel). Workers forward their events to a shared
//! channel that any number of threads may `wait` on.
//!
//! ## Design
//!
//! ```text
//!   set / unset / cancel_all            wait
//!            │                            ▲
//!            ▼                            │
//!  ┌───────────────────┐        ┌──────────────────┐
//!  │ DispatchState     │        │ crossbeam channel│
//!  │ (one Mutex)       │        └────────▲─────────┘
//!  │  tracked fds      │                 │ Ready / Expired
//!  │  worker commands  │        ┌────────┴─────────┐
//!  └─────────┬─────────┘        │                  │
//!            │ commands + wake  │                  │
//!      ┌─────┴─────┬────────────┴┐                 │
//!      ▼           ▼             ▼                 │
//!  ┌────────┐  ┌────────┐    ┌────────┐            │
//!  │worker 0│  │worker 1│ .. │worker n│ ───────────┘
//!  │Reactor │  │Reactor │    │Reactor │
//!  └────────┘  └────────┘    └────────┘
//! ```
//!
//! Every registration carries a generation number as its worker-side tag. A
//! worker forwards an event only if the descriptor is still tracked with that
//! generation, removing it under the lock first; an invalidated registration
//! whose event was already in flight is dropped. Each registration is thus
//! delivered or cancelled exactly once.
//!
//! A descriptor closed while registered is delivered as `Ready` like on a
//! single reactor, and the worker keeps running. If a worker does fail, every
//! registration it held is delivered as `Ready` in descriptor order before
//! the `WorkerFailed` error, so none of them is lost.
//!
//! Workers are spawned on demand and retire after `worker_idle_timeout`
//! without registrations.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::config::{ReactorConfig, ShardConfig};
use crate::deadline::Deadline;
use crate::error::{ReactorError, Result};
use crate::event::{Event, Interest};
use crate::log::{LogBuilder, LogLevel};
use crate::reactor::{Multiplexer, Reactor};
use crate::selector::error_readiness;
use crate::waker::WakeHandle;

type Message<T> = Result<Event<T>>;

/// Work queued for a worker's reactor.
#[derive(Debug, Clone, Copy)]
enum Command {
    Set {
        fd: RawFd,
        interest: Interest,
        deadline: Deadline,
        generation: u64,
    },
    Unset {
        fd: RawFd,
    },
}

struct Tracked<T> {
    worker: usize,
    generation: u64,
    interest: Interest,
    tag: T,
}

struct WorkerSlot {
    /// Registrations assigned, queued ones included.
    load: usize,
    commands: Vec<Command>,
    waker: WakeHandle,
    thread: Option<JoinHandle<()>>,
}

struct DispatchState<T> {
    tracked: HashMap<RawFd, Tracked<T>>,
    workers: BTreeMap<usize, WorkerSlot>,
    next_worker: usize,
    next_generation: u64,
    events_tx: Option<Sender<Message<T>>>,
    /// Handles of workers that retired on their own.
    retired: Vec<JoinHandle<()>>,
}

impl<T> DispatchState<T> {
    /// Drop the registration of `fd`, telling its worker to forget it.
    fn invalidate(&mut self, fd: RawFd) -> Option<Tracked<T>> {
        let tracked = self.tracked.remove(&fd)?;
        if let Some(slot) = self.workers.get_mut(&tracked.worker) {
            slot.load = slot.load.saturating_sub(1);
            slot.commands.push(Command::Unset { fd });
            wake_worker(tracked.worker, &slot.waker);
        }
        Some(tracked)
    }

    /// Lowest-id worker with spare capacity, preferring `preferred`.
    fn pick(&self, preferred: Option<usize>, capacity: usize) -> Option<usize> {
        preferred
            .filter(|id| self.workers.get(id).map_or(false, |w| w.load < capacity))
            .or_else(|| {
                self.workers
                    .iter()
                    .find(|(_, w)| w.load < capacity)
                    .map(|(id, _)| *id)
            })
    }
}

fn wake_worker(id: usize, waker: &WakeHandle) {
    if let Err(e) = waker.wake_up(0) {
        LogBuilder::new(LogLevel::Warn)
            .target("fdmux::sharded")
            .message("failed to wake worker")
            .field_int("worker", id as i64)
            .field_str("error", e.to_string())
            .emit();
    }
}

struct Shared<T> {
    config: ShardConfig,
    state: Mutex<DispatchState<T>>,
}

/// Thread-safe multiplexer spreading descriptors over worker threads.
///
/// Every method takes `&self`; the reactor may be shared through an `Arc` and
/// waited on from several threads at once. Dropping it shuts the workers
/// down.
pub struct ShardedReactor<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    events_rx: Receiver<Message<T>>,
}

impl<T: Send + 'static> ShardedReactor<T> {
    /// Create a sharded reactor with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(ShardConfig::default())
    }

    /// Create a sharded reactor with `config`. No worker is started until the
    /// first registration.
    pub fn with_config(config: ShardConfig) -> Result<Self> {
        config.validate()?;
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(DispatchState {
                    tracked: HashMap::new(),
                    workers: BTreeMap::new(),
                    next_worker: 0,
                    next_generation: 0,
                    events_tx: Some(events_tx),
                    retired: Vec::new(),
                }),
            }),
            events_rx,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &ShardConfig {
        &self.shared.config
    }

    /// Number of running workers.
    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().workers.len()
    }

    /// Number of live registrations.
    pub fn active_count(&self) -> usize {
        self.shared.state.lock().tracked.len()
    }

    fn check(&self, fd: RawFd) -> Result<()> {
        if fd < 0 {
            return Err(ReactorError::InvalidDescriptor(fd));
        }
        let max = self.shared.config.reactor.max_descriptor;
        if fd as usize >= max {
            return Err(ReactorError::DescriptorOutOfRange { fd, max });
        }
        Ok(())
    }

    /// Register `fd` for `interest` until `deadline`.
    ///
    /// An existing registration for `fd` is invalidated first; its event, if
    /// already in flight, is never delivered.
    pub fn set(&self, fd: RawFd, interest: Interest, deadline: Deadline, tag: T) -> Result<()> {
        self.check(fd)?;
        if interest.is_empty() {
            return self.unset(fd);
        }

        let capacity = self.shared.config.worker_capacity();
        let mut state = self.shared.state.lock();
        if state.events_tx.is_none() {
            return Err(ReactorError::Shutdown);
        }

        let previous = state.invalidate(fd).map(|t| t.worker);
        let worker = match state.pick(previous, capacity) {
            Some(id) => id,
            None => self.spawn_worker(&mut state)?,
        };

        let generation = state.next_generation;
        state.next_generation += 1;
        state.tracked.insert(
            fd,
            Tracked {
                worker,
                generation,
                interest,
                tag,
            },
        );
        if let Some(slot) = state.workers.get_mut(&worker) {
            slot.load += 1;
            slot.commands.push(Command::Set {
                fd,
                interest,
                deadline,
                generation,
            });
            wake_worker(worker, &slot.waker);
        }
        Ok(())
    }

    /// Drop the registration of `fd`, if any.
    pub fn unset(&self, fd: RawFd) -> Result<()> {
        self.check(fd)?;
        let mut state = self.shared.state.lock();
        if state.events_tx.is_none() {
            return Err(ReactorError::Shutdown);
        }
        state.invalidate(fd);
        Ok(())
    }

    /// Wait for the next event from any worker, or until `deadline`.
    pub fn wait(&self, deadline: Deadline) -> Result<Event<T>> {
        let received = match deadline.instant() {
            None => self.events_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(at) => self.events_rx.recv_deadline(at),
        };
        match received {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => Ok(Event::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(ReactorError::Shutdown),
        }
    }

    /// Make one `wait` return `WokenUp`. Every call is delivered.
    pub fn wake_up(&self, reason: u32) -> Result<()> {
        let state = self.shared.state.lock();
        match &state.events_tx {
            Some(tx) => {
                let _ = tx.send(Ok(Event::WokenUp { reason }));
                Ok(())
            }
            None => Err(ReactorError::Shutdown),
        }
    }

    /// Invalidate every registration, handing each tag to `callback` exactly
    /// once in ascending descriptor order. The callback runs without the
    /// dispatcher lock held.
    pub fn cancel_all<F: FnMut(RawFd, T)>(&self, mut callback: F) -> usize {
        let cancelled: Vec<(RawFd, T)> = {
            let mut state = self.shared.state.lock();
            let mut fds: Vec<RawFd> = state.tracked.keys().copied().collect();
            fds.sort_unstable();
            fds.into_iter()
                .filter_map(|fd| state.invalidate(fd).map(|t| (fd, t.tag)))
                .collect()
        };

        let count = cancelled.len();
        for (fd, tag) in cancelled {
            callback(fd, tag);
        }
        LogBuilder::new(LogLevel::Debug)
            .target("fdmux::sharded")
            .message("cancelled all registrations")
            .field_int("count", count as i64)
            .emit();
        count
    }

    /// Drop every registration and stop every worker, waiting for them to
    /// exit. Later `set`/`unset`/`wake_up` calls fail with `Shutdown`, and
    /// `wait` does too once queued events are consumed.
    pub fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.shared.state.lock();
            state.events_tx = None;
            state.tracked.clear();
            let workers = std::mem::take(&mut state.workers);
            let mut handles: Vec<_> = workers
                .into_iter()
                .filter_map(|(id, mut slot)| {
                    wake_worker(id, &slot.waker);
                    slot.thread.take()
                })
                .collect();
            handles.append(&mut state.retired);
            handles
        };
        let current = thread::current().id();
        for handle in handles {
            // A tag owning the last handle can drop it on a worker thread.
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }

    fn spawn_worker(&self, state: &mut DispatchState<T>) -> Result<usize> {
        let config = &self.shared.config;
        if state.workers.len() >= config.max_workers {
            return Err(ReactorError::CapacityExceeded {
                limit: config.max_workers * config.worker_capacity(),
            });
        }
        let events_tx = state.events_tx.clone().ok_or(ReactorError::Shutdown)?;

        let reactor: Reactor<u64> = Reactor::with_config(ReactorConfig {
            max_active: Some(config.worker_capacity()),
            ..config.reactor.clone()
        })?;
        let id = state.next_worker;
        state.next_worker += 1;
        state.retired.retain(|h| !h.is_finished());

        let worker = Worker {
            id,
            shared: Arc::clone(&self.shared),
            events_tx,
        };
        let waker = reactor.wake_handle();
        let thread = thread::Builder::new()
            .name(format!("fdmux-worker-{}", id))
            .spawn(move || worker.run(reactor))
            .map_err(ReactorError::Io)?;

        state.workers.insert(
            id,
            WorkerSlot {
                load: 0,
                commands: Vec::new(),
                waker,
                thread: Some(thread),
            },
        );
        LogBuilder::new(LogLevel::Debug)
            .target("fdmux::sharded")
            .message("worker spawned")
            .field_int("worker", id as i64)
            .field_int("workers", state.workers.len() as i64)
            .emit();
        Ok(id)
    }
}

impl<T: Send + 'static> Drop for ShardedReactor<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Send + 'static> Multiplexer<T> for ShardedReactor<T> {
    fn set(&mut self, fd: RawFd, interest: Interest, deadline: Deadline, tag: T) -> Result<()> {
        ShardedReactor::set(self, fd, interest, deadline, tag)
    }

    fn unset(&mut self, fd: RawFd) -> Result<()> {
        ShardedReactor::unset(self, fd)
    }

    fn wait(&mut self, deadline: Deadline) -> Result<Event<T>> {
        ShardedReactor::wait(self, deadline)
    }

    fn wake_up(&mut self, reason: u32) -> Result<()> {
        ShardedReactor::wake_up(self, reason)
    }

    fn cancel_all<F: FnMut(RawFd, T)>(&mut self, callback: F) -> usize {
        ShardedReactor::cancel_all(self, callback)
    }
}

impl<T: Send + 'static> std::fmt::Debug for ShardedReactor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ShardedReactor")
            .field("workers", &state.workers.len())
            .field("active", &state.tracked.len())
            .finish()
    }
}

/// One worker thread.
struct Worker<T> {
    id: usize,
    shared: Arc<Shared<T>>,
    events_tx: Sender<Message<T>>,
}

enum Step {
    Continue,
    Exit,
}

impl<T: Send + 'static> Worker<T> {
    fn run(self, mut reactor: Reactor<u64>) {
        loop {
            let commands = {
                let mut state = self.shared.state.lock();
                match state.workers.get_mut(&self.id) {
                    Some(slot) => std::mem::take(&mut slot.commands),
                    None => return,
                }
            };
            for command in commands {
                let applied = match command {
                    Command::Set {
                        fd,
                        interest,
                        deadline,
                        generation,
                    } => match reactor.set(fd, interest, deadline, generation) {
                        // The descriptor was closed, or its number now belongs
                        // to this worker's wake channel. Report it ready so the
                        // caller's own I/O surfaces the error.
                        Err(ReactorError::Io(_)) | Err(ReactorError::InvalidDescriptor(_)) => {
                            let ready = error_readiness(interest);
                            if let Step::Exit = self.forward(fd, generation, |tag| Event::Ready { fd, ready, tag }) {
                                return;
                            }
                            Ok(())
                        }
                        other => other,
                    },
                    Command::Unset { fd } => reactor.unset(fd),
                };
                if let Err(e) = applied {
                    return self.fail(e);
                }
            }

            let idle = Deadline::after(self.shared.config.worker_idle_timeout);
            let step = match reactor.wait(idle) {
                Ok(Event::Ready { fd, ready, tag }) => self.forward(fd, tag, |tag| Event::Ready { fd, ready, tag }),
                Ok(Event::Expired { fd, tag }) => self.forward(fd, tag, |tag| Event::Expired { fd, tag }),
                Ok(Event::WokenUp { .. }) => Step::Continue,
                Ok(Event::TimedOut) => self.try_retire(),
                Err(e) => return self.fail(e),
            };
            if let Step::Exit = step {
                return;
            }
        }
    }

    /// Hand an event to the waiters if its registration is still current.
    ///
    /// The event is queued before the lock is released, so a registration
    /// that no longer counts as active is already visible to `wait`.
    fn forward(&self, fd: RawFd, generation: u64, build: impl FnOnce(T) -> Event<T>) -> Step {
        let mut state = self.shared.state.lock();
        let current = state
            .tracked
            .get(&fd)
            .map_or(false, |t| t.worker == self.id && t.generation == generation);
        if !current {
            return if state.workers.contains_key(&self.id) {
                Step::Continue
            } else {
                Step::Exit
            };
        }
        if let Some(slot) = state.workers.get_mut(&self.id) {
            slot.load = slot.load.saturating_sub(1);
        }
        if let Some(tracked) = state.tracked.remove(&fd) {
            let _ = self.events_tx.send(Ok(build(tracked.tag)));
        }
        Step::Continue
    }

    fn try_retire(&self) -> Step {
        let mut state = self.shared.state.lock();
        let idle = match state.workers.get(&self.id) {
            Some(slot) => slot.load == 0 && slot.commands.is_empty(),
            None => return Step::Exit,
        };
        if !idle {
            return Step::Continue;
        }
        if let Some(handle) = state.workers.remove(&self.id).and_then(|mut slot| slot.thread.take()) {
            state.retired.push(handle);
        }
        LogBuilder::new(LogLevel::Debug)
            .target("fdmux::sharded")
            .message("worker retired")
            .field_int("worker", self.id as i64)
            .field_int("workers", state.workers.len() as i64)
            .emit();
        Step::Exit
    }

    fn fail(&self, err: ReactorError) {
        let source = match err {
            ReactorError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        };
        LogBuilder::new(LogLevel::Error)
            .target("fdmux::sharded")
            .message("worker failed")
            .field_int("worker", self.id as i64)
            .field_str("error", source.to_string())
            .emit();

        let mut state = self.shared.state.lock();
        let Some(mut slot) = state.workers.remove(&self.id) else {
            return;
        };
        if let Some(handle) = slot.thread.take() {
            state.retired.push(handle);
        }

        // Hand back every registration this worker held, in descriptor order,
        // so the caller's own I/O decides what to do with it.
        let mut evicted: Vec<RawFd> = state
            .tracked
            .iter()
            .filter(|(_, t)| t.worker == self.id)
            .map(|(fd, _)| *fd)
            .collect();
        evicted.sort_unstable();
        for fd in evicted {
            if let Some(tracked) = state.tracked.remove(&fd) {
                let _ = self.events_tx.send(Ok(Event::Ready {
                    fd,
                    ready: error_readiness(tracked.interest),
                    tag: tracked.tag,
                }));
            }
        }
        if state.events_tx.is_some() {
            let _ = self.events_tx.send(Err(ReactorError::WorkerFailed {
                worker: self.id,
                source,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn small(objects_per_wait: usize) -> ShardConfig {
        ShardConfig::builder()
            .objects_per_wait(objects_per_wait)
            .worker_idle_timeout(Duration::from_millis(50))
            .build()
            .unwrap()
    }

    #[test]
    fn test_spreads_over_workers() {
        let reactor = ShardedReactor::with_config(small(3)).unwrap();
        let pairs: Vec<_> = (0..5).map(|_| UnixStream::pair().unwrap()).collect();
        for (i, (a, _)) in pairs.iter().enumerate() {
            reactor.set(a.as_raw_fd(), Interest::READABLE, Deadline::never(), i).unwrap();
        }
        assert_eq!(reactor.worker_count(), 3);
        assert_eq!(reactor.active_count(), 5);

        (&pairs[4].1).write_all(b"x").unwrap();
        let event = reactor.wait(Deadline::after(Duration::from_secs(5))).unwrap();
        assert_eq!(
            event,
            Event::Ready { fd: pairs[4].0.as_raw_fd(), ready: Interest::READABLE, tag: 4 }
        );
        assert_eq!(reactor.active_count(), 4);
    }

    #[test]
    fn test_worker_cap() {
        let config = ShardConfig::builder().objects_per_wait(2).max_workers(1).build().unwrap();
        let reactor = ShardedReactor::with_config(config).unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        reactor.set(a.as_raw_fd(), Interest::READABLE, Deadline::never(), ()).unwrap();
        assert!(matches!(
            reactor.set(b.as_raw_fd(), Interest::READABLE, Deadline::never(), ()),
            Err(ReactorError::CapacityExceeded { limit: 1 })
        ));
        // Replacing an existing registration reuses its slot.
        reactor.set(a.as_raw_fd(), Interest::WRITABLE, Deadline::never(), ()).unwrap();
    }

    #[test]
    fn test_replaced_registration_not_delivered() {
        let reactor = ShardedReactor::with_config(small(63)).unwrap();
        let (a, mut peer) = UnixStream::pair().unwrap();
        reactor.set(a.as_raw_fd(), Interest::READABLE, Deadline::never(), "old").unwrap();
        reactor
            .set(a.as_raw_fd(), Interest::READABLE, Deadline::after(Duration::from_secs(5)), "new")
            .unwrap();
        assert_eq!(reactor.active_count(), 1);
        peer.write_all(b"x").unwrap();

        match reactor.wait(Deadline::after(Duration::from_secs(5))).unwrap() {
            Event::Ready { tag, .. } => assert_eq!(tag, "new"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            reactor.wait(Deadline::after(Duration::from_millis(50))).unwrap(),
            Event::TimedOut
        );
    }

    #[test]
    fn test_wakes_are_counted() {
        let reactor: ShardedReactor<()> = ShardedReactor::new().unwrap();
        reactor.wake_up(1).unwrap();
        reactor.wake_up(2).unwrap();
        assert_eq!(reactor.wait(Deadline::never()).unwrap(), Event::WokenUp { reason: 1 });
        assert_eq!(reactor.wait(Deadline::never()).unwrap(), Event::WokenUp { reason: 2 });
    }

    #[test]
    fn test_idle_workers_retire() {
        let reactor = ShardedReactor::with_config(small(63)).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        reactor.set(a.as_raw_fd(), Interest::READABLE, Deadline::never(), ()).unwrap();
        assert_eq!(reactor.worker_count(), 1);
        reactor.unset(a.as_raw_fd()).unwrap();

        let start = std::time::Instant::now();
        while reactor.worker_count() > 0 && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(reactor.worker_count(), 0);
    }

    #[test]
    fn test_failed_worker_hands_back_registrations() {
        let reactor = ShardedReactor::with_config(small(63)).unwrap();
        let pairs: Vec<_> = (0..3).map(|_| UnixStream::pair().unwrap()).collect();
        reactor
            .set(pairs[0].0.as_raw_fd(), Interest::READABLE | Interest::EXCEPTIONAL, Deadline::never(), 0)
            .unwrap();
        reactor.set(pairs[1].0.as_raw_fd(), Interest::READABLE, Deadline::never(), 1).unwrap();
        reactor.set(pairs[2].0.as_raw_fd(), Interest::EXCEPTIONAL, Deadline::never(), 2).unwrap();

        let worker = Worker {
            id: 0,
            shared: Arc::clone(&reactor.shared),
            events_tx: reactor.shared.state.lock().events_tx.clone().unwrap(),
        };
        worker.fail(ReactorError::Io(io::Error::from_raw_os_error(nix::libc::EIO)));
        assert_eq!(reactor.active_count(), 0);
        assert_eq!(reactor.worker_count(), 0);

        let mut fds: Vec<RawFd> = pairs.iter().map(|(a, _)| a.as_raw_fd()).collect();
        fds.sort_unstable();
        for fd in fds {
            match reactor.wait(Deadline::after(Duration::from_secs(1))).unwrap() {
                Event::Ready { fd: got, ready, tag } => {
                    assert_eq!(got, fd);
                    let expected = [Interest::READABLE, Interest::READABLE, Interest::EXCEPTIONAL][tag];
                    assert_eq!(ready, expected);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(matches!(
            reactor.wait(Deadline::after(Duration::from_secs(1))),
            Err(ReactorError::WorkerFailed { worker: 0, .. })
        ));
    }

    #[test]
    fn test_shutdown() {
        let reactor = ShardedReactor::with_config(small(63)).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        reactor.set(a.as_raw_fd(), Interest::READABLE, Deadline::never(), 1).unwrap();
        reactor.shutdown();
        assert_eq!(reactor.worker_count(), 0);
        assert!(matches!(
            reactor.set(a.as_raw_fd(), Interest::READABLE, Deadline::never(), 2),
            Err(ReactorError::Shutdown)
        ));
        assert!(matches!(reactor.wait(Deadline::never()), Err(ReactorError::Shutdown)));
    }
}
