//! Sharded reactor scenarios with enough descriptors to need several workers.

use std::collections::HashSet;
use std::net::UdpSocket;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fdmux::{Deadline, Event, Interest, ReactorError, ShardConfig, ShardedReactor};
use nix::fcntl::{fcntl, FcntlArg};

fn sockets(n: usize) -> Vec<UdpSocket> {
    (0..n).map(|_| UdpSocket::bind("127.0.0.1:0").unwrap()).collect()
}

fn config() -> ShardConfig {
    ShardConfig::builder()
        .objects_per_wait(63)
        .worker_idle_timeout(Duration::from_millis(100))
        .build()
        .unwrap()
}

fn wait_for_workers(reactor: &ShardedReactor<RawFd>, expected: usize) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if reactor.worker_count() == expected {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn two_hundred_sockets_need_four_workers() {
    let reactor = ShardedReactor::with_config(config()).unwrap();
    let socks = sockets(200);
    for sock in &socks {
        let fd = sock.as_raw_fd();
        reactor.set(fd, Interest::READABLE, Deadline::never(), fd).unwrap();
    }
    assert_eq!(reactor.active_count(), 200);
    assert!(reactor.worker_count() >= 4);

    // Every tenth socket gets a datagram.
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let ready: HashSet<RawFd> = socks.iter().step_by(10).map(|s| s.as_raw_fd()).collect();
    for sock in socks.iter().step_by(10) {
        sender.send_to(b"ping", sock.local_addr().unwrap()).unwrap();
    }

    let mut seen = HashSet::new();
    while seen.len() < ready.len() {
        match reactor.wait(Deadline::after(Duration::from_secs(5))).unwrap() {
            Event::Ready { fd, ready: r, tag } => {
                assert_eq!(fd, tag);
                assert!(r.is_readable());
                assert!(seen.insert(fd), "descriptor {} delivered twice", fd);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(seen, ready);
    assert_eq!(reactor.active_count(), 180);

    let mut cancelled = Vec::new();
    let n = reactor.cancel_all(|fd, tag| {
        assert_eq!(fd, tag);
        cancelled.push(fd);
    });
    assert_eq!(n, 180);
    assert!(cancelled.windows(2).all(|w| w[0] < w[1]));
    assert!(cancelled.iter().all(|fd| !ready.contains(fd)));
    assert_eq!(reactor.cancel_all(|_, _| panic!("cancelled twice")), 0);

    // With nothing registered the workers retire.
    assert!(wait_for_workers(&reactor, 0));
}

#[test]
fn deadlines_expire_across_workers() {
    let reactor = ShardedReactor::with_config(config()).unwrap();
    let socks = sockets(100);
    for (i, sock) in socks.iter().enumerate() {
        let fd = sock.as_raw_fd();
        let deadline = Deadline::after(Duration::from_millis(50 + (i as u64 % 5) * 10));
        reactor.set(fd, Interest::READABLE, deadline, fd).unwrap();
    }

    let mut expired = HashSet::new();
    while expired.len() < socks.len() {
        match reactor.wait(Deadline::after(Duration::from_secs(5))).unwrap() {
            Event::Expired { fd, tag } => {
                assert_eq!(fd, tag);
                assert!(expired.insert(fd));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(reactor.active_count(), 0);
}

#[test]
fn concurrent_waiters_share_events() {
    let reactor = Arc::new(ShardedReactor::with_config(config()).unwrap());
    let socks = sockets(150);
    for sock in &socks {
        let fd = sock.as_raw_fd();
        reactor.set(fd, Interest::READABLE, Deadline::never(), fd).unwrap();
    }

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let reactor = Arc::clone(&reactor);
            thread::spawn(move || {
                let mut got = Vec::new();
                loop {
                    match reactor.wait(Deadline::after(Duration::from_millis(500))).unwrap() {
                        Event::Ready { tag, .. } => got.push(tag),
                        Event::WokenUp { .. } => return got,
                        Event::TimedOut => {}
                        other => panic!("unexpected event {:?}", other),
                    }
                }
            })
        })
        .collect();

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    for sock in &socks {
        sender.send_to(b"x", sock.local_addr().unwrap()).unwrap();
    }
    let start = Instant::now();
    while reactor.active_count() > 0 && start.elapsed() < Duration::from_secs(5) {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(reactor.active_count(), 0);

    // Wakes are counted, so each waiter gets its own.
    for reason in 0..4 {
        reactor.wake_up(reason).unwrap();
    }
    let mut all: Vec<RawFd> = waiters.into_iter().flat_map(|w| w.join().unwrap()).collect();
    all.sort_unstable();
    let mut expected: Vec<RawFd> = socks.iter().map(|s| s.as_raw_fd()).collect();
    expected.sort_unstable();
    assert_eq!(all, expected);
}

#[test]
fn worker_cap_limits_registrations() {
    let config = ShardConfig::builder()
        .objects_per_wait(11)
        .max_workers(2)
        .build()
        .unwrap();
    let reactor = ShardedReactor::with_config(config).unwrap();
    let socks = sockets(21);
    for sock in &socks[..20] {
        let fd = sock.as_raw_fd();
        reactor.set(fd, Interest::READABLE, Deadline::never(), fd).unwrap();
    }
    assert_eq!(reactor.worker_count(), 2);
    assert!(matches!(
        reactor.set(socks[20].as_raw_fd(), Interest::READABLE, Deadline::never(), 0),
        Err(ReactorError::CapacityExceeded { limit: 20 })
    ));

    // Freeing one slot makes room again.
    reactor.unset(socks[0].as_raw_fd()).unwrap();
    reactor
        .set(socks[20].as_raw_fd(), Interest::READABLE, Deadline::never(), 0)
        .unwrap();
    assert_eq!(reactor.active_count(), 20);
}

#[test]
fn drop_stops_workers() {
    let reactor = ShardedReactor::with_config(config()).unwrap();
    let socks = sockets(70);
    for sock in &socks {
        let fd = sock.as_raw_fd();
        reactor.set(fd, Interest::READABLE, Deadline::never(), fd).unwrap();
    }
    assert_eq!(reactor.worker_count(), 2);
    drop(reactor);
}

#[test]
fn closed_descriptor_does_not_disturb_its_worker() {
    let reactor = ShardedReactor::with_config(config()).unwrap();
    let keep = UdpSocket::bind("127.0.0.1:0").unwrap();
    let others = sockets(4);
    reactor
        .set(keep.as_raw_fd(), Interest::READABLE, Deadline::never(), keep.as_raw_fd())
        .unwrap();
    for sock in &others {
        let fd = sock.as_raw_fd();
        reactor.set(fd, Interest::READABLE, Deadline::never(), fd).unwrap();
    }

    // A high number keeps parallel tests from reusing it once closed.
    let doomed = UdpSocket::bind("127.0.0.1:0").unwrap();
    let fd = fcntl(doomed.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(600)).unwrap();
    drop(doomed);
    reactor.set(fd, Interest::READABLE, Deadline::never(), 5).unwrap();
    nix::unistd::close(fd).unwrap();

    assert_eq!(
        reactor.wait(Deadline::after(Duration::from_secs(5))).unwrap(),
        Event::Ready { fd, ready: Interest::READABLE, tag: 5 }
    );
    assert_eq!(reactor.active_count(), 5);
    assert_eq!(reactor.worker_count(), 1);

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(b"ping", keep.local_addr().unwrap()).unwrap();
    assert_eq!(
        reactor.wait(Deadline::after(Duration::from_secs(5))).unwrap(),
        Event::Ready { fd: keep.as_raw_fd(), ready: Interest::READABLE, tag: keep.as_raw_fd() }
    );
    assert_eq!(reactor.active_count(), 4);
    assert_eq!(
        reactor.wait(Deadline::after(Duration::from_millis(100))).unwrap(),
        Event::TimedOut
    );
}

#[test]
fn cancel_all_after_two_hundred_registrations() {
    let reactor = ShardedReactor::with_config(config()).unwrap();
    let socks = sockets(200);
    for sock in &socks {
        let fd = sock.as_raw_fd();
        reactor.set(fd, Interest::READABLE, Deadline::never(), fd).unwrap();
    }

    let mut cancelled = Vec::new();
    let n = reactor.cancel_all(|fd, tag| {
        assert_eq!(fd, tag);
        cancelled.push(fd);
    });
    assert_eq!(n, 200);
    assert_eq!(cancelled.len(), 200);
    assert!(cancelled.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(reactor.active_count(), 0);
    assert_eq!(reactor.cancel_all(|_, _| panic!("cancelled twice")), 0);
    assert_eq!(
        reactor.wait(Deadline::after(Duration::from_millis(100))).unwrap(),
        Event::TimedOut
    );
}
