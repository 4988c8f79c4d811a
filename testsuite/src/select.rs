// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use llbsp::Millis;
use llbsp_select::{
    AsyncSelect, DuplicatePolicy, NetError, NotifierKind, Operation, Outcome, SelectConfig,
    SelectError,
};

use crate::{pipe_at, pipe_exactly_at, poke};

fn start(config: SelectConfig) -> AsyncSelect {
    AsyncSelect::start(config).expect("cannot start select task")
}

fn socketpair() -> (OwnedFd, OwnedFd) {
    let mut fds: [RawFd; 2] = [-1; 2];
    // Safety: fds has room for two descriptors.
    let r = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0, fds.as_mut_ptr()) };
    assert_eq!(r, 0, "socketpair failed");
    // Safety: socketpair() handed us both descriptors.
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// Reads and discards whatever is waiting on `fd`.
fn drain(fd: RawFd) {
    let mut buf = [0u8; 16];
    // Safety: reading into a live buffer of the stated size.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    assert!(n > 0, "nothing to drain on fd {}", fd);
}

/// Registers `fd` and reports the outcome, plus when it arrived, on the
/// returned channel.
fn watch(
    sel: &AsyncSelect,
    fd: RawFd,
    operation: Operation,
    timeout_ms: u64,
) -> Result<mpsc::Receiver<(Outcome, Instant)>, SelectError> {
    let (tx, rx) = mpsc::channel();
    sel.async_select(fd, operation, timeout_ms, move |outcome| {
        let _ = tx.send((outcome, Instant::now()));
    })?;
    Ok(rx)
}

pub fn test_read_timeout_window() {
    let (read, _write) = pipe_exactly_at(5);
    let sel = start(SelectConfig::default());

    let start = Instant::now();
    let rx = watch(&sel, read.as_raw_fd(), Operation::Read, 100).unwrap();
    let (outcome, at) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(outcome, Outcome::Timeout);

    let waited = at - start;
    assert!(waited >= Duration::from_millis(100), "timed out early: {:?}", waited);
    assert!(waited < Duration::from_millis(110), "timed out late: {:?}", waited);
    assert_eq!(sel.pending(), 0);
}

pub fn test_write_cancelled_by_close() {
    // A pipe read end never becomes writable.
    let (read, _write) = pipe_exactly_at(7);
    let sel = start(SelectConfig::default());
    let fd = read.as_raw_fd();

    let rx = watch(&sel, fd, Operation::Write, 0).unwrap();
    std::thread::sleep(crate::A_BIT);
    assert!(rx.try_recv().is_err());

    sel.notify_fd_closed(fd);
    let (outcome, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(sel.pending(), 0);
}

pub fn test_duplicate_rejected() {
    let sel = start(SelectConfig::default());
    let (read, _write) = pipe_at(5);
    let fd = read.as_raw_fd();

    let first = watch(&sel, fd, Operation::Read, 0).unwrap();
    let second = watch(&sel, fd, Operation::Read, 0);
    assert!(matches!(second, Err(SelectError::Duplicate { operation: Operation::Read, .. })));
    // The other direction is a separate request.
    let write = watch(&sel, fd, Operation::Write, 0).unwrap();
    assert_eq!(sel.pending(), 2);

    sel.notify_fd_closed(fd);
    assert_eq!(first.recv_timeout(Duration::from_secs(2)).unwrap().0, Outcome::Cancelled);
    assert_eq!(write.recv_timeout(Duration::from_secs(2)).unwrap().0, Outcome::Cancelled);
}

pub fn test_duplicate_replaced() {
    let sel = start(SelectConfig {
        duplicate_policy: DuplicatePolicy::Replace,
        ..SelectConfig::default()
    });
    let (read, write) = pipe_at(5);
    let fd = read.as_raw_fd();

    let old = watch(&sel, fd, Operation::Read, 0).unwrap();
    let new = watch(&sel, fd, Operation::Read, 0).unwrap();
    assert_eq!(old.recv_timeout(Duration::from_secs(2)).unwrap().0, Outcome::Cancelled);
    assert_eq!(sel.pending(), 1);

    poke(write.as_raw_fd());
    assert_eq!(new.recv_timeout(Duration::from_secs(2)).unwrap().0, Outcome::Ready);
}

pub fn test_ready_socketpair() {
    for notifier in [NotifierKind::Pipe, NotifierKind::Polling] {
        let sel = start(SelectConfig {
            notifier,
            polling_interval: Millis(10),
            ..SelectConfig::default()
        });
        let (a, b) = socketpair();

        // An idle connected socket is writable straight away.
        let w = watch(&sel, a.as_raw_fd(), Operation::Write, 1_000).unwrap();
        assert_eq!(w.recv_timeout(Duration::from_secs(2)).unwrap().0, Outcome::Ready);

        let r = watch(&sel, a.as_raw_fd(), Operation::Read, 1_000).unwrap();
        std::thread::sleep(crate::A_BIT);
        assert!(r.try_recv().is_err(), "{:?}: read ready with nothing sent", notifier);
        poke(b.as_raw_fd());
        assert_eq!(r.recv_timeout(Duration::from_secs(2)).unwrap().0, Outcome::Ready);
    }
}

pub fn test_many_waiters_join() {
    let sel = start(SelectConfig::default());
    let pipes: Vec<_> = (0..4).map(|i| pipe_at(20 + i)).collect();
    let waits: Vec<_> = pipes
        .iter()
        .map(|(read, _)| sel.select(read.as_raw_fd(), Operation::Read, 2_000).unwrap())
        .collect();
    assert_eq!(sel.pending(), 4);

    for (_, write) in &pipes {
        poke(write.as_raw_fd());
    }
    let outcomes = futures::executor::block_on(join_all(waits));
    assert!(outcomes.iter().all(|o| *o == Some(Outcome::Ready)), "{:?}", outcomes);
}

pub fn test_capacity_limit() {
    let sel = start(SelectConfig {
        max_requests: 2,
        ..SelectConfig::default()
    });
    let pipes: Vec<_> = (0..3).map(|i| pipe_at(30 + i)).collect();
    let fds: Vec<_> = pipes.iter().map(|(read, _)| read.as_raw_fd()).collect();

    let _a = watch(&sel, fds[0], Operation::Read, 0).unwrap();
    let _b = watch(&sel, fds[1], Operation::Read, 0).unwrap();
    assert!(matches!(
        watch(&sel, fds[2], Operation::Read, 0),
        Err(SelectError::CapacityExceeded { capacity: 2 })
    ));
    let e = sel.async_operation(fds[2], Operation::Read, false, |_| ()).unwrap_err();
    assert_eq!(e, NetError::QueueLimitReached);

    sel.notify_fd_closed(fds[0]);
    std::thread::sleep(crate::A_BIT);
    assert!(watch(&sel, fds[2], Operation::Read, 0).is_ok());
}

pub fn test_bad_descriptor_reported() {
    let sel = start(SelectConfig::default());
    let (read, _write) = pipe_at(40);
    let fd = read.into_raw_fd();
    // Safety: we own fd and never use it again.
    assert_eq!(unsafe { libc::close(fd) }, 0);

    let rx = watch(&sel, fd, Operation::Read, 0).unwrap();
    let (outcome, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(outcome, Outcome::Error(libc::EBADF));

    assert!(matches!(
        watch(&sel, -1, Operation::Read, 0),
        Err(SelectError::InvalidFd { fd: -1 })
    ));
}

pub fn test_retry_after_stolen_event() {
    let sel = start(SelectConfig::default());
    let (read, write) = pipe_at(5);
    let fd = read.as_raw_fd();
    sel.set_socket_timeout(fd, Millis(200));

    let start = Instant::now();
    let (tx, rx) = mpsc::channel();
    let first = tx.clone();
    sel.async_operation(fd, Operation::Read, false, move |o| {
        let _ = first.send((o, Instant::now()));
    })
    .unwrap();
    poke(write.as_raw_fd());
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().0, Outcome::Ready);

    // Somebody else consumed the data; go back to waiting on what's left.
    drain(fd);
    sel.async_operation(fd, Operation::Read, true, move |o| {
        let _ = tx.send((o, Instant::now()));
    })
    .unwrap();
    let (outcome, at) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(outcome, Outcome::Timeout);
    let waited = at - start;
    assert!(waited >= Duration::from_millis(200), "retry ended early: {:?}", waited);
    assert!(waited < Duration::from_millis(300), "retry restarted the clock: {:?}", waited);

    let e = sel.async_operation(fd, Operation::Read, true, |_| ()).unwrap_err();
    assert_eq!(e, NetError::TimedOut);
    assert!(sel.remove_socket(fd));
}
