// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BSP scenario test suite.
//!
//! These tests drive several crates together through their public APIs, with
//! real descriptors and real tasks. They run in sequence on a dedicated
//! task, under one overall timeout, so a wake-up that never arrives fails the
//! suite instead of hanging it.

mod osal;
mod pool;
mod select;
mod spi;
mod worker;

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use llbsp::suspend::suspension;
use llbsp::task::{Task, TaskConfig};

/// Long enough for another task to have noticed something.
pub(crate) const A_BIT: Duration = Duration::from_millis(20);

/// Upper bound on the whole suite. Several scenarios wait out real timeouts,
/// so this is wall-clock time with plenty of slack.
const TEST_TIMEOUT: Duration = Duration::from_secs(30);

macro_rules! tests {
    ($($name:path,)*) => {
        $(
            log::info!(concat!(stringify!($name), "..."));
            $name();
            println!(concat!(stringify!($name), "... OK"));
        )*
    };
}

fn all_tests() {
    tests! {
        osal::test_suspension_future,
        osal::test_queue_between_tasks,
        osal::test_mutex_serializes_tasks,
        osal::test_semaphore_signals_task,

        pool::test_reserve_free_round_trip,
        pool::test_no_slot_handed_out_twice,
        pool::test_lookup_by_predicate,

        select::test_read_timeout_window,
        select::test_write_cancelled_by_close,
        select::test_duplicate_rejected,
        select::test_duplicate_replaced,
        select::test_ready_socketpair,
        select::test_many_waiters_join,
        select::test_capacity_limit,
        select::test_bad_descriptor_reported,
        select::test_retry_after_stolen_event,

        spi::test_cycles_return_to_idle,
        spi::test_indices_reset_after_transmit,
        spi::test_write_overwrites_unread_rx,

        worker::test_exec_and_resume,
        worker::test_waiting_list_order,
    }
}

/// Runs every test in order on a separate task. Panics on the first failure,
/// or if the suite takes longer than [`TEST_TIMEOUT`].
pub fn run_test_suite() {
    let (done, mut finished) = suspension::<bool>();
    let runner = Task::spawn(&TaskConfig::new("testsuite", 256 * 1024, 1), move || {
        let ok = std::panic::catch_unwind(all_tests).is_ok();
        // The waiting side only goes away if it already gave up.
        let _ = done.resume(ok);
    })
    .expect("cannot start test task");

    match finished.wait_timeout(TEST_TIMEOUT) {
        Ok(Some(true)) => println!("tests complete."),
        Ok(_) => {
            let _ = runner.join();
            panic!("tests failed.");
        }
        Err(_) => panic!("tests timed out."),
    }
    runner.join().expect("test task panicked");
}

///////////////////////////////////////////////////////////////////////////////
// Utility functions

/// A pipe whose read end sits at descriptor `at`, or at the lowest free
/// descriptor above it if `at` is taken. Nothing is ever written to the pipe
/// unless the caller does, so the read end is neither readable nor (being a
/// read end) writable.
///
/// Returns `(read end, write end)`.
pub(crate) fn pipe_at(at: RawFd) -> (OwnedFd, OwnedFd) {
    let mut fds: [RawFd; 2] = [-1; 2];
    // Safety: fds has room for two descriptors.
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0, "pipe failed");
    // Safety: pipe() handed us both descriptors.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    if fds[0] == at {
        return (read, write);
    }
    // Get the write end out of the way if it took the slot we want.
    let write = if fds[1] == at { move_fd(write, at + 1) } else { write };
    (move_fd(read, at), write)
}

/// Re-homes `fd` at the lowest free descriptor at or above `at`.
fn move_fd(fd: OwnedFd, at: RawFd) -> OwnedFd {
    // Safety: F_DUPFD_CLOEXEC on a live descriptor, result checked below.
    let moved = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, at) };
    assert!(moved >= at, "cannot move fd {} to {} or above", fd.as_raw_fd(), at);
    drop(fd);
    // Safety: fcntl returned a fresh descriptor that we now own.
    unsafe { OwnedFd::from_raw_fd(moved) }
}

/// Like [`pipe_at`], but insists on the read end landing exactly on `at`
/// when `at` is free. If something else in the process already owns `at`,
/// the scenario runs on the next free descriptor and says so.
pub(crate) fn pipe_exactly_at(at: RawFd) -> (OwnedFd, OwnedFd) {
    let was_free = !llbsp_select::sys::fd_is_open(at);
    let (read, write) = pipe_at(at);
    if was_free {
        assert_eq!(read.as_raw_fd(), at, "pipe did not land on free fd {}", at);
    } else {
        log::warn!("fd {} is in use, running on fd {} instead", at, read.as_raw_fd());
    }
    (read, write)
}

/// Writes one byte to `fd`.
pub(crate) fn poke(fd: RawFd) {
    let b = [0x5Au8];
    // Safety: writing one byte from a live buffer.
    let n = unsafe { libc::write(fd, b.as_ptr().cast(), 1) };
    assert_eq!(n, 1, "write to fd {} failed", fd);
}

#[macro_export]
macro_rules! poll_and_assert_ready {
    ($fut:expr) => { $crate::poll_and_assert_ready!($fut, concat!("future not ready: ", stringify!($fut))) };
    ($fut:expr, $msg:expr $(, $args:tt)*) => {
        if let core::task::Poll::Ready(v) = futures::poll!($fut.as_mut()) {
            v
        } else {
            panic!($msg $($args)*);
        }
    }
}

#[macro_export]
macro_rules! poll_and_assert_not_ready {
    ($fut:expr) => { $crate::poll_and_assert_not_ready!($fut, concat!("future unexpectedly ready: ", stringify!($fut))) };
    ($fut:expr, $msg:expr $(, $args:tt)*) => {
        if !futures::poll!($fut.as_mut()).is_pending() {
            panic!($msg $($args)*);
        }
    }
}
