// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thin safe wrappers over the POSIX calls the select layer needs.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::Operation;

/// Highest descriptor number (exclusive) that fits in an `fd_set`.
pub const FD_SETSIZE: usize = libc::FD_SETSIZE as usize;

/// Checks whether `fd` can be put in an [`FdSet`].
pub fn fd_in_range(fd: RawFd) -> bool {
    usize::try_from(fd).map_or(false, |fd| fd < FD_SETSIZE)
}

/// A `select()` descriptor set that remembers its highest member.
#[derive(Copy, Clone)]
pub struct FdSet {
    raw: libc::fd_set,
    max: Option<RawFd>,
}

impl FdSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        let mut raw = MaybeUninit::<libc::fd_set>::uninit();
        // Safety: FD_ZERO initializes every bit of the set.
        let raw = unsafe {
            libc::FD_ZERO(raw.as_mut_ptr());
            raw.assume_init()
        };
        FdSet { raw, max: None }
    }

    /// Adds `fd` to the set. Out-of-range descriptors are ignored; callers
    /// check with [`fd_in_range`] first.
    pub fn insert(&mut self, fd: RawFd) {
        if !fd_in_range(fd) {
            return;
        }
        // Safety: fd is within 0..FD_SETSIZE.
        unsafe { libc::FD_SET(fd, &mut self.raw) };
        self.max = Some(self.max.map_or(fd, |m| m.max(fd)));
    }

    /// Checks whether `fd` is in the set.
    pub fn contains(&self, fd: RawFd) -> bool {
        // Safety: fd is within 0..FD_SETSIZE.
        fd_in_range(fd) && unsafe { libc::FD_ISSET(fd, &self.raw) }
    }

    /// Highest descriptor ever inserted.
    pub fn max(&self) -> Option<RawFd> {
        self.max
    }
}

impl Default for FdSet {
    fn default() -> Self {
        FdSet::new()
    }
}

impl std::fmt::Debug for FdSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let members = (0..=self.max.unwrap_or(-1)).filter(|&fd| self.contains(fd));
        f.debug_set().entries(members).finish()
    }
}

/// Converts a wait into a `timeval`, rounding up to the next microsecond so
/// that `select()` never returns before the wait is over.
fn to_timeval(d: Duration) -> libc::timeval {
    let micros = (d.as_nanos() + 999) / 1000;
    let secs = (micros / 1_000_000).min(i32::MAX as u128);
    libc::timeval {
        tv_sec: secs as libc::time_t,
        tv_usec: (micros % 1_000_000) as libc::suseconds_t,
    }
}

/// Calls `select()` on `read` and `write`, waiting at most `wait` (forever for
/// `None`). On success the sets are narrowed to the ready descriptors and the
/// number of ready descriptors is returned.
pub fn select(
    read: &mut FdSet,
    write: &mut FdSet,
    wait: Option<Duration>,
) -> io::Result<usize> {
    let nfds = read.max.max(write.max).map_or(0, |m| m + 1);
    let mut tv = wait.map(to_timeval);
    let tv_ptr: *mut libc::timeval = match tv.as_mut() {
        Some(tv) => tv,
        None => ptr::null_mut(),
    };
    // Safety: both sets are initialized fd_sets, the except set may be null,
    // and tv_ptr is null or points at a live timeval.
    let n = unsafe { libc::select(nfds, &mut read.raw, &mut write.raw, ptr::null_mut(), tv_ptr) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Checks `fd` for readiness without blocking.
///
/// Returns `Ok(true)` if a `read` (or `write`, per `operation`) would not block.
pub fn non_blocking_select(fd: RawFd, operation: Operation) -> io::Result<bool> {
    if !fd_in_range(fd) {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    let mut watched = FdSet::new();
    watched.insert(fd);
    let mut other = FdSet::new();
    let (read, write) = match operation {
        Operation::Read => (&mut watched, &mut other),
        Operation::Write => (&mut other, &mut watched),
    };
    loop {
        match select(read, write, Some(Duration::ZERO)) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            r => return r.map(|n| n > 0),
        }
    }
}

/// Checks whether `fd` names an open descriptor.
pub fn fd_is_open(fd: RawFd) -> bool {
    // Safety: F_GETFD has no side effects and tolerates any fd value.
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // Safety: plain flag manipulation on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// A non-blocking pipe used to kick a thread out of `select()`.
#[derive(Debug)]
pub struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    /// Creates the pipe, with both ends non-blocking.
    pub fn new() -> io::Result<Self> {
        let mut fds: [RawFd; 2] = [-1; 2];
        // Safety: fds has room for the two descriptors pipe() writes.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        // Safety: pipe() succeeded, so both descriptors are fresh and ours.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_nonblocking(read.as_raw_fd())?;
        set_nonblocking(write.as_raw_fd())?;
        Ok(Pipe { read, write })
    }

    /// Descriptor to watch for readability.
    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Writes one byte. A full pipe already guarantees a pending wake-up, so
    /// `EAGAIN` counts as success.
    pub fn wake(&self) -> io::Result<()> {
        let byte = [1u8];
        // Safety: writing one byte from a live buffer.
        let n = unsafe { libc::write(self.write.as_raw_fd(), byte.as_ptr().cast(), 1) };
        if n == -1 {
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::WouldBlock {
                return Err(e);
            }
        }
        Ok(())
    }

    /// Reads and discards everything currently in the pipe.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // Safety: reading into a live buffer of the stated length.
            let n = unsafe { libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fdset_membership() {
        let mut set = FdSet::new();
        assert_eq!(set.max(), None);
        set.insert(3);
        set.insert(9);
        set.insert(-1);
        set.insert(FD_SETSIZE as RawFd);
        assert!(set.contains(3));
        assert!(set.contains(9));
        assert!(!set.contains(4));
        assert!(!set.contains(-1));
        assert_eq!(set.max(), Some(9));
    }

    #[test]
    fn test_timeval_rounds_up() {
        let tv = to_timeval(Duration::from_nanos(1_500));
        assert_eq!((tv.tv_sec, tv.tv_usec), (0, 2));
        let tv = to_timeval(Duration::from_millis(2_250));
        assert_eq!((tv.tv_sec, tv.tv_usec), (2, 250_000));
    }

    #[test]
    fn test_pipe_wake_and_drain() {
        let pipe = Pipe::new().unwrap();
        assert!(!non_blocking_select(pipe.read_fd(), Operation::Read).unwrap());
        pipe.wake().unwrap();
        pipe.wake().unwrap();
        assert!(non_blocking_select(pipe.read_fd(), Operation::Read).unwrap());
        pipe.drain();
        assert!(!non_blocking_select(pipe.read_fd(), Operation::Read).unwrap());
    }

    #[test]
    fn test_pipe_write_end_is_writable() {
        let pipe = Pipe::new().unwrap();
        assert!(non_blocking_select(pipe.write.as_raw_fd(), Operation::Write).unwrap());
    }

    #[test]
    fn test_fd_is_open() {
        let pipe = Pipe::new().unwrap();
        assert!(fd_is_open(pipe.read_fd()));
        assert!(!fd_is_open(-1));
        assert!(!fd_is_open(1_000_000));
    }

    #[test]
    fn test_out_of_range_is_ebadf() {
        let e = non_blocking_select(-1, Operation::Read).unwrap_err();
        assert_eq!(e.raw_os_error(), Some(libc::EBADF));
    }
}
