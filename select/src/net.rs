// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers for network natives built on the select layer.
//!
//! A blocking socket call on the board runs like this: try the operation
//! non-blocking; if it would block, park the calling thread with
//! [`AsyncSelect::async_operation`] and return. When the thread is resumed it
//! calls the native again with `retry` set. If the socket still isn't ready,
//! either the timeout really passed or another thread consumed the event, and
//! `async_operation` tells the two apart using the expiry the timeout cache
//! remembered for the first wait.

use std::io;
use std::os::fd::RawFd;

use llbsp::{Millis, TickTime};
use thiserror::Error;

use crate::cache::Expiry;
use crate::{AsyncSelect, Operation, Outcome, SelectError};

/// Network error codes reported to the runtime.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum NetError {
    /// `EACCES`
    #[error("permission denied")]
    AccessDenied,
    /// `EBADF`
    #[error("bad file descriptor")]
    BadDescriptor,
    /// `EHOSTDOWN`
    #[error("host is down")]
    HostDown,
    /// `ENETDOWN`
    #[error("network is down")]
    NetworkDown,
    /// `ENETUNREACH`
    #[error("network is unreachable")]
    NetworkUnreachable,
    /// `EADDRINUSE`
    #[error("address already in use")]
    AddressInUse,
    /// `EINVAL`
    #[error("invalid argument")]
    InvalidArgument,
    /// `ECONNABORTED`
    #[error("connection aborted")]
    ConnectionAborted,
    /// `ENOPROTOOPT`
    #[error("protocol not available")]
    NoProtocolOption,
    /// `ENOTCONN`
    #[error("socket is not connected")]
    NotConnected,
    /// `EAFNOSUPPORT`
    #[error("address family not supported")]
    AddressFamilyNotSupported,
    /// `ECONNREFUSED`
    #[error("connection refused")]
    ConnectionRefused,
    /// `EISCONN`
    #[error("socket is already connected")]
    AlreadyConnected,
    /// `ECONNRESET`
    #[error("connection reset by peer")]
    ConnectionReset,
    /// `EMSGSIZE`
    #[error("message too long")]
    MessageTooLong,
    /// `EPIPE`
    #[error("broken pipe")]
    BrokenPipe,
    /// `ETIMEDOUT`, or a retried wait whose timeout has passed.
    #[error("timed out")]
    TimedOut,
    /// `ENOBUFS`, `ENOSPC` or `ENOMEM`.
    #[error("out of memory")]
    NoMemory,
    /// `EHOSTUNREACH`
    #[error("host is unreachable")]
    HostUnreachable,
    /// Any errno without a dedicated code.
    #[error("unknown error (errno {0})")]
    Unknown(i32),
    /// The select table is full; the call can't block.
    #[error("blocking request queue limit reached")]
    QueueLimitReached,
}

impl NetError {
    /// Maps a host errno to a network error.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EACCES => NetError::AccessDenied,
            libc::EBADF => NetError::BadDescriptor,
            libc::EHOSTDOWN => NetError::HostDown,
            libc::ENETDOWN => NetError::NetworkDown,
            libc::ENETUNREACH => NetError::NetworkUnreachable,
            libc::EADDRINUSE => NetError::AddressInUse,
            libc::EINVAL => NetError::InvalidArgument,
            libc::ECONNABORTED => NetError::ConnectionAborted,
            libc::ENOPROTOOPT => NetError::NoProtocolOption,
            libc::ENOTCONN => NetError::NotConnected,
            libc::EAFNOSUPPORT => NetError::AddressFamilyNotSupported,
            libc::ECONNREFUSED => NetError::ConnectionRefused,
            libc::EISCONN => NetError::AlreadyConnected,
            libc::ECONNRESET => NetError::ConnectionReset,
            libc::EMSGSIZE => NetError::MessageTooLong,
            libc::EPIPE => NetError::BrokenPipe,
            libc::ETIMEDOUT => NetError::TimedOut,
            libc::ENOBUFS | libc::ENOSPC | libc::ENOMEM => NetError::NoMemory,
            libc::EHOSTUNREACH => NetError::HostUnreachable,
            other => NetError::Unknown(other),
        }
    }

    /// Native status code, negative like every error code the runtime sees.
    pub fn code(&self) -> i32 {
        match self {
            NetError::AccessDenied => -2,
            NetError::BadDescriptor => -3,
            NetError::HostDown => -4,
            NetError::NetworkDown => -5,
            NetError::NetworkUnreachable => -6,
            NetError::AddressInUse => -7,
            NetError::InvalidArgument => -8,
            NetError::ConnectionAborted => -9,
            NetError::NoProtocolOption => -10,
            NetError::NotConnected => -11,
            NetError::AddressFamilyNotSupported => -12,
            NetError::ConnectionRefused => -13,
            NetError::AlreadyConnected => -14,
            NetError::ConnectionReset => -15,
            NetError::MessageTooLong => -16,
            NetError::BrokenPipe => -17,
            NetError::TimedOut => -18,
            NetError::NoMemory => -19,
            NetError::HostUnreachable => -20,
            NetError::Unknown(_) => -1,
            NetError::QueueLimitReached => -21,
        }
    }
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => NetError::from_errno(errno),
            None if e.kind() == io::ErrorKind::TimedOut => NetError::TimedOut,
            None => NetError::Unknown(0),
        }
    }
}

impl From<SelectError> for NetError {
    fn from(e: SelectError) -> Self {
        match e {
            SelectError::CapacityExceeded { .. } | SelectError::NotRunning => {
                NetError::QueueLimitReached
            }
            SelectError::Duplicate { .. } | SelectError::Osal(_) => NetError::InvalidArgument,
            SelectError::NotFound { .. } => NetError::Unknown(0),
            SelectError::InvalidFd { .. } => NetError::BadDescriptor,
            SelectError::Io(e) => e.into(),
        }
    }
}

/// The calling thread has been parked; its resume callback will run once the
/// socket is ready or the wait ends.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Blocked;

/// Rounds a wait up to whole milliseconds, never to zero (which would mean
/// "forever").
fn ceil_millis(remaining: std::time::Duration) -> u64 {
    let ms = (remaining.as_nanos() + 999_999) / 1_000_000;
    u64::try_from(ms).unwrap_or(u64::MAX).max(1)
}

impl AsyncSelect {
    /// Parks a network call that would block on `fd`.
    ///
    /// The wait uses the socket's cached timeout (none cached means no
    /// timeout). On a `retry` of a socket that has a timeout, the wait only
    /// goes on for whatever is left of the original one; if that has run out,
    /// or the original expiry isn't known, the call fails with
    /// [`NetError::TimedOut`].
    pub fn async_operation(
        &self,
        fd: RawFd,
        operation: Operation,
        retry: bool,
        resume: impl FnOnce(Outcome) + Send + 'static,
    ) -> Result<Blocked, NetError> {
        let timeout = self.socket_timeout(fd).unwrap_or(Millis(0));
        let mut timeout_ms = timeout.0;
        if timeout_ms != 0 && retry {
            let expiry = match self.socket_expiry(fd, operation) {
                Some(Expiry::At(at)) => at,
                Some(Expiry::Never) | None => return Err(NetError::TimedOut),
            };
            let now = TickTime::now();
            if now >= expiry {
                log::debug!("{} on fd {}: timed out after retry", operation, fd);
                return Err(NetError::TimedOut);
            }
            timeout_ms = ceil_millis(expiry.duration_since(now));
        }
        self.async_select(fd, operation, timeout_ms, resume)
            .map_err(|e| {
                log::warn!("{} on fd {} cannot block: {}", operation, fd, e);
                NetError::from(e)
            })?;
        Ok(Blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectConfig;
    use crate::sys::Pipe;
    use std::time::Duration;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(NetError::from_errno(libc::ECONNRESET), NetError::ConnectionReset);
        assert_eq!(NetError::from_errno(libc::ENOBUFS), NetError::NoMemory);
        assert_eq!(NetError::from_errno(libc::ENOSPC), NetError::NoMemory);
        assert_eq!(NetError::from_errno(libc::ENOMEM), NetError::NoMemory);
        assert_eq!(NetError::from_errno(libc::ENOTSOCK), NetError::Unknown(libc::ENOTSOCK));
        let e: NetError = io::Error::from_raw_os_error(libc::EPIPE).into();
        assert_eq!(e, NetError::BrokenPipe);
    }

    #[test]
    fn test_codes_are_distinct_and_negative() {
        let all = [
            NetError::AccessDenied,
            NetError::BadDescriptor,
            NetError::HostDown,
            NetError::NetworkDown,
            NetError::NetworkUnreachable,
            NetError::AddressInUse,
            NetError::InvalidArgument,
            NetError::ConnectionAborted,
            NetError::NoProtocolOption,
            NetError::NotConnected,
            NetError::AddressFamilyNotSupported,
            NetError::ConnectionRefused,
            NetError::AlreadyConnected,
            NetError::ConnectionReset,
            NetError::MessageTooLong,
            NetError::BrokenPipe,
            NetError::TimedOut,
            NetError::NoMemory,
            NetError::HostUnreachable,
            NetError::Unknown(1234),
            NetError::QueueLimitReached,
        ];
        let mut codes: Vec<i32> = all.iter().map(NetError::code).collect();
        assert!(codes.iter().all(|&c| c < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn test_ceil_millis() {
        assert_eq!(ceil_millis(Duration::from_micros(1)), 1);
        assert_eq!(ceil_millis(Duration::from_micros(1_001)), 2);
        assert_eq!(ceil_millis(Duration::ZERO), 1);
    }

    #[test]
    fn test_retry_without_expiry_times_out() {
        let sel = AsyncSelect::start(SelectConfig::default()).unwrap();
        let pipe = Pipe::new().unwrap();
        let fd = pipe.read_fd();
        sel.set_socket_timeout(fd, Millis(50));
        let e = sel.async_operation(fd, Operation::Read, true, |_| ()).unwrap_err();
        assert_eq!(e, NetError::TimedOut);
        assert_eq!(sel.pending(), 0);
    }

    #[test]
    fn test_retry_uses_remaining_time() {
        let sel = AsyncSelect::start(SelectConfig::default()).unwrap();
        let pipe = Pipe::new().unwrap();
        let fd = pipe.read_fd();
        sel.set_socket_timeout(fd, Millis(200));

        // First wait is woken early by data that another reader takes.
        let (tx, rx) = std::sync::mpsc::channel();
        let tx2 = tx.clone();
        sel.async_operation(fd, Operation::Read, false, move |o| tx.send(o).unwrap())
            .unwrap();
        pipe.wake().unwrap();
        assert_eq!(rx.recv().unwrap(), Outcome::Ready);
        pipe.drain();

        let Some(Expiry::At(first_expiry)) = sel.socket_expiry(fd, Operation::Read) else {
            panic!("expiry not recorded");
        };
        sel.async_operation(fd, Operation::Read, true, move |o| tx2.send(o).unwrap())
            .unwrap();
        assert_eq!(rx.recv().unwrap(), Outcome::Timeout);
        // The retry ended at (roughly) the original expiry, not 200ms later.
        let late = TickTime::now().millis_since(first_expiry);
        assert!(late < Millis(150), "retry overshot by {:?}", late);

        let e = sel.async_operation(fd, Operation::Read, true, |_| ()).unwrap_err();
        assert_eq!(e, NetError::TimedOut);
    }

    #[test]
    fn test_write_wait_leaves_read_expiry_alone() {
        let sel = AsyncSelect::start(SelectConfig::default()).unwrap();
        let pipe = Pipe::new().unwrap();
        let fd = pipe.read_fd();
        sel.set_socket_timeout(fd, Millis(1_000));

        let (tx, rx) = std::sync::mpsc::channel();
        sel.async_operation(fd, Operation::Read, false, move |o| tx.send(o).unwrap())
            .unwrap();
        let read_expiry = sel.socket_expiry(fd, Operation::Read);
        assert!(matches!(read_expiry, Some(Expiry::At(_))));

        // A pipe read end never becomes writable, so this one stays pending.
        let _write = sel.select(fd, Operation::Write, 0).unwrap();
        assert_eq!(sel.socket_expiry(fd, Operation::Write), Some(Expiry::Never));
        assert_eq!(sel.socket_expiry(fd, Operation::Read), read_expiry);

        pipe.wake().unwrap();
        assert_eq!(rx.recv().unwrap(), Outcome::Ready);
        pipe.drain();
        assert_eq!(sel.async_operation(fd, Operation::Read, true, |_| ()), Ok(Blocked));
    }

    #[test]
    fn test_no_timeout_retry_blocks_again() {
        let sel = AsyncSelect::start(SelectConfig::default()).unwrap();
        let pipe = Pipe::new().unwrap();
        let fd = pipe.read_fd();
        assert_eq!(
            sel.async_operation(fd, Operation::Read, true, |_| ()),
            Ok(Blocked)
        );
        assert_eq!(sel.pending(), 1);
    }

    #[test]
    fn test_full_table_is_queue_limit() {
        let sel = AsyncSelect::start(SelectConfig {
            max_requests: 1,
            ..SelectConfig::default()
        })
        .unwrap();
        let a = Pipe::new().unwrap();
        let b = Pipe::new().unwrap();
        sel.async_operation(a.read_fd(), Operation::Read, false, |_| ())
            .unwrap();
        let e = sel
            .async_operation(b.read_fd(), Operation::Read, false, |_| ())
            .unwrap_err();
        assert_eq!(e, NetError::QueueLimitReached);
    }
}
