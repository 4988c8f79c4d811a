// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Suspending a caller until native code is done with it.
//!
//! The runtime that sits above the BSP parks one of its threads whenever that
//! thread asks for I/O that can't complete immediately, and expects the BSP to
//! resume the thread later, exactly once. We model that as a one-shot pair:
//!
//! - [`Resumer<T>`] is held by whatever native machinery is going to finish
//!   the work (the select task, a worker task...). Calling
//!   [`Resumer::resume`] consumes it, so resuming twice is impossible by
//!   construction.
//! - [`Suspended<T>`] is held by the waiting side. It's a `Future` resolving
//!   to `Some(value)` once resumed, or `None` if the resumer was dropped
//!   without resuming, e.g. by a context shutting down. Threads that aren't
//!   running an executor can use [`Suspended::wait`] or
//!   [`Suspended::wait_timeout`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::task::{waker, ArcWake};

use crate::{OsalError, Result};

/// Creates a connected resumer/suspension pair.
pub fn suspension<T>() -> (Resumer<T>, Suspended<T>) {
    let (tx, rx) = oneshot::channel();
    (Resumer { tx }, Suspended { rx })
}

/// The resuming end of a suspension.
#[derive(Debug)]
pub struct Resumer<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Resumer<T> {
    /// Resumes the suspended side with `value`.
    ///
    /// If nobody is waiting any more (the `Suspended` was dropped), `value` is
    /// handed back in the `Err`.
    pub fn resume(self, value: T) -> core::result::Result<(), T> {
        self.tx.send(value)
    }

    /// Checks whether the waiting side has gone away.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_canceled()
    }
}

/// The waiting end of a suspension.
#[derive(Debug)]
#[must_use = "a suspension does nothing unless waited on"]
pub struct Suspended<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Suspended<T> {
    /// Blocks the calling thread until resumed.
    pub fn wait(self) -> Option<T> {
        futures::executor::block_on(self)
    }

    /// Blocks the calling thread until resumed, or until `timeout` elapses.
    ///
    /// On timeout this returns [`OsalError::TimedOut`] and the suspension
    /// remains usable, so the caller may keep waiting.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<T>> {
        let deadline = Instant::now() + timeout;
        let unparker = Arc::new(Unparker(thread::current()));
        let waker = waker(unparker);
        let mut cx = Context::from_waker(&waker);
        loop {
            if let Poll::Ready(v) = Pin::new(&mut *self).poll(&mut cx) {
                return Ok(v);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(OsalError::TimedOut);
            }
            thread::park_timeout(deadline - now);
        }
    }

    /// Checks for a result without blocking. Returns `None` if the suspension
    /// is still pending.
    pub fn try_take(&mut self) -> Option<Option<T>> {
        match self.rx.try_recv() {
            Ok(Some(v)) => Some(Some(v)),
            Ok(None) => None,
            Err(oneshot::Canceled) => Some(None),
        }
    }
}

impl<T> Future for Suspended<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.ok())
    }
}

/// Waker that unparks the thread blocked in `wait_timeout`.
struct Unparker(Thread);

impl ArcWake for Unparker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.unpark();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pin_utils::pin_mut;

    #[test]
    fn test_resume_then_wait() {
        let (r, s) = suspension();
        assert_eq!(r.resume(7), Ok(()));
        assert_eq!(s.wait(), Some(7));
    }

    #[test]
    fn test_dropped_resumer_yields_none() {
        let (r, s) = suspension::<u8>();
        drop(r);
        assert_eq!(s.wait(), None);
    }

    #[test]
    fn test_resume_after_waiter_gone() {
        let (r, s) = suspension();
        drop(s);
        assert!(r.is_abandoned());
        assert_eq!(r.resume(1), Err(1));
    }

    #[test]
    fn test_pending_until_resumed() {
        let (r, s) = suspension();
        futures::executor::block_on(async {
            pin_mut!(s);
            assert!(futures::poll!(s.as_mut()).is_pending());
            r.resume("ok").unwrap();
            assert_eq!(futures::poll!(s.as_mut()), Poll::Ready(Some("ok")));
        });
    }

    #[test]
    fn test_wait_timeout_from_other_thread() {
        let (r, mut s) = suspension();
        assert_eq!(s.wait_timeout(Duration::from_millis(5)), Err(OsalError::TimedOut));
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            r.resume(3u32).unwrap();
        });
        assert_eq!(s.wait_timeout(Duration::from_secs(5)), Ok(Some(3)));
        t.join().unwrap();
    }

    #[test]
    fn test_try_take() {
        let (r, mut s) = suspension();
        assert_eq!(s.try_take(), None);
        r.resume(5).unwrap();
        assert_eq!(s.try_take(), Some(Some(5)));
    }
}
