// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded message queue.
//!
//! A `Queue<T>` has a fixed capacity chosen at creation. Posting never blocks:
//! if the queue is full, [`Queue::post`] fails with [`OsalError::NoMemory`]
//! and the caller decides what to do. Fetching blocks for up to a
//! [`Timeout`].
//!
//! The queue is multi-producer, multi-consumer, but the typical use is many
//! API callers posting and one dedicated task fetching.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::time::{remaining_until, TickTime, Timeout};
use crate::{OsalError, Result};

/// A bounded, non-blocking-on-post queue of `T`.
#[derive(Debug)]
pub struct Queue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> Queue<T> {
    /// Creates an empty queue that can hold up to `capacity` items.
    ///
    /// A zero capacity is rejected with [`OsalError::WrongArgs`].
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(OsalError::WrongArgs);
        }
        let (tx, rx) = channel::bounded(capacity);
        Ok(Queue { tx, rx, capacity })
    }

    /// Adds `item` to the back of the queue without blocking.
    ///
    /// If the queue is full, `item` is dropped and this returns
    /// [`OsalError::NoMemory`].
    pub fn post(&self, item: T) -> Result<()> {
        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => OsalError::NoMemory,
            TrySendError::Disconnected(_) => OsalError::Error,
        })
    }

    /// Removes the item at the front of the queue, waiting at most `timeout`
    /// for one to arrive.
    pub fn fetch(&self, timeout: Timeout) -> Result<T> {
        let deadline = match timeout.deadline_from(TickTime::now()) {
            None => return self.rx.recv().map_err(|_| OsalError::Error),
            Some(deadline) => deadline,
        };
        self.rx
            .recv_timeout(remaining_until(deadline))
            .map_err(|e| match e {
                RecvTimeoutError::Timeout => OsalError::TimedOut,
                RecvTimeoutError::Disconnected => OsalError::Error,
            })
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Checks whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Maximum number of items the queue can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Millis;

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(Queue::<u8>::new(0).err(), Some(OsalError::WrongArgs));
    }

    #[test]
    fn test_post_full_is_nomem() {
        let q = Queue::new(2).unwrap();
        assert_eq!(q.post(1), Ok(()));
        assert_eq!(q.post(2), Ok(()));
        assert_eq!(q.post(3), Err(OsalError::NoMemory));
        assert_eq!(q.len(), 2);
        assert_eq!(q.capacity(), 2);
    }

    #[test]
    fn test_fifo_order() {
        let q = Queue::new(4).unwrap();
        for i in 0..4 {
            q.post(i).unwrap();
        }
        for i in 0..4 {
            assert_eq!(q.fetch(Timeout::Forever), Ok(i));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_fetch_times_out() {
        let q = Queue::<u8>::new(1).unwrap();
        let start = TickTime::now();
        assert_eq!(q.fetch(Timeout::After(Millis(15))), Err(OsalError::TimedOut));
        assert!(start.elapsed() >= Millis(15));
    }
}
