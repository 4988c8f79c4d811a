// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting and binary semaphores.
//!
//! A `Semaphore` holds a number of _permits,_ up to some maximum. Callers take
//! one permit using [`Semaphore::acquire`], which will block (up to a
//! timeout) if there are none available. Permits are added back one at a time
//! with [`Semaphore::release`], or in batches with
//! [`Semaphore::release_multiple`].
//!
//! There's no "permit object" that gives the permit back when dropped. The
//! main use of semaphores in board code is signalling between different
//! contexts (an API call releases, a driver task acquires), where the two
//! ends are nowhere near each other.
//!
//! A _binary_ semaphore is just a semaphore whose maximum is 1. Releasing one
//! that already has its permit does nothing, so several signals sent before
//! the consumer gets around to looking collapse into one.

use std::sync::{Condvar, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use crate::time::{remaining_until, TickTime, Timeout};
use crate::{OsalError, Result};

/// A counting semaphore with a ceiling.
#[derive(Debug)]
pub struct Semaphore {
    available: StdMutex<usize>,
    max: usize,
    released: Condvar,
}

impl Semaphore {
    /// Creates a semaphore holding `initial` permits, which can never hold
    /// more than `max`.
    ///
    /// `max` must be nonzero and `initial` must not exceed it.
    pub fn new(initial: usize, max: usize) -> Result<Self> {
        if max == 0 || initial > max {
            return Err(OsalError::WrongArgs);
        }
        Ok(Semaphore {
            available: StdMutex::new(initial),
            max,
            released: Condvar::new(),
        })
    }

    /// Creates a binary semaphore, initially empty.
    pub fn binary() -> Self {
        Semaphore {
            available: StdMutex::new(0),
            max: 1,
            released: Condvar::new(),
        }
    }

    /// Takes a single permit, blocking for at most `timeout` if none is
    /// available.
    pub fn acquire(&self, timeout: Timeout) -> Result<()> {
        let deadline = timeout.deadline_from(TickTime::now());
        let mut available = self.count();
        while *available == 0 {
            available = match deadline {
                None => self
                    .released
                    .wait(available)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let left = remaining_until(deadline);
                    if left.is_zero() {
                        return Err(OsalError::TimedOut);
                    }
                    self.released
                        .wait_timeout(available, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        *available -= 1;
        Ok(())
    }

    /// Attempts to take a single permit from the semaphore, returning `Ok` if
    /// one is available immediately, or `Err` if they are all taken.
    pub fn try_acquire(&self) -> core::result::Result<(), NoPermits> {
        let mut available = self.count();
        *available = available.checked_sub(1).ok_or(NoPermits)?;
        Ok(())
    }

    /// Returns the number of permits available in the semaphore.
    ///
    /// Note that this is a _snapshot._ Another task may be racing you.
    pub fn permits_available(&self) -> usize {
        *self.count()
    }

    /// Stuffs one permit back into the semaphore, waking a waiter if there is
    /// one. Permits beyond the maximum are discarded.
    pub fn release(&self) {
        self.release_multiple(1)
    }

    /// Stuffs up to `count` permits back into the semaphore, waking as many
    /// waiters as there are new permits.
    pub fn release_multiple(&self, count: usize) {
        let mut available = self.count();
        let before = *available;
        *available = before.saturating_add(count).min(self.max);
        let added = *available - before;
        drop(available);
        for _ in 0..added {
            self.released.notify_one();
        }
    }

    fn count(&self) -> StdMutexGuard<'_, usize> {
        self.available.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Error produced by [`Semaphore::try_acquire`] when no permits are available.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NoPermits;
