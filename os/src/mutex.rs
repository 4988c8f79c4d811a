// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mutex with timed acquisition.
//!
//! This implements a mutex (a kind of lock) guarding a value of type `T`. It
//! differs from `std::sync::Mutex` in two ways that matter to board code:
//!
//! - It can be taken with a [`Timeout`], matching the RTOS `take(timeout)` /
//!   `give()` contract.
//! - It's not poisoned by a panicking holder. The OSAL contract has no notion
//!   of poisoning, and the structures guarded here re-validate their own state.
//!
//! # `lock` vs `perform`
//!
//! Most users should prefer [`Mutex::perform`], which takes a closure, locks,
//! applies the closure to the contents, and unlocks. Because the closure is a
//! plain `FnOnce`, there's no way to block on some *other* primitive while
//! holding the lock by accident. Code that must release the lock, call out,
//! and retake it (the select loop does this around callbacks) can use
//! [`Mutex::lock`] or [`Mutex::take`] to get a [`MutexGuard`] and drop it
//! explicitly.
//!
//! # Implementation details
//!
//! The "locked" flag lives in a small `std` mutex paired with a condition
//! variable. Waiters sleep on the condition variable, and releasing the mutex
//! wakes one of them. The contents live outside the `std` mutex in an
//! `UnsafeCell`, accessible only while the flag is held.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use crate::time::{remaining_until, TickTime, Timeout};
use crate::{OsalError, Result};

/// Holds a `T` that can be accessed from multiple tasks, but only one at a
/// time.
#[derive(Debug)]
pub struct Mutex<T: ?Sized> {
    /// `true` while some guard exists.
    locked: StdMutex<bool>,
    /// Signalled each time the mutex is released.
    released: Condvar,
    /// The contents of the mutex. Safe to access only while `locked` was
    /// flipped false->true by the accessor.
    value: UnsafeCell<T>,
}

// Safety: access to `value` is serialized by the `locked` flag, so sharing a
// `Mutex<T>` between threads is fine as long as `T` itself can be sent.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates an unlocked mutex holding `contents`.
    pub const fn new(contents: T) -> Self {
        Mutex {
            locked: StdMutex::new(false),
            released: Condvar::new(),
            value: UnsafeCell::new(contents),
        }
    }

    /// Consumes the mutex, returning its contents.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Locks this mutex immediately if it is free, and returns a guard for
    /// holding it locked.
    ///
    /// If the mutex is _not_ free, returns `None`.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut locked = self.flag();
        if *locked {
            None
        } else {
            *locked = true;
            Some(MutexGuard { mutex: self })
        }
    }

    /// Takes the mutex, blocking for at most `timeout`.
    ///
    /// `Timeout::After(Millis(0))` is equivalent to [`Mutex::try_lock`] but
    /// reports failure as [`OsalError::TimedOut`].
    pub fn take(&self, timeout: Timeout) -> Result<MutexGuard<'_, T>> {
        let deadline = timeout.deadline_from(TickTime::now());
        let mut locked = self.flag();
        while *locked {
            locked = match (timeout, deadline) {
                (Timeout::Forever, _) | (_, None) => self
                    .released
                    .wait(locked)
                    .unwrap_or_else(PoisonError::into_inner),
                (Timeout::After(_), Some(deadline)) => {
                    let left = remaining_until(deadline);
                    if left.is_zero() {
                        return Err(OsalError::TimedOut);
                    }
                    self.released
                        .wait_timeout(locked, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        *locked = true;
        Ok(MutexGuard { mutex: self })
    }

    /// Takes the mutex, blocking as long as it takes.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let mut locked = self.flag();
        while *locked {
            locked = self
                .released
                .wait(locked)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *locked = true;
        MutexGuard { mutex: self }
    }

    /// Locks this mutex, applies the operation `op` to its contents, and
    /// unlocks it, returning whatever `op` returned.
    ///
    /// The mutex is released even if `op` panics.
    pub fn perform<R>(&self, op: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        op(&mut guard)
    }

    /// Non-blocking version of [`Mutex::perform`]. Returns `None` without
    /// calling `op` if the mutex is taken.
    pub fn try_perform<R>(&self, op: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.try_lock()?;
        Some(op(&mut guard))
    }

    /// Returns a mutable reference to the contents. Requires exclusive access
    /// to the mutex, so no locking is needed.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Gives the mutex back and wakes one waiter.
    fn unlock(&self) {
        *self.flag() = false;
        self.released.notify_one();
    }

    fn flag(&self) -> StdMutexGuard<'_, bool> {
        self.locked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

/// Resource token indicating that a mutex is held. Dropping it gives the mutex
/// back.
#[derive(Debug)]
#[must_use = "dropping a MutexGuard releases the mutex immediately"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: the existence of the guard proves we hold the lock.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: the existence of the guard proves we hold the lock, and the
        // `&mut self` receiver proves nobody else is using this guard.
        unsafe { &mut *self.mutex.value.get() }
    }
}

// Safety: a guard only hands out `&T` through `&self`.
unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Millis;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_perform_uncontended() {
        let m = Mutex::new(41);
        let r = m.perform(|x| {
            *x += 1;
            *x
        });
        assert_eq!(r, 42);
        assert_eq!(m.into_inner(), 42);
    }

    #[test]
    fn test_try_lock_while_held() {
        let m = Mutex::new(());
        let g = m.try_lock().expect("free mutex should lock");
        assert!(m.try_lock().is_none());
        assert!(m.try_perform(|_| ()).is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn test_take_times_out() {
        let m = Mutex::new(0u8);
        let _g = m.lock();
        let start = TickTime::now();
        let r = m.take(Timeout::After(Millis(20)));
        assert_eq!(r.err(), Some(OsalError::TimedOut));
        assert!(start.elapsed() >= Millis(20));
    }

    #[test]
    fn test_take_zero_timeout_does_not_block() {
        let m = Mutex::new(0u8);
        let _g = m.lock();
        assert_eq!(m.take(Timeout::After(Millis(0))).err(), Some(OsalError::TimedOut));
    }

    #[test]
    fn test_handoff_between_threads() {
        let m = Arc::new(Mutex::new(Vec::new()));
        let guard = m.lock();

        let m2 = Arc::clone(&m);
        let waiter = thread::spawn(move || {
            let mut g = m2
                .take(Timeout::After(Millis(5_000)))
                .expect("mutex should be released");
            g.push(2);
        });

        thread::sleep(std::time::Duration::from_millis(10));
        drop(guard);
        waiter.join().unwrap();
        m.perform(|v| v.push(3));
        assert_eq!(m.perform(|v| v.clone()), vec![2, 3]);
    }

    #[test]
    fn test_released_after_panicking_op() {
        let m = Arc::new(Mutex::new(0));
        let m2 = Arc::clone(&m);
        let r = thread::spawn(move || {
            m2.perform(|_| panic!("boom"));
        })
        .join();
        assert!(r.is_err());
        assert!(m.try_lock().is_some());
    }
}
