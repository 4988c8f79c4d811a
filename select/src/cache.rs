// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-socket timeout cache.
//!
//! Network natives ask "what is this socket's receive timeout?" on every
//! blocking call, and a retry after wake-up needs to know when the *original*
//! wait was supposed to end. This cache remembers both, for a bounded number
//! of sockets. Sockets that don't fit are simply not cached (and logged).
//!
//! Reads and writes on one socket wait independently, so each direction has
//! its own expiry.

use std::os::fd::RawFd;

use llbsp::{Millis, TickTime};

use crate::Operation;

/// When a socket's current wait ends.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Expiry {
    /// The wait has no timeout.
    Never,
    /// The wait times out at this instant.
    At(TickTime),
}

impl From<Option<TickTime>> for Expiry {
    fn from(deadline: Option<TickTime>) -> Self {
        deadline.map_or(Expiry::Never, Expiry::At)
    }
}

#[derive(Copy, Clone, Debug)]
struct Entry {
    fd: RawFd,
    timeout: Option<Millis>,
    read_expiry: Option<Expiry>,
    write_expiry: Option<Expiry>,
}

impl Entry {
    fn expiry_mut(&mut self, operation: Operation) -> &mut Option<Expiry> {
        match operation {
            Operation::Read => &mut self.read_expiry,
            Operation::Write => &mut self.write_expiry,
        }
    }
}

/// Bounded map from socket to its configured timeout and current expiry.
#[derive(Debug)]
pub struct TimeoutCache {
    entries: Vec<Entry>,
    capacity: usize,
}

impl TimeoutCache {
    /// Creates an empty cache for up to `capacity` sockets.
    pub fn new(capacity: usize) -> Self {
        TimeoutCache {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Configured timeout for `fd`. `Millis(0)` means no timeout; `None`
    /// means the socket isn't cached.
    pub fn timeout(&self, fd: RawFd) -> Option<Millis> {
        self.find(fd).and_then(|e| e.timeout)
    }

    /// Expiry of the last `operation` wait registered for `fd`, if known.
    pub fn expiry(&self, fd: RawFd, operation: Operation) -> Option<Expiry> {
        self.find(fd).and_then(|e| match operation {
            Operation::Read => e.read_expiry,
            Operation::Write => e.write_expiry,
        })
    }

    /// Records the configured timeout of `fd`.
    pub fn set_timeout(&mut self, fd: RawFd, timeout: Millis) {
        if let Some(e) = self.entry(fd) {
            e.timeout = Some(timeout);
        }
    }

    /// Records when the current `operation` wait on `fd` ends.
    pub fn set_expiry(&mut self, fd: RawFd, operation: Operation, expiry: Expiry) {
        if let Some(e) = self.entry(fd) {
            *e.expiry_mut(operation) = Some(expiry);
        }
    }

    /// Forgets `fd`. Returns `false` if it wasn't cached.
    pub fn remove(&mut self, fd: RawFd) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.fd != fd);
        if self.entries.len() == before {
            log::trace!("timeout cache: fd {} was not cached", fd);
            false
        } else {
            true
        }
    }

    /// Number of cached sockets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks whether no socket is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, fd: RawFd) -> Option<&Entry> {
        self.entries.iter().find(|e| e.fd == fd)
    }

    /// Finds or adds the entry for `fd`; `None` if the cache is full.
    fn entry(&mut self, fd: RawFd) -> Option<&mut Entry> {
        let idx = match self.entries.iter().position(|e| e.fd == fd) {
            Some(idx) => idx,
            None if self.entries.len() < self.capacity => {
                self.entries.push(Entry {
                    fd,
                    timeout: None,
                    read_expiry: None,
                    write_expiry: None,
                });
                self.entries.len() - 1
            }
            None => {
                log::warn!("timeout cache: too many sockets, fd {} not cached", fd);
                return None;
            }
        };
        self.entries.get_mut(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut c = TimeoutCache::new(4);
        assert_eq!(c.timeout(3), None);
        c.set_timeout(3, Millis(250));
        assert_eq!(c.timeout(3), Some(Millis(250)));
        assert_eq!(c.expiry(3, Operation::Read), None);

        let at = TickTime::from_millis_since_boot(1_000);
        c.set_expiry(3, Operation::Read, Expiry::At(at));
        assert_eq!(c.expiry(3, Operation::Read), Some(Expiry::At(at)));
        assert_eq!(c.timeout(3), Some(Millis(250)));

        c.set_expiry(5, Operation::Write, None.into());
        assert_eq!(c.expiry(5, Operation::Write), Some(Expiry::Never));
        assert_eq!(c.timeout(5), None);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_directions_expire_independently() {
        let mut c = TimeoutCache::new(4);
        let read_at = TickTime::from_millis_since_boot(500);
        c.set_expiry(7, Operation::Read, Expiry::At(read_at));
        c.set_expiry(7, Operation::Write, Expiry::Never);
        assert_eq!(c.expiry(7, Operation::Read), Some(Expiry::At(read_at)));
        assert_eq!(c.expiry(7, Operation::Write), Some(Expiry::Never));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_full_cache_ignores_new_sockets() {
        let mut c = TimeoutCache::new(1);
        c.set_timeout(1, Millis(10));
        c.set_timeout(2, Millis(20));
        assert_eq!(c.timeout(2), None);
        // Existing entries still update.
        c.set_timeout(1, Millis(30));
        assert_eq!(c.timeout(1), Some(Millis(30)));
    }

    #[test]
    fn test_remove_frees_room() {
        let mut c = TimeoutCache::new(1);
        c.set_timeout(1, Millis(10));
        assert!(c.remove(1));
        assert!(!c.remove(1));
        assert!(c.is_empty());
        c.set_timeout(2, Millis(20));
        assert_eq!(c.timeout(2), Some(Millis(20)));
    }
}
