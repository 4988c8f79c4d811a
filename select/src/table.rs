// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The table of pending select requests.
//!
//! The table itself is not synchronized; [`AsyncSelect`][crate::AsyncSelect]
//! keeps it in a mutex. Every operation that finishes requests hands back
//! [`Resolution`]s instead of calling the callbacks, so the caller can drop
//! the lock first and then [`Resolution::fire`] them. Callbacks are free to
//! call straight back into the select layer.
//!
//! A request leaves the table only as a `Resolution`, and a `Resolution` can
//! only be consumed by firing it. Together that gives the "resolved exactly
//! once" guarantee.

use std::fmt;
use std::os::fd::RawFd;

use llbsp::TickTime;

use crate::config::DuplicatePolicy;
use crate::sys::FdSet;
use crate::{Operation, Outcome, ResumeFn, SelectError};

struct Request {
    fd: RawFd,
    operation: Operation,
    deadline: Option<TickTime>,
    cancelled: bool,
    resume: ResumeFn,
}

impl Request {
    fn resolve(self, outcome: Outcome) -> Resolution {
        Resolution {
            fd: self.fd,
            operation: self.operation,
            outcome,
            resume: self.resume,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("fd", &self.fd)
            .field("operation", &self.operation)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}

/// A request that has left the table, together with how it ended.
#[must_use = "a resolution must be fired, or the waiting thread never resumes"]
pub struct Resolution {
    /// Descriptor the request was watching.
    pub fd: RawFd,
    /// What it was waiting for.
    pub operation: Operation,
    /// How it ended.
    pub outcome: Outcome,
    resume: ResumeFn,
}

impl Resolution {
    /// Runs the request's resume callback with its outcome.
    pub fn fire(self) {
        log::debug!(
            "async select: {} request on fd {} done ({:?})",
            self.operation,
            self.fd,
            self.outcome,
        );
        (self.resume)(self.outcome);
    }
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolution")
            .field("fd", &self.fd)
            .field("operation", &self.operation)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

/// Descriptor sets and wake-up time for one `select()` call.
#[derive(Debug, Default)]
pub struct Interest {
    /// Descriptors with a pending read request.
    pub read: FdSet,
    /// Descriptors with a pending write request.
    pub write: FdSet,
    /// Earliest deadline across pending requests, `None` if all are infinite.
    pub nearest_deadline: Option<TickTime>,
}

/// Bounded set of pending requests, unique per (fd, operation).
#[derive(Debug)]
pub struct RequestTable {
    requests: Vec<Request>,
    capacity: usize,
    policy: DuplicatePolicy,
    closed: bool,
}

impl RequestTable {
    /// Creates an empty table holding at most `capacity` requests.
    pub fn new(capacity: usize, policy: DuplicatePolicy) -> Self {
        RequestTable {
            requests: Vec::with_capacity(capacity),
            capacity,
            policy,
            closed: false,
        }
    }

    /// Adds a request.
    ///
    /// Under [`DuplicatePolicy::Replace`], an existing request for the same
    /// (fd, operation) is removed and returned as a `Cancelled` resolution
    /// for the caller to fire.
    pub fn enqueue(
        &mut self,
        fd: RawFd,
        operation: Operation,
        deadline: Option<TickTime>,
        resume: ResumeFn,
    ) -> Result<Option<Resolution>, SelectError> {
        if self.closed {
            return Err(SelectError::NotRunning);
        }
        let existing = self.position(fd, operation);
        let replaced = match (existing, self.policy) {
            (Some(_), DuplicatePolicy::Reject) => {
                return Err(SelectError::Duplicate { fd, operation });
            }
            (Some(idx), DuplicatePolicy::Replace) => {
                Some(self.requests.remove(idx).resolve(Outcome::Cancelled))
            }
            (None, _) => {
                if self.requests.len() >= self.capacity {
                    return Err(SelectError::CapacityExceeded {
                        capacity: self.capacity,
                    });
                }
                None
            }
        };
        self.requests.push(Request {
            fd,
            operation,
            deadline,
            cancelled: false,
            resume,
        });
        Ok(replaced)
    }

    /// Removes the request for (fd, operation) as ready.
    pub fn dequeue_ready(&mut self, fd: RawFd, operation: Operation) -> Result<Resolution, SelectError> {
        self.dequeue(fd, operation, Outcome::Ready)
    }

    /// Removes the request for (fd, operation) as timed out.
    pub fn dequeue_timeout(&mut self, fd: RawFd, operation: Operation) -> Result<Resolution, SelectError> {
        self.dequeue(fd, operation, Outcome::Timeout)
    }

    fn dequeue(&mut self, fd: RawFd, operation: Operation, outcome: Outcome) -> Result<Resolution, SelectError> {
        let idx = self
            .position(fd, operation)
            .ok_or(SelectError::NotFound { fd, operation })?;
        Ok(self.requests.remove(idx).resolve(outcome))
    }

    /// Marks every request on `fd` for cancellation. They're resolved by the
    /// next [`RequestTable::take_expired`]. Returns how many were marked.
    pub fn mark_closed(&mut self, fd: RawFd) -> usize {
        let mut marked = 0;
        for r in self.requests.iter_mut().filter(|r| r.fd == fd) {
            r.cancelled = true;
            marked += 1;
        }
        marked
    }

    /// Removes cancelled requests and requests whose deadline is at or before
    /// `now`.
    pub fn take_expired(&mut self, now: TickTime) -> Vec<Resolution> {
        self.take_where(|r| {
            if r.cancelled {
                Some(Outcome::Cancelled)
            } else if r.deadline.map_or(false, |d| d <= now) {
                Some(Outcome::Timeout)
            } else {
                None
            }
        })
    }

    /// Removes requests whose descriptor came back ready from `select()`.
    ///
    /// Requests cancelled while `select()` was running stay put; a closed
    /// descriptor is never reported ready. [`RequestTable::take_expired`]
    /// resolves them.
    pub fn take_ready(&mut self, read: &FdSet, write: &FdSet) -> Vec<Resolution> {
        self.take_where(|r| {
            let set = match r.operation {
                Operation::Read => read,
                Operation::Write => write,
            };
            (!r.cancelled && set.contains(r.fd)).then_some(Outcome::Ready)
        })
    }

    /// Removes requests whose descriptor fails `is_open`, as `Error(EBADF)`.
    pub fn take_invalid(&mut self, is_open: impl Fn(RawFd) -> bool) -> Vec<Resolution> {
        self.take_where(|r| (!is_open(r.fd)).then_some(Outcome::Error(libc::EBADF)))
    }

    /// Descriptor sets and nearest deadline of the live (not cancelled)
    /// requests.
    pub fn interest(&self) -> Interest {
        let mut interest = Interest::default();
        for r in self.requests.iter().filter(|r| !r.cancelled) {
            match r.operation {
                Operation::Read => interest.read.insert(r.fd),
                Operation::Write => interest.write.insert(r.fd),
            }
            if let Some(d) = r.deadline {
                interest.nearest_deadline = Some(interest.nearest_deadline.map_or(d, |n| n.min(d)));
            }
        }
        interest
    }

    /// Refuses all further requests and removes every pending one as
    /// `Cancelled`.
    pub fn close(&mut self) -> Vec<Resolution> {
        self.closed = true;
        self.take_where(|_| Some(Outcome::Cancelled))
    }

    /// Checks whether [`RequestTable::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Checks for a pending request on (fd, operation).
    pub fn contains(&self, fd: RawFd, operation: Operation) -> bool {
        self.position(fd, operation).is_some()
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Checks whether no request is pending.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Maximum number of pending requests.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn position(&self, fd: RawFd, operation: Operation) -> Option<usize> {
        self.requests
            .iter()
            .position(|r| r.fd == fd && r.operation == operation)
    }

    /// Removes every request for which `decide` returns an outcome, keeping
    /// the others in order.
    fn take_where(&mut self, mut decide: impl FnMut(&Request) -> Option<Outcome>) -> Vec<Resolution> {
        let mut done = Vec::new();
        let mut kept = Vec::with_capacity(self.capacity);
        for r in self.requests.drain(..) {
            match decide(&r) {
                Some(outcome) => done.push(r.resolve(outcome)),
                None => kept.push(r),
            }
        }
        self.requests = kept;
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llbsp::Millis;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    /// Collects every outcome delivered to callbacks made by `cb`.
    #[derive(Clone, Default)]
    struct Log(Arc<Mutex<Vec<(RawFd, Outcome)>>>);

    impl Log {
        fn cb(&self, fd: RawFd) -> ResumeFn {
            let log = self.0.clone();
            Box::new(move |o| log.lock().unwrap().push((fd, o)))
        }

        fn take(&self) -> Vec<(RawFd, Outcome)> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    fn fire(rs: Vec<Resolution>) {
        rs.into_iter().for_each(Resolution::fire);
    }

    #[test]
    fn test_capacity_exceeded() {
        let log = Log::default();
        let mut t = RequestTable::new(2, DuplicatePolicy::Reject);
        t.enqueue(1, Operation::Read, None, log.cb(1)).unwrap();
        t.enqueue(2, Operation::Read, None, log.cb(2)).unwrap();
        let e = t.enqueue(3, Operation::Read, None, log.cb(3)).unwrap_err();
        assert!(matches!(e, SelectError::CapacityExceeded { capacity: 2 }));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_duplicate_rejected() {
        let log = Log::default();
        let mut t = RequestTable::new(4, DuplicatePolicy::Reject);
        t.enqueue(5, Operation::Read, None, log.cb(5)).unwrap();
        let e = t.enqueue(5, Operation::Read, None, log.cb(5)).unwrap_err();
        assert!(matches!(e, SelectError::Duplicate { fd: 5, operation: Operation::Read }));
        // The other direction is independent.
        assert!(t.enqueue(5, Operation::Write, None, log.cb(5)).unwrap().is_none());
        assert_eq!(t.len(), 2);
        assert!(log.take().is_empty());
    }

    #[test]
    fn test_duplicate_replaced() {
        let log = Log::default();
        let mut t = RequestTable::new(1, DuplicatePolicy::Replace);
        t.enqueue(5, Operation::Read, None, log.cb(50)).unwrap();
        let replaced = t.enqueue(5, Operation::Read, None, log.cb(51)).unwrap();
        replaced.expect("first request should be handed back").fire();
        assert_eq!(log.take(), vec![(50, Outcome::Cancelled)]);
        assert_eq!(t.len(), 1);

        fire(vec![t.dequeue_ready(5, Operation::Read).unwrap()]);
        assert_eq!(log.take(), vec![(51, Outcome::Ready)]);
    }

    #[test]
    fn test_only_one_dequeue_wins() {
        let log = Log::default();
        let mut t = RequestTable::new(4, DuplicatePolicy::Reject);
        t.enqueue(7, Operation::Write, None, log.cb(7)).unwrap();
        t.dequeue_timeout(7, Operation::Write).unwrap().fire();
        let e = t.dequeue_ready(7, Operation::Write).unwrap_err();
        assert!(matches!(e, SelectError::NotFound { fd: 7, operation: Operation::Write }));
        assert_eq!(log.take(), vec![(7, Outcome::Timeout)]);
    }

    #[test]
    fn test_mark_closed_then_take_expired() {
        let log = Log::default();
        let mut t = RequestTable::new(4, DuplicatePolicy::Reject);
        t.enqueue(7, Operation::Write, None, log.cb(7)).unwrap();
        t.enqueue(7, Operation::Read, None, log.cb(7)).unwrap();
        t.enqueue(8, Operation::Read, None, log.cb(8)).unwrap();
        assert_eq!(t.mark_closed(7), 2);

        // Cancelled requests are not watched any more.
        let interest = t.interest();
        assert!(!interest.read.contains(7));
        assert!(!interest.write.contains(7));
        assert!(interest.read.contains(8));

        fire(t.take_expired(TickTime::now()));
        assert_eq!(log.take(), vec![(7, Outcome::Cancelled), (7, Outcome::Cancelled)]);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_deadlines() {
        let log = Log::default();
        let mut t = RequestTable::new(4, DuplicatePolicy::Reject);
        let base = TickTime::from_millis_since_boot(1_000);
        t.enqueue(1, Operation::Read, Some(base + Millis(100)), log.cb(1)).unwrap();
        t.enqueue(2, Operation::Read, Some(base + Millis(50)), log.cb(2)).unwrap();
        t.enqueue(3, Operation::Read, None, log.cb(3)).unwrap();

        assert_eq!(t.interest().nearest_deadline, Some(base + Millis(50)));

        fire(t.take_expired(base + Millis(49)));
        assert!(log.take().is_empty());
        fire(t.take_expired(base + Millis(50)));
        assert_eq!(log.take(), vec![(2, Outcome::Timeout)]);
        assert_eq!(t.interest().nearest_deadline, Some(base + Millis(100)));
    }

    #[test]
    fn test_take_ready_matches_direction() {
        let log = Log::default();
        let mut t = RequestTable::new(4, DuplicatePolicy::Reject);
        t.enqueue(4, Operation::Read, None, log.cb(4)).unwrap();
        t.enqueue(6, Operation::Write, None, log.cb(6)).unwrap();

        let mut read = FdSet::new();
        read.insert(6);
        let mut write = FdSet::new();
        write.insert(6);
        fire(t.take_ready(&read, &write));
        assert_eq!(log.take(), vec![(6, Outcome::Ready)]);
        assert!(t.contains(4, Operation::Read));
    }

    #[test]
    fn test_closed_during_select_is_cancelled_not_ready() {
        let log = Log::default();
        let mut t = RequestTable::new(4, DuplicatePolicy::Reject);
        t.enqueue(5, Operation::Read, None, log.cb(5)).unwrap();
        let interest = t.interest();
        assert!(interest.read.contains(5));

        // Closed after the sets were built, then select() saw it readable.
        assert_eq!(t.mark_closed(5), 1);
        fire(t.take_ready(&interest.read, &interest.write));
        assert!(log.take().is_empty());
        assert!(t.contains(5, Operation::Read));

        fire(t.take_expired(TickTime::now()));
        assert_eq!(log.take(), vec![(5, Outcome::Cancelled)]);
        assert!(t.is_empty());
    }

    #[test]
    fn test_take_invalid() {
        let log = Log::default();
        let mut t = RequestTable::new(4, DuplicatePolicy::Reject);
        t.enqueue(4, Operation::Read, None, log.cb(4)).unwrap();
        t.enqueue(9, Operation::Read, None, log.cb(9)).unwrap();
        fire(t.take_invalid(|fd| fd != 9));
        assert_eq!(log.take(), vec![(9, Outcome::Error(libc::EBADF))]);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_close_cancels_and_refuses() {
        let log = Log::default();
        let mut t = RequestTable::new(4, DuplicatePolicy::Reject);
        t.enqueue(4, Operation::Read, None, log.cb(4)).unwrap();
        fire(t.close());
        assert_eq!(log.take(), vec![(4, Outcome::Cancelled)]);
        assert!(t.is_closed());
        let e = t.enqueue(4, Operation::Read, None, log.cb(4)).unwrap_err();
        assert!(matches!(e, SelectError::NotRunning));
    }

    #[derive(Clone, Debug)]
    enum Op {
        Enqueue(RawFd, bool),
        Ready(RawFd, bool),
        Timeout(RawFd, bool),
        Close(RawFd),
        Expire,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..6, any::<bool>()).prop_map(|(fd, r)| Op::Enqueue(fd, r)),
            (0..6, any::<bool>()).prop_map(|(fd, r)| Op::Ready(fd, r)),
            (0..6, any::<bool>()).prop_map(|(fd, r)| Op::Timeout(fd, r)),
            (0..6).prop_map(Op::Close),
            Just(Op::Expire),
        ]
    }

    fn dir(read: bool) -> Operation {
        if read {
            Operation::Read
        } else {
            Operation::Write
        }
    }

    proptest! {
        /// The table never holds more than its capacity, and every accepted
        /// request is resolved exactly once by the end.
        #[test]
        fn prop_resolved_exactly_once(
            ops in prop::collection::vec(op(), 0..80),
            replace in any::<bool>(),
        ) {
            let policy = if replace { DuplicatePolicy::Replace } else { DuplicatePolicy::Reject };
            let mut t = RequestTable::new(4, policy);
            let fired = Arc::new(Mutex::new(Vec::<u32>::new()));
            let mut accepted = 0u32;

            for op in ops {
                match op {
                    Op::Enqueue(fd, r) => {
                        let id = accepted;
                        let fired = fired.clone();
                        let cb: ResumeFn = Box::new(move |_| fired.lock().unwrap().push(id));
                        if let Ok(replaced) = t.enqueue(fd, dir(r), None, cb) {
                            accepted += 1;
                            if let Some(r) = replaced {
                                r.fire();
                            }
                        }
                    }
                    Op::Ready(fd, r) => {
                        if let Ok(res) = t.dequeue_ready(fd, dir(r)) {
                            res.fire();
                        }
                    }
                    Op::Timeout(fd, r) => {
                        if let Ok(res) = t.dequeue_timeout(fd, dir(r)) {
                            res.fire();
                        }
                    }
                    Op::Close(fd) => {
                        t.mark_closed(fd);
                    }
                    Op::Expire => fire(t.take_expired(TickTime::now())),
                }
                prop_assert!(t.len() <= t.capacity());
            }
            fire(t.close());

            let mut fired = fired.lock().unwrap().clone();
            fired.sort_unstable();
            prop_assert_eq!(fired, (0..accepted).collect::<Vec<_>>());
        }
    }
}
