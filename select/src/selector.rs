// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The select task and its public face.
//!
//! An [`AsyncSelect`] owns one background task that loops:
//!
//! 1. Under the table lock, pull out everything that has expired or been
//!    cancelled, and compute the descriptor sets plus the nearest deadline.
//! 2. Drop the lock and fire the resolutions.
//! 3. Call `select()` on the sets (plus the wake-up descriptor, if any),
//!    waiting until the nearest deadline or the polling interval, whichever
//!    comes first.
//! 4. Under the lock again, pull out the ready requests, drop the lock, fire.
//!
//! Callers register from any thread. Registration only touches the table and
//! then wakes the task, so a request is picked up at once in pipe mode and
//! within one polling interval otherwise.

use std::io;
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use llbsp::mutex::Mutex;
use llbsp::suspend::{suspension, Suspended};
use llbsp::task::Task;
use llbsp::time::{remaining_until, sleep_for};
use llbsp::{Millis, OsalError, TickTime, Timeout};

use crate::cache::{Expiry, TimeoutCache};
use crate::config::SelectConfig;
use crate::notify::{self, Notifier};
use crate::sys::{self, fd_in_range};
use crate::table::{RequestTable, Resolution};
use crate::{Operation, Outcome, ResumeFn, SelectError};

#[derive(Debug)]
struct Shared {
    table: Mutex<RequestTable>,
    cache: Mutex<TimeoutCache>,
    notifier: Box<dyn Notifier>,
    error_backoff: Millis,
}

/// A running async select context.
///
/// Dropping it stops the task; see [`AsyncSelect::shutdown`].
#[derive(Debug)]
pub struct AsyncSelect {
    shared: Arc<Shared>,
    task: Option<Task>,
}

impl AsyncSelect {
    /// Creates the request table and starts the select task.
    pub fn start(config: SelectConfig) -> Result<Self, SelectError> {
        if config.max_requests == 0 {
            return Err(OsalError::WrongArgs.into());
        }
        let shared = Arc::new(Shared {
            table: Mutex::new(RequestTable::new(config.max_requests, config.duplicate_policy)),
            cache: Mutex::new(TimeoutCache::new(config.timeout_cache_size)),
            notifier: notify::for_config(&config),
            error_backoff: config.error_backoff,
        });
        let task_shared = Arc::clone(&shared);
        let task = Task::spawn(&config.task, move || select_task(&task_shared))?;
        log::info!(
            "async select started ({} slots, notifier {:?})",
            config.max_requests,
            shared.notifier,
        );
        Ok(AsyncSelect {
            shared,
            task: Some(task),
        })
    }

    /// Registers interest in `operation` on `fd`.
    ///
    /// `resume` runs exactly once, on the select task, with the outcome. A
    /// `timeout_ms` of 0 waits forever. The call itself never blocks beyond
    /// the table lock.
    pub fn async_select(
        &self,
        fd: RawFd,
        operation: Operation,
        timeout_ms: u64,
        resume: impl FnOnce(Outcome) + Send + 'static,
    ) -> Result<(), SelectError> {
        self.register(fd, operation, Timeout::from_millis(timeout_ms), Box::new(resume))
    }

    /// Like [`AsyncSelect::async_select`], but hands back a [`Suspended`] to
    /// wait on instead of taking a callback.
    pub fn select(
        &self,
        fd: RawFd,
        operation: Operation,
        timeout_ms: u64,
    ) -> Result<Suspended<Outcome>, SelectError> {
        let (resumer, suspended) = suspension();
        self.async_select(fd, operation, timeout_ms, move |outcome| {
            if resumer.resume(outcome).is_err() {
                log::trace!("async select: waiter for {} on fd {} went away", operation, fd);
            }
        })?;
        Ok(suspended)
    }

    fn register(
        &self,
        fd: RawFd,
        operation: Operation,
        timeout: Timeout,
        resume: ResumeFn,
    ) -> Result<(), SelectError> {
        if !fd_in_range(fd) {
            return Err(SelectError::InvalidFd { fd });
        }
        let deadline = timeout.deadline_from(TickTime::now());
        let replaced = self
            .shared
            .table
            .perform(|t| t.enqueue(fd, operation, deadline, resume))?;
        self.shared
            .cache
            .perform(|c| c.set_expiry(fd, operation, Expiry::from(deadline)));
        log::trace!("async select: {} on fd {} queued ({:?})", operation, fd, timeout);
        self.shared.notifier.notify();
        if let Some(r) = replaced {
            fire(r);
        }
        Ok(())
    }

    /// Tells the select layer that `fd` has been closed.
    ///
    /// Every request on `fd` resolves as [`Outcome::Cancelled`], and the
    /// socket's cached timeout is forgotten.
    pub fn notify_fd_closed(&self, fd: RawFd) {
        let marked = self.shared.table.perform(|t| t.mark_closed(fd));
        self.shared.cache.perform(|c| c.remove(fd));
        log::debug!("async select: fd {} closed, {} request(s) cancelled", fd, marked);
        if marked > 0 {
            self.shared.notifier.notify();
        }
    }

    /// Number of requests waiting.
    pub fn pending(&self) -> usize {
        self.shared.table.perform(|t| t.len())
    }

    /// Records the receive timeout configured on a socket. `Millis(0)` means
    /// no timeout.
    pub fn set_socket_timeout(&self, fd: RawFd, timeout: Millis) {
        self.shared.cache.perform(|c| c.set_timeout(fd, timeout));
    }

    /// Receive timeout recorded for a socket, if cached.
    pub fn socket_timeout(&self, fd: RawFd) -> Option<Millis> {
        self.shared.cache.perform(|c| c.timeout(fd))
    }

    /// When the last `operation` wait registered on a socket ends, if known.
    pub fn socket_expiry(&self, fd: RawFd, operation: Operation) -> Option<Expiry> {
        self.shared.cache.perform(|c| c.expiry(fd, operation))
    }

    /// Forgets everything cached about a socket.
    pub fn remove_socket(&self, fd: RawFd) -> bool {
        self.shared.cache.perform(|c| c.remove(fd))
    }

    /// Cancels every pending request and stops the select task.
    ///
    /// Later registrations fail with [`SelectError::NotRunning`]. Calling
    /// this more than once is harmless.
    pub fn shutdown(&mut self) -> Result<(), SelectError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let cancelled = self.shared.table.perform(|t| t.close());
        log::info!("async select stopping, {} request(s) cancelled", cancelled.len());
        cancelled.into_iter().for_each(fire);
        self.shared.notifier.notify();
        task.join()?;
        Ok(())
    }
}

impl Drop for AsyncSelect {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("async select: shutdown failed: {}", e);
        }
    }
}

/// Fires a resolution, keeping a panicking callback from taking the select
/// task down with it.
fn fire(r: Resolution) {
    let (fd, operation) = (r.fd, r.operation);
    if catch_unwind(AssertUnwindSafe(|| r.fire())).is_err() {
        log::error!("async select: resume callback for {} on fd {} panicked", operation, fd);
    }
}

fn select_task(shared: &Shared) {
    loop {
        let (expired, interest, closed) = shared.table.perform(|t| {
            let expired = t.take_expired(TickTime::now());
            (expired, t.interest(), t.is_closed())
        });
        expired.into_iter().for_each(fire);
        if closed {
            break;
        }

        let mut read = interest.read;
        let mut write = interest.write;
        let wake_fd = shared.notifier.fd();
        if let Some(fd) = wake_fd {
            read.insert(fd);
        }
        let until_deadline = interest.nearest_deadline.map(remaining_until);
        let wait = match (until_deadline, shared.notifier.max_wait()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        match sys::select(&mut read, &mut write, wait) {
            Ok(_) => {
                if let Some(fd) = wake_fd {
                    if read.contains(fd) {
                        shared.notifier.drain();
                    }
                }
                let done = shared.table.perform(|t| {
                    let mut done = t.take_ready(&read, &write);
                    done.extend(t.take_expired(TickTime::now()));
                    done
                });
                done.into_iter().for_each(fire);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.raw_os_error() == Some(libc::EBADF) => {
                // Somebody closed a descriptor without telling us. Find it.
                let bad = shared.table.perform(|t| t.take_invalid(sys::fd_is_open));
                log::warn!("async select: {} request(s) on closed descriptors", bad.len());
                bad.into_iter().for_each(fire);
            }
            Err(e) => {
                log::error!("async select: select() failed: {}", e);
                sleep_for(shared.error_backoff);
            }
        }
    }
}
