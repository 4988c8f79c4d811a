// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tasks.
//!
//! Board code is organized as a fixed set of long-running tasks: the select
//! task, the SPI master task, worker tasks. Each gets a name, a stack size and
//! a priority at creation. On the host a task is an OS thread. The name and
//! stack size are honored, the priority is recorded and logged but has no
//! effect.
//!
//! Tasks normally run for the life of the board. On the host we also need to
//! stop them (tests, clean shutdown), so each owner keeps its [`Task`] and
//! calls [`Task::join`] after asking the task body to return.

use std::borrow::Cow;
use std::thread::{self, JoinHandle};

use scopeguard::defer;

use crate::{OsalError, Result};

/// Creation parameters for a task.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskConfig {
    /// Task name, shown in debuggers and logs.
    pub name: Cow<'static, str>,
    /// Stack size in bytes.
    pub stack_size: usize,
    /// RTOS priority. Higher runs first on the board.
    pub priority: u8,
}

impl TaskConfig {
    /// Shorthand for building a config out of constants.
    pub const fn new(name: &'static str, stack_size: usize, priority: u8) -> Self {
        TaskConfig {
            name: Cow::Borrowed(name),
            stack_size,
            priority,
        }
    }
}

/// Smallest stack we'll ask the host for. RTOS stack sizes for small tasks are
/// tiny compared to what a host thread needs to run `std` formatting code.
const MIN_HOST_STACK: usize = 64 * 1024;

/// Handle to a running task.
#[derive(Debug)]
pub struct Task {
    name: Cow<'static, str>,
    priority: u8,
    handle: JoinHandle<()>,
}

impl Task {
    /// Starts a new task running `body`.
    ///
    /// Fails with [`OsalError::WrongArgs`] for an empty name or zero stack,
    /// and [`OsalError::Error`] if the host refuses to create the thread.
    pub fn spawn<F>(config: &TaskConfig, body: F) -> Result<Task>
    where
        F: FnOnce() + Send + 'static,
    {
        if config.name.is_empty() || config.stack_size == 0 {
            return Err(OsalError::WrongArgs);
        }
        let name = config.name.clone();
        let exit_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .stack_size(config.stack_size.max(MIN_HOST_STACK))
            .spawn(move || {
                defer! { log::debug!("task {} exited", exit_name); }
                body()
            })
            .map_err(|e| {
                log::error!("cannot create task {}: {}", name, e);
                OsalError::Error
            })?;
        log::debug!(
            "task {} started (stack {} bytes, priority {})",
            name,
            config.stack_size,
            config.priority,
        );
        Ok(Task {
            name,
            priority: config.priority,
            handle,
        })
    }

    /// Name the task was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Priority the task was created with.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Checks whether the task body has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the task body to return.
    ///
    /// Returns [`OsalError::Error`] if the task panicked.
    pub fn join(self) -> Result<()> {
        self.handle.join().map_err(|_| {
            log::error!("task {} panicked", self.name);
            OsalError::Error
        })
    }
}
