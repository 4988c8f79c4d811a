// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ways of waking the select task.
//!
//! The select task spends most of its life blocked in `select()`. When a new
//! request arrives, or a descriptor is closed out from under it, it has to
//! re-evaluate its sets. There are two strategies:
//!
//! - [`PipeWake`]: keep the read end of a pipe in the read set, and write a
//!   byte to the other end to wake the task immediately.
//! - [`Polling`]: never block for longer than a fixed interval, and pick up
//!   changes on the next tick. Used when no wake-up descriptor can be made.
//!
//! The strategy is picked once, at startup, by [`for_config`].

use std::fmt::Debug;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::config::{NotifierKind, SelectConfig};
use crate::sys::Pipe;

/// A strategy for interrupting the select task.
pub trait Notifier: Send + Sync + Debug {
    /// Descriptor to include in the read set, if the strategy uses one.
    fn fd(&self) -> Option<RawFd>;

    /// Makes the current (or next) `select()` return promptly.
    fn notify(&self);

    /// Consumes pending wake-ups, once `fd` has been seen readable.
    fn drain(&self);

    /// Upper bound on a single `select()` wait, if the strategy polls.
    fn max_wait(&self) -> Option<Duration>;
}

/// Wakes the select task by writing to a pipe.
#[derive(Debug)]
pub struct PipeWake {
    pipe: Pipe,
}

impl PipeWake {
    /// Creates the wake-up pipe.
    pub fn new() -> std::io::Result<Self> {
        Ok(PipeWake { pipe: Pipe::new()? })
    }
}

impl Notifier for PipeWake {
    fn fd(&self) -> Option<RawFd> {
        Some(self.pipe.read_fd())
    }

    fn notify(&self) {
        if let Err(e) = self.pipe.wake() {
            log::error!("async select: cannot notify select task: {}", e);
        }
    }

    fn drain(&self) {
        self.pipe.drain();
    }

    fn max_wait(&self) -> Option<Duration> {
        None
    }
}

/// Bounds each `select()` so that changes are noticed within one interval.
#[derive(Debug)]
pub struct Polling {
    interval: Duration,
}

impl Polling {
    /// Creates a polling strategy with the given period.
    pub fn new(interval: impl Into<Duration>) -> Self {
        Polling {
            interval: interval.into(),
        }
    }
}

impl Notifier for Polling {
    fn fd(&self) -> Option<RawFd> {
        None
    }

    fn notify(&self) {}

    fn drain(&self) {}

    fn max_wait(&self) -> Option<Duration> {
        Some(self.interval)
    }
}

/// Builds the strategy `config` asks for. If a pipe is requested but can't be
/// created, falls back to polling.
pub fn for_config(config: &SelectConfig) -> Box<dyn Notifier> {
    match config.notifier {
        NotifierKind::Pipe => match PipeWake::new() {
            Ok(n) => Box::new(n),
            Err(e) => {
                log::warn!(
                    "async select: wake-up pipe unavailable ({}), falling back to polling every {}ms",
                    e,
                    config.polling_interval.0,
                );
                Box::new(Polling::new(config.polling_interval))
            }
        },
        NotifierKind::Polling => Box::new(Polling::new(config.polling_interval)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::non_blocking_select;
    use crate::Operation;
    use llbsp::Millis;

    #[test]
    fn test_pipe_notifier_round_trip() {
        let n = PipeWake::new().unwrap();
        let fd = n.fd().unwrap();
        assert_eq!(n.max_wait(), None);
        n.notify();
        assert!(non_blocking_select(fd, Operation::Read).unwrap());
        n.drain();
        assert!(!non_blocking_select(fd, Operation::Read).unwrap());
    }

    #[test]
    fn test_polling_notifier_has_no_fd() {
        let n = Polling::new(Millis(100));
        assert_eq!(n.fd(), None);
        assert_eq!(n.max_wait(), Some(Duration::from_millis(100)));
        n.notify();
        n.drain();
    }

    #[test]
    fn test_for_config_selects_strategy() {
        let polling = for_config(&SelectConfig {
            notifier: NotifierKind::Polling,
            ..SelectConfig::default()
        });
        assert_eq!(polling.fd(), None);

        let pipe = for_config(&SelectConfig::default());
        assert!(pipe.fd().is_some());
    }
}
