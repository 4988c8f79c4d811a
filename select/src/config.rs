// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build-time knobs of the select layer.

use llbsp::task::TaskConfig;
use llbsp::Millis;
use static_assertions::const_assert;

/// Maximum number of requests waiting at the same time.
pub const MAX_NB_ASYNC_SELECT: usize = 16;

/// Wait between two `select()` calls when no wake-up descriptor is available.
pub const POLLING_MODE_TIMEOUT: Millis = Millis(100);

/// Number of sockets whose timeout can be remembered.
pub const TIMEOUT_CACHE_SIZE: usize = 16;

const_assert!(MAX_NB_ASYNC_SELECT > 0);
const_assert!(TIMEOUT_CACHE_SIZE >= MAX_NB_ASYNC_SELECT);

/// How the select task is woken when the set of requests changes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NotifierKind {
    /// A non-blocking pipe whose read end is always in the read set. Writing
    /// a byte to it unblocks `select()`. If the pipe can't be created, the
    /// task falls back to polling.
    Pipe,
    /// No wake-up descriptor. `select()` never waits longer than
    /// [`SelectConfig::polling_interval`], so changes are picked up on the
    /// next tick.
    Polling,
}

/// What to do when a request arrives for an (fd, operation) pair that already
/// has one pending.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DuplicatePolicy {
    /// Refuse the new request; the pending one is untouched.
    Reject,
    /// Resolve the pending request as cancelled and take the new one.
    Replace,
}

/// Configuration of an [`AsyncSelect`][crate::AsyncSelect] context.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SelectConfig {
    /// Capacity of the request table.
    pub max_requests: usize,
    /// The select task.
    pub task: TaskConfig,
    /// Wake-up strategy.
    pub notifier: NotifierKind,
    /// Polling period in polling mode.
    pub polling_interval: Millis,
    /// Duplicate request handling.
    pub duplicate_policy: DuplicatePolicy,
    /// Capacity of the socket timeout cache.
    pub timeout_cache_size: usize,
    /// Pause after an unexpected `select()` failure before trying again.
    pub error_backoff: Millis,
}

impl Default for SelectConfig {
    fn default() -> Self {
        SelectConfig {
            max_requests: MAX_NB_ASYNC_SELECT,
            task: TaskConfig::new("AsyncSelect", 2048, 12),
            notifier: NotifierKind::Pipe,
            polling_interval: POLLING_MODE_TIMEOUT,
            duplicate_policy: DuplicatePolicy::Reject,
            timeout_cache_size: TIMEOUT_CACHE_SIZE,
            error_backoff: Millis(10),
        }
    }
}
