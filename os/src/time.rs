// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Timekeeping.
//!
//! The OS layer keeps a monotonic clock counting from the first time anyone
//! looked at it (in practice, process start). This module provides ways to
//! read that clock and to describe how long blocking operations may wait.
//!
//! # Types for describing time
//!
//! `TickTime` represents a specific point in time. It's analogous to
//! `std::time::Instant`, and can be converted to a millisecond count since
//! boot with [`TickTime::millis_since_boot`]. Internally it keeps full
//! resolution, so a deadline computed as `now + Millis(100)` is never reached
//! before 100ms have really elapsed.
//!
//! `Millis` represents a relative time interval in milliseconds. Most of the
//! native contracts this crate serves speak in milliseconds, so it's the
//! preferred unit for intervals.
//!
//! `Timeout` describes how long a blocking OSAL operation may wait: either
//! `Forever`, or some `Millis`.

use std::ops::{Add, AddAssign};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Process-wide origin of the tick clock.
fn boot() -> Instant {
    static BOOT: OnceLock<Instant> = OnceLock::new();
    *BOOT.get_or_init(Instant::now)
}

/// Represents a moment in time by the value of the system tick counter.
/// System-specific analog of `std::time::Instant`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default, Hash)]
pub struct TickTime(Duration);

impl TickTime {
    /// Retrieves the current value of the tick counter.
    pub fn now() -> Self {
        TickTime(boot().elapsed())
    }

    /// Constructs a `TickTime` value describing a certain number of
    /// milliseconds since boot.
    pub fn from_millis_since_boot(m: u64) -> Self {
        Self(Duration::from_millis(m))
    }

    /// Whole milliseconds between boot and this instant.
    pub fn millis_since_boot(self) -> u64 {
        u64::try_from(self.0.as_millis()).unwrap_or(u64::MAX)
    }

    /// Time between `earlier` and `self`, or zero if `earlier` is actually
    /// later.
    pub fn duration_since(self, earlier: TickTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    /// Subtracts an earlier time from this one, giving the amount of time
    /// between them measured in whole `Millis`. Saturates at zero.
    pub fn millis_since(self, earlier: TickTime) -> Millis {
        Millis(u64::try_from(self.duration_since(earlier).as_millis()).unwrap_or(u64::MAX))
    }

    /// Checks the clock to determine how much time has elapsed since the
    /// instant recorded by `self`.
    pub fn elapsed(self) -> Millis {
        Self::now().millis_since(self)
    }

    /// Adds some milliseconds to `self`, checking for overflow.
    pub fn checked_add(self, millis: Millis) -> Option<Self> {
        self.0.checked_add(Duration::from_millis(millis.0)).map(TickTime)
    }

    /// Subtracts some milliseconds from `self`, checking for overflow.
    /// Overflow can occur if `millis` is longer than the time from boot to
    /// `self`.
    pub fn checked_sub(self, millis: Millis) -> Option<Self> {
        self.0.checked_sub(Duration::from_millis(millis.0)).map(TickTime)
    }
}

/// Add a `Duration` to a `TickTime` with normal `+` overflow behavior.
impl Add<Duration> for TickTime {
    type Output = Self;
    fn add(self, other: Duration) -> Self::Output {
        TickTime(self.0 + other)
    }
}

impl AddAssign<Duration> for TickTime {
    fn add_assign(&mut self, other: Duration) {
        self.0 += other;
    }
}

impl Add<Millis> for TickTime {
    type Output = Self;
    fn add(self, other: Millis) -> Self::Output {
        self + Duration::from(other)
    }
}

impl AddAssign<Millis> for TickTime {
    fn add_assign(&mut self, other: Millis) {
        *self += Duration::from(other);
    }
}

/// A period of time measured in milliseconds.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default, Hash)]
pub struct Millis(pub u64);

impl From<Millis> for Duration {
    fn from(x: Millis) -> Self {
        Duration::from_millis(x.0)
    }
}

impl From<Millis> for u64 {
    fn from(x: Millis) -> Self {
        x.0
    }
}

impl Add for Millis {
    type Output = Self;
    fn add(self, other: Millis) -> Self::Output {
        Millis(self.0 + other.0)
    }
}

/// How long a blocking operation is allowed to wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Timeout {
    /// Wait until the operation can complete, however long that takes.
    Forever,
    /// Give up after this long. `After(Millis(0))` means "don't wait at all".
    After(Millis),
}

impl Timeout {
    /// Converts the native millisecond convention, where `0` means "no
    /// timeout", into a `Timeout`.
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            Timeout::Forever
        } else {
            Timeout::After(Millis(ms))
        }
    }

    /// Absolute deadline for an operation starting at `start`, or `None` for
    /// `Forever` (and for deadlines too far out to represent).
    pub fn deadline_from(self, start: TickTime) -> Option<TickTime> {
        match self {
            Timeout::Forever => None,
            Timeout::After(ms) => start.checked_add(ms),
        }
    }
}

/// Time left between now and `deadline`, zero if it has passed.
pub fn remaining_until(deadline: TickTime) -> Duration {
    deadline.duration_since(TickTime::now())
}

/// Parks the calling task for at least `period`.
pub fn sleep_for(period: impl Into<Duration>) {
    std::thread::sleep(period.into());
}
