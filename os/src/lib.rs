// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small OS abstraction layer (OSAL) for board support code.
//!
//! This crate provides the handful of primitives that the rest of the `llbsp`
//! crates are written against: tasks, mutexes, semaphores, bounded queues, a
//! millisecond clock, and *suspensions* (the way a managed-runtime thread
//! waits for native code to finish something on its behalf).
//!
//! # `llbsp` design principles
//!
//! 1. Be explicit. Every context (select layer, SPI driver, worker) is an
//!    owned value with an init call and a teardown call. There is no hidden
//!    global driver state.
//!
//! 2. Be bounded. Tables, pools and queues have a capacity fixed at creation
//!    time. Running out is an error reported to the caller, never a reason to
//!    grow.
//!
//! 3. Resume exactly once. Any thread that suspends waiting on this layer is
//!    resumed exactly once, with an outcome. Nothing is dropped silently.
//!
//! # About the OS layer
//!
//! On the board, these primitives map onto an RTOS. On a host they map onto
//! OS threads, which is what this crate implements. The API keeps the RTOS
//! shape:
//!
//! - Blocking operations take a [`Timeout`][time::Timeout], which is either
//!   `Forever` or a number of milliseconds.
//! - Failures are reported with [`OsalError`], whose [`OsalError::code`]
//!   gives the native status code.
//! - Tasks have a name, a stack size and a priority ([`task::TaskConfig`]).
//!   The host scheduler ignores the priority, but we keep it for diagnostics.
//!
//! # Suspension
//!
//! The runtime above this layer is cooperative: a runtime thread asking for
//! I/O is parked, and native code resumes it later. [`suspend::suspension`]
//! models that as a pair: a [`Resumer`][suspend::Resumer] that native code
//! holds, and a [`Suspended`][suspend::Suspended] future that the waiting
//! side awaits (or blocks on).

#![warn(
    elided_lifetimes_in_paths,
    explicit_outlives_requirements,
    missing_debug_implementations,
    missing_docs,
    semicolon_in_expressions_from_macros,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_op_in_unsafe_fn,
    unused_qualifications,
)]

pub mod mutex;
pub mod queue;
pub mod semaphore;
pub mod suspend;
pub mod task;
pub mod time;

use thiserror::Error;

/// Status of an OSAL operation that did not succeed.
///
/// Success is `Ok(..)`, so there is no `Ok` variant here.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum OsalError {
    /// Generic failure (the underlying primitive could not be created or used).
    #[error("OSAL operation failed")]
    Error,
    /// A bounded resource is full.
    #[error("OSAL resource exhausted")]
    NoMemory,
    /// A parameter is outside what the primitive accepts.
    #[error("invalid argument to OSAL operation")]
    WrongArgs,
    /// A blocking operation gave up after its timeout.
    #[error("OSAL operation timed out")]
    TimedOut,
}

impl OsalError {
    /// Native status code for this error. `0` is reserved for success.
    ///
    /// The RTOS port reports a timeout as a generic error, so `TimedOut`
    /// shares its code with `Error`.
    pub fn code(&self) -> i32 {
        match self {
            OsalError::Error | OsalError::TimedOut => -1,
            OsalError::NoMemory => -2,
            OsalError::WrongArgs => -3,
        }
    }
}

/// Shorthand for results of OSAL operations.
pub type Result<T> = core::result::Result<T, OsalError>;

pub use time::{Millis, TickTime, Timeout};
