// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asynchronous `select()` for a cooperative runtime.
//!
//! Runtime threads doing socket I/O must not block the OS task they run on.
//! Instead, a native that would block registers a request here and parks its
//! thread. A single background task multiplexes every registered descriptor
//! through `select()` and resumes each parked thread exactly once, with an
//! [`Outcome`]:
//!
//! - `Ready` when the descriptor became readable (or writable),
//! - `Timeout` when the request's deadline passed first,
//! - `Cancelled` when the descriptor was closed, the request was replaced, or
//!   the context shut down,
//! - `Error(errno)` when the descriptor turned out to be invalid.
//!
//! ```no_run
//! # use llbsp_select::{AsyncSelect, Operation, Outcome, SelectConfig};
//! # fn f(fd: std::os::fd::RawFd) -> Result<(), llbsp_select::SelectError> {
//! let select = AsyncSelect::start(SelectConfig::default())?;
//! let wait = select.select(fd, Operation::Read, 100)?;
//! match wait.wait() {
//!     Some(Outcome::Ready) => { /* read the socket */ }
//!     other => println!("no data: {:?}", other),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Resume callbacks run on the select task, outside every internal lock, so
//! they may register new requests. They should be short.

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

pub mod cache;
pub mod config;
pub mod net;
pub mod notify;
pub mod sys;
pub mod table;

mod selector;

use std::fmt;
use std::io;
use std::os::fd::RawFd;

use llbsp::OsalError;
use thiserror::Error;

pub use config::{DuplicatePolicy, NotifierKind, SelectConfig};
pub use net::{Blocked, NetError};
pub use selector::AsyncSelect;
pub use sys::non_blocking_select;

/// What a request waits for.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Operation {
    /// The descriptor becomes readable.
    Read,
    /// The descriptor becomes writable.
    Write,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Read => "read",
            Operation::Write => "write",
        })
    }
}

/// How a request ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The operation can proceed without blocking.
    Ready,
    /// The deadline passed first.
    Timeout,
    /// The descriptor was closed, the request was replaced, or the select
    /// context shut down.
    Cancelled,
    /// The descriptor is unusable; carries the errno.
    Error(i32),
}

/// Callback resuming a parked thread. Called exactly once.
pub type ResumeFn = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// Reasons a request can't be registered or found.
#[derive(Debug, Error)]
pub enum SelectError {
    /// Every slot of the request table is taken.
    #[error("too many pending select requests (capacity {capacity})")]
    CapacityExceeded {
        /// Size of the table.
        capacity: usize,
    },
    /// A request for the same descriptor and operation is already pending.
    #[error("a {operation} request is already pending on fd {fd}")]
    Duplicate {
        /// Descriptor.
        fd: RawFd,
        /// Operation.
        operation: Operation,
    },
    /// No such request is pending (it was already resolved).
    #[error("no {operation} request pending on fd {fd}")]
    NotFound {
        /// Descriptor.
        fd: RawFd,
        /// Operation.
        operation: Operation,
    },
    /// The descriptor can't be watched by `select()`.
    #[error("fd {fd} cannot be selected")]
    InvalidFd {
        /// Descriptor.
        fd: RawFd,
    },
    /// The context has been shut down.
    #[error("async select is not running")]
    NotRunning,
    /// An OS primitive failed.
    #[error(transparent)]
    Osal(#[from] OsalError),
    /// A system call failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}
