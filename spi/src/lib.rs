// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SPI master driver exposed as a byte-stream connection.
//!
//! The layering, bottom to top:
//!
//! - [`bus::SpiBus`] is the hardware: one full-duplex transaction per call.
//!   The host build ships [`bus::Loopback`].
//! - [`transfer::DmaChannel`] moves caller data through DMA buffers that are
//!   wiped after every transfer, and turns bus failures into
//!   [`transfer::TransferError`] codes.
//! - [`master`] is the task that runs one transfer per request, driven by a
//!   binary semaphore, with buffers guarded by a mutex.
//! - [`SpiConnection`] is what the runtime talks to: queue bytes, read back
//!   what the device answered, ask whether the line is idle.
//!
//! ```no_run
//! use llbsp_spi::{bus::Loopback, SpiConfig, SpiConnection};
//!
//! let conn = SpiConnection::initialize(SpiConfig::default(), Loopback)?;
//! conn.send_bytes(b"ping", 0, 4)?;
//! while !conn.is_transmission_complete() {}
//! while let Some(b) = conn.get_next_rx_data() {
//!     print!("{}", b as char);
//! }
//! # Ok::<(), llbsp_spi::CommError>(())
//! ```

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

pub mod bus;
pub mod config;
pub mod master;
pub mod transfer;

mod connection;

pub use config::{SpiConfig, SpiMode};
pub use connection::{CommError, SpiConnection};
pub use master::MasterState;
pub use transfer::TransferError;
