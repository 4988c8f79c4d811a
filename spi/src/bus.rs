// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hardware seam: a device that can clock bytes in and out.

use thiserror::Error;

/// A full-duplex SPI device.
///
/// One call is one transaction with chip select held: `tx.len()` bytes are
/// shifted out while the same number are shifted into `rx`. The driver always
/// passes slices of equal length.
pub trait SpiBus: Send {
    /// Performs one transaction.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError>;
}

impl<B: SpiBus + ?Sized> SpiBus for Box<B> {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        (**self).transfer(tx, rx)
    }
}

/// The bus refused or aborted a transaction.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("SPI bus error: {reason}")]
pub struct BusError {
    /// Driver's description of the failure.
    pub reason: String,
}

impl BusError {
    /// Creates an error with the given description.
    pub fn new(reason: impl Into<String>) -> Self {
        BusError {
            reason: reason.into(),
        }
    }
}

/// A bus with MISO wired to MOSI: every byte sent comes straight back.
///
/// This is what the host build runs against when there is no real device.
#[derive(Copy, Clone, Debug, Default)]
pub struct Loopback;

impl SpiBus for Loopback {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        if tx.len() != rx.len() {
            return Err(BusError::new("mismatched buffer lengths"));
        }
        rx.copy_from_slice(tx);
        Ok(())
    }
}
