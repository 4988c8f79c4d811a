// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Low-level SPI transfers through DMA-capable buffers.
//!
//! Callers never hand their own memory to the bus. Each operation copies in
//! to the DMA transmit buffer, runs one transaction, copies out of the DMA
//! receive buffer, and then zeroes both buffers so no payload outlives the
//! transfer. The zeroing happens on every exit path.

use scopeguard::guard;
use thiserror::Error;

use crate::bus::SpiBus;

/// Why a transfer did not happen.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum TransferError {
    /// Nothing to transfer, or more than fits in the DMA buffers.
    #[error("transfer size not supported")]
    Undefined,
    /// The bus failed during the transaction.
    #[error("transfer cancelled by the bus")]
    Cancelled,
}

impl TransferError {
    /// Native status code.
    pub fn code(&self) -> i32 {
        match self {
            TransferError::Undefined => -0xFF,
            TransferError::Cancelled => -0x42,
        }
    }
}

/// A bus together with its pair of DMA buffers.
#[derive(Debug)]
pub struct DmaChannel<B> {
    bus: B,
    tx: Box<[u8]>,
    rx: Box<[u8]>,
}

impl<B: SpiBus> DmaChannel<B> {
    /// Allocates `max_len`-byte buffers for `bus`.
    pub fn new(bus: B, max_len: usize) -> Self {
        DmaChannel {
            bus,
            tx: vec![0; max_len].into_boxed_slice(),
            rx: vec![0; max_len].into_boxed_slice(),
        }
    }

    /// Longest transfer this channel can do.
    pub fn max_len(&self) -> usize {
        self.tx.len()
    }

    /// Sends `src`, discarding whatever comes back. Returns the number of
    /// bytes sent.
    pub fn write(&mut self, src: &[u8]) -> Result<usize, TransferError> {
        self.run("write", src.len(), |tx, _| tx.copy_from_slice(src), |_| ())
    }

    /// Clocks `dst.len()` bytes in (sending zeros) and stores them in `dst`.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize, TransferError> {
        self.run("read", dst.len(), |_, _| (), |rx| dst.copy_from_slice(rx))
    }

    /// Sends `src` while receiving the same number of bytes into `dst`.
    ///
    /// `dst` must be at least as long as `src`; only its first `src.len()`
    /// bytes are written.
    pub fn transmit(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, TransferError> {
        let Some(dst) = dst.get_mut(..src.len()) else {
            log::warn!("SPI transmit: receive buffer shorter than {} bytes", src.len());
            return Err(TransferError::Undefined);
        };
        self.run("transmit", src.len(), |tx, _| tx.copy_from_slice(src), |rx| dst.copy_from_slice(rx))
    }

    fn run(
        &mut self,
        what: &str,
        size: usize,
        fill: impl FnOnce(&mut [u8], &mut [u8]),
        drain: impl FnOnce(&[u8]),
    ) -> Result<usize, TransferError> {
        if size == 0 {
            log::warn!("SPI {}: asked to transfer 0 bytes", what);
            return Err(TransferError::Undefined);
        }
        if size > self.max_len() {
            log::warn!("SPI {}: {} bytes exceeds DMA limit of {}", what, size, self.max_len());
            return Err(TransferError::Undefined);
        }

        let mut bufs = guard((&mut self.tx[..size], &mut self.rx[..size]), |(tx, rx)| {
            tx.fill(0);
            rx.fill(0);
        });
        let (tx, rx) = &mut *bufs;
        fill(&mut tx[..], &mut rx[..]);
        if let Err(e) = self.bus.transfer(&tx[..], &mut rx[..]) {
            log::error!("SPI {} of {} bytes failed: {}", what, size, e);
            return Err(TransferError::Cancelled);
        }
        drain(&rx[..]);
        Ok(size)
    }

    #[cfg(test)]
    fn buffers_clear(&self) -> bool {
        self.tx.iter().chain(self.rx.iter()).all(|&b| b == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, Loopback};

    /// Answers every transaction with a fixed byte and remembers what it saw.
    #[derive(Default)]
    struct Fixed {
        answer: u8,
        fail: bool,
        seen: Vec<Vec<u8>>,
    }

    impl SpiBus for Fixed {
        fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
            self.seen.push(tx.to_vec());
            if self.fail {
                return Err(BusError::new("injected"));
            }
            rx.fill(self.answer);
            Ok(())
        }
    }

    #[test]
    fn test_write_sends_and_clears() {
        let mut ch = DmaChannel::new(Fixed::default(), 8);
        assert_eq!(ch.write(&[1, 2, 3]), Ok(3));
        assert_eq!(ch.bus.seen, vec![vec![1, 2, 3]]);
        assert!(ch.buffers_clear());
    }

    #[test]
    fn test_read_sends_zeros() {
        let mut ch = DmaChannel::new(
            Fixed {
                answer: 0xA5,
                ..Fixed::default()
            },
            8,
        );
        let mut dst = [0; 4];
        assert_eq!(ch.read(&mut dst), Ok(4));
        assert_eq!(dst, [0xA5; 4]);
        assert_eq!(ch.bus.seen, vec![vec![0; 4]]);
        assert!(ch.buffers_clear());
    }

    #[test]
    fn test_transmit_loopback() {
        let mut ch = DmaChannel::new(Loopback, 8);
        let mut dst = [0; 6];
        assert_eq!(ch.transmit(&[9, 8, 7], &mut dst), Ok(3));
        assert_eq!(dst, [9, 8, 7, 0, 0, 0]);
        assert!(ch.buffers_clear());
    }

    #[test]
    fn test_bad_sizes_are_undefined() {
        let mut ch = DmaChannel::new(Loopback, 4);
        assert_eq!(ch.write(&[]), Err(TransferError::Undefined));
        assert_eq!(ch.write(&[0; 5]), Err(TransferError::Undefined));
        assert_eq!(ch.transmit(&[1, 2], &mut [0; 1]), Err(TransferError::Undefined));
        assert_eq!(TransferError::Undefined.code(), -0xFF);
    }

    #[test]
    fn test_bus_failure_cancels_and_clears() {
        let mut ch = DmaChannel::new(
            Fixed {
                fail: true,
                ..Fixed::default()
            },
            8,
        );
        assert_eq!(ch.write(&[1, 2]), Err(TransferError::Cancelled));
        assert_eq!(TransferError::Cancelled.code(), -0x42);
        assert!(ch.buffers_clear());
    }
}
