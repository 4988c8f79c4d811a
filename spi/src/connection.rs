// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-stream connection on top of the SPI master.
//!
//! The connection is full-duplex underneath: every byte sent is a byte
//! received. Sending queues bytes and asks the master task for a transmit
//! cycle; whatever the device clocked back during that cycle becomes the
//! receive data. A later send overwrites received bytes that haven't been
//! read yet. There is no separate half-duplex read path apart from
//! [`SpiConnection::request_read`].

use std::sync::Arc;

use llbsp::task::Task;
use thiserror::Error;

use crate::bus::SpiBus;
use crate::config::SpiConfig;
use crate::master::{Buffers, Driver, MasterState};
use crate::transfer::TransferError;

/// Why a connection operation failed.
#[derive(Debug, Error)]
pub enum CommError {
    /// The data doesn't fit in what's left of the transmit buffer.
    #[error("transmit buffer overflow ({requested} bytes requested, {free} free)")]
    TransmissionError {
        /// Bytes the caller tried to queue.
        requested: usize,
        /// Bytes still free in the buffer.
        free: usize,
    },
    /// Offset and length don't describe a range of the caller's buffer, or
    /// the configuration is unusable.
    #[error("invalid arguments")]
    InvalidArgs,
    /// The connection has been shut down.
    #[error("SPI connection is closed")]
    Closed,
    /// The master task could not be started or stopped.
    #[error(transparent)]
    Osal(#[from] llbsp::OsalError),
}

/// An SPI master exposed as a communication connection.
#[derive(Debug)]
pub struct SpiConnection<B: SpiBus + 'static> {
    config: SpiConfig,
    driver: Arc<Driver<B>>,
    task: Option<Task>,
}

impl<B: SpiBus + 'static> SpiConnection<B> {
    /// Sets up the buffers and starts the SPI master task on `bus`.
    pub fn initialize(config: SpiConfig, bus: B) -> Result<Self, CommError> {
        if config.max_dma_len == 0 {
            return Err(CommError::InvalidArgs);
        }
        let driver = Arc::new(Driver::new(bus, config.max_dma_len));
        let task_driver = Arc::clone(&driver);
        let task = Task::spawn(&config.task, move || task_driver.run())?;
        log::info!(
            "SPI master on host {} ({} Hz, {:?}, {} byte buffers)",
            config.host,
            config.clock_hz,
            config.mode,
            config.max_dma_len,
        );
        Ok(SpiConnection {
            config,
            driver,
            task: Some(task),
        })
    }

    /// Number the runtime uses to open this connection: the SPI host,
    /// 1-based.
    pub fn platform_id(&self) -> i32 {
        i32::from(self.config.host) + 1
    }

    /// Connections of this kind are opened by platform id only.
    pub fn name(&self) -> Option<&str> {
        None
    }

    /// Serial line settings mean nothing on SPI; accepted and ignored.
    pub fn configure_device(&self, baudrate: u32, bits_per_char: u8, stop_bits: u8, parity: u8) {
        log::debug!(
            "SPI connection ignores device settings ({} baud, {} bits, {} stop, parity {})",
            baudrate,
            bits_per_char,
            stop_bits,
            parity,
        );
    }

    /// Queues one byte and starts a transmit cycle.
    pub fn send_data(&self, byte: u8) -> Result<(), CommError> {
        self.queue(&[byte])
    }

    /// Queues `buffer[offset..offset + len]` and starts a transmit cycle.
    pub fn send_bytes(&self, buffer: &[u8], offset: usize, len: usize) -> Result<(), CommError> {
        let bytes = offset
            .checked_add(len)
            .and_then(|end| buffer.get(offset..end))
            .ok_or(CommError::InvalidArgs)?;
        self.queue(bytes)
    }

    fn queue(&self, bytes: &[u8]) -> Result<(), CommError> {
        self.submit(MasterState::TransmitData, |b| {
            let free = b.tx.len() - b.write_index;
            if bytes.len() > free {
                log::warn!("SPI connection: {} bytes don't fit ({} free)", bytes.len(), free);
                return Err(CommError::TransmissionError {
                    requested: bytes.len(),
                    free,
                });
            }
            b.tx[b.write_index..b.write_index + bytes.len()].copy_from_slice(bytes);
            b.write_index += bytes.len();
            Ok(())
        })
    }

    /// Asks the master task to clock in `len` bytes without sending data.
    /// They become available once the cycle completes.
    ///
    /// If a send is still waiting for its cycle, this waits for it to finish
    /// first.
    pub fn request_read(&self, len: usize) -> Result<(), CommError> {
        self.submit(MasterState::ReadData, |b| {
            if len == 0 || len > b.rx.len() {
                return Err(CommError::InvalidArgs);
            }
            b.read_index = len;
            b.available = 0;
            Ok(())
        })
    }

    /// Asks the master task to send the queued bytes, keeping the current
    /// receive data.
    pub fn request_write(&self) -> Result<(), CommError> {
        self.submit(MasterState::WriteData, |b| {
            if b.write_index == 0 {
                return Err(CommError::InvalidArgs);
            }
            Ok(())
        })
    }

    /// Runs `prepare` on the buffers and hands the task a `next` cycle.
    ///
    /// A request joins a pending cycle only if it is a send joining a send;
    /// the bytes go out together in one transfer. Otherwise it waits until
    /// the task is idle, so a pending transfer is never replaced.
    fn submit(
        &self,
        next: MasterState,
        mut prepare: impl FnMut(&mut Buffers<B>) -> Result<(), CommError>,
    ) -> Result<(), CommError> {
        loop {
            self.check_running()?;
            if self.driver.is_stopping() {
                return Err(CommError::Closed);
            }
            let submitted = self.driver.pending.perform(|b| {
                let current = self.driver.state();
                let joins = current == MasterState::TransmitData && next == MasterState::TransmitData;
                if current != MasterState::Idle && !joins {
                    return Ok::<bool, CommError>(false);
                }
                prepare(b)?;
                self.driver.set_state(b, next);
                Ok(true)
            })?;
            if submitted {
                self.driver.kick();
                return Ok(());
            }
            log::trace!("SPI connection: {:?} waits for the pending cycle", next);
            self.driver.wait_cycle_done();
        }
    }

    /// Takes the next received byte, if any.
    pub fn get_next_rx_data(&self) -> Option<u8> {
        self.driver.pending.perform(|b| {
            if b.available == 0 {
                return None;
            }
            let byte = b.rx.get(b.read_index).copied()?;
            b.read_index += 1;
            b.available -= 1;
            Some(byte)
        })
    }

    /// Number of received bytes not yet taken.
    pub fn rx_data_available(&self) -> usize {
        self.driver.pending.perform(|b| b.available)
    }

    /// Checks whether any received byte is waiting.
    pub fn is_rx_data_available(&self) -> bool {
        self.rx_data_available() > 0
    }

    /// Checks whether the master task has finished every requested cycle.
    ///
    /// Waits for a cycle in progress to finish before answering.
    pub fn is_transmission_complete(&self) -> bool {
        self.driver
            .pending
            .perform(|_| self.driver.state() == MasterState::Idle)
    }

    /// Zeroes the receive buffer.
    pub fn initialize_rx_data(&self) {
        self.driver.pending.perform(|b| b.rx.fill(0));
    }

    /// Zeroes the transmit buffer.
    pub fn initialize_tx_data(&self) {
        self.driver.pending.perform(|b| b.tx.fill(0));
    }

    /// What the master task is doing now.
    pub fn state(&self) -> MasterState {
        self.driver.state()
    }

    /// Number of cycles the master task has completed.
    pub fn cycles(&self) -> u64 {
        self.driver.cycles()
    }

    /// Outcome of the most recent cycle.
    pub fn last_transfer(&self) -> Option<Result<usize, TransferError>> {
        self.driver.pending.perform(|b| b.last)
    }

    /// Configuration the connection was started with.
    pub fn config(&self) -> &SpiConfig {
        &self.config
    }

    /// Stops the master task once its current cycle is done.
    pub fn shutdown(&mut self) -> Result<(), CommError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        self.driver.stop();
        task.join()?;
        log::info!("SPI master stopped after {} cycle(s)", self.driver.cycles());
        Ok(())
    }

    fn check_running(&self) -> Result<(), CommError> {
        if self.task.is_some() {
            Ok(())
        } else {
            Err(CommError::Closed)
        }
    }
}

impl<B: SpiBus + 'static> Drop for SpiConnection<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("SPI connection: shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, Loopback};
    use llbsp::time::sleep_for;
    use llbsp::{Millis, TickTime};

    fn small() -> SpiConfig {
        SpiConfig {
            max_dma_len: 8,
            ..SpiConfig::default()
        }
    }

    fn settle<B: SpiBus>(conn: &SpiConnection<B>) {
        let start = TickTime::now();
        while !conn.is_transmission_complete() {
            assert!(start.elapsed() < Millis(2_000), "SPI master never went idle");
            sleep_for(Millis(1));
        }
    }

    #[test]
    fn test_identity() {
        let conn = SpiConnection::initialize(SpiConfig::default(), Loopback).unwrap();
        assert_eq!(conn.platform_id(), 2);
        assert_eq!(conn.name(), None);
        conn.configure_device(115_200, 8, 1, 0);
        assert_eq!(conn.state(), MasterState::Idle);
    }

    #[test]
    fn test_send_then_receive_echo() {
        let conn = SpiConnection::initialize(small(), Loopback).unwrap();
        conn.send_bytes(&[0, 1, 2, 3, 4], 1, 3).unwrap();
        settle(&conn);
        assert_eq!(conn.rx_data_available(), 3);
        assert_eq!(conn.get_next_rx_data(), Some(1));
        assert_eq!(conn.get_next_rx_data(), Some(2));
        assert_eq!(conn.get_next_rx_data(), Some(3));
        assert_eq!(conn.get_next_rx_data(), None);
        assert_eq!(conn.last_transfer(), Some(Ok(3)));
    }

    #[test]
    fn test_new_send_overwrites_unread_data() {
        let conn = SpiConnection::initialize(small(), Loopback).unwrap();
        conn.send_bytes(&[1, 2], 0, 2).unwrap();
        settle(&conn);
        assert_eq!(conn.get_next_rx_data(), Some(1));
        conn.send_data(9).unwrap();
        settle(&conn);
        assert_eq!(conn.get_next_rx_data(), Some(9));
        assert!(!conn.is_rx_data_available());
    }

    #[test]
    fn test_overflow_is_transmission_error() {
        let conn = SpiConnection::initialize(small(), Loopback).unwrap();
        let e = conn.send_bytes(&[0; 9], 0, 9).unwrap_err();
        assert!(matches!(e, CommError::TransmissionError { requested: 9, free: 8 }));
        assert!(matches!(conn.send_bytes(&[0; 4], 2, 3), Err(CommError::InvalidArgs)));
        assert_eq!(conn.cycles(), 0);
    }

    #[test]
    fn test_bus_failure_is_reported() {
        struct Broken;
        impl SpiBus for Broken {
            fn transfer(&mut self, _: &[u8], _: &mut [u8]) -> Result<(), BusError> {
                Err(BusError::new("no device"))
            }
        }
        let conn = SpiConnection::initialize(small(), Broken).unwrap();
        conn.send_data(1).unwrap();
        settle(&conn);
        assert_eq!(conn.last_transfer(), Some(Err(TransferError::Cancelled)));
        assert_eq!(conn.get_next_rx_data(), None);
    }

    #[test]
    fn test_request_read() {
        let conn = SpiConnection::initialize(small(), Loopback).unwrap();
        assert!(matches!(conn.request_read(0), Err(CommError::InvalidArgs)));
        assert!(matches!(conn.request_write(), Err(CommError::InvalidArgs)));
        conn.request_read(4).unwrap();
        settle(&conn);
        // Loopback of the zeros a read clocks out.
        assert_eq!(conn.rx_data_available(), 4);
        assert_eq!(conn.get_next_rx_data(), Some(0));
    }

    /// Loopback that remembers what every transaction clocked out.
    #[derive(Clone, Default)]
    struct Recording(Arc<llbsp::mutex::Mutex<Vec<Vec<u8>>>>);

    impl Recording {
        fn take(&self) -> Vec<Vec<u8>> {
            self.0.perform(std::mem::take)
        }
    }

    impl SpiBus for Recording {
        fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
            self.0.perform(|seen| seen.push(tx.to_vec()));
            Loopback.transfer(tx, rx)
        }
    }

    #[test]
    fn test_read_request_waits_for_queued_send() {
        let bus = Recording::default();
        let conn = SpiConnection::initialize(small(), bus.clone()).unwrap();
        for round in 1..=20u64 {
            conn.send_data(0xAB).unwrap();
            conn.request_read(4).unwrap();
            settle(&conn);
            assert_eq!(bus.take(), vec![vec![0xAB], vec![0; 4]], "round {}", round);
            assert_eq!(conn.rx_data_available(), 4);
            assert_eq!(conn.cycles(), 2 * round);
        }
    }

    #[test]
    fn test_send_waits_for_requested_read() {
        let bus = Recording::default();
        let conn = SpiConnection::initialize(small(), bus.clone()).unwrap();
        for round in 1..=20u64 {
            conn.request_read(4).unwrap();
            conn.send_data(0xCD).unwrap();
            settle(&conn);
            assert_eq!(bus.take(), vec![vec![0; 4], vec![0xCD]], "round {}", round);
            assert_eq!(conn.get_next_rx_data(), Some(0xCD));
            assert_eq!(conn.get_next_rx_data(), None);
            assert_eq!(conn.cycles(), 2 * round);
        }
    }

    #[test]
    fn test_shutdown_refuses_work() {
        let mut conn = SpiConnection::initialize(small(), Loopback).unwrap();
        conn.shutdown().unwrap();
        assert!(matches!(conn.send_data(1), Err(CommError::Closed)));
        conn.shutdown().unwrap();
    }
}
