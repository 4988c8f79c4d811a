// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SPI master task and the state it shares with the connection API.
//!
//! The task is a small state machine. In [`MasterState::Idle`] it sleeps on
//! the transfer-ready semaphore. Callers prepare a transfer under the
//! transfer-pending mutex, store the next state, and release the semaphore.
//! The task then performs exactly one transfer for that state, with the mutex
//! held for the duration, and goes back to idle.
//!
//! The state is an atomic so it can be peeked without the lock, but it is
//! only ever written with the mutex held. A request never overwrites a
//! different pending state: it waits on the end-of-cycle semaphore until the
//! task is back in idle.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use llbsp::mutex::Mutex;
use llbsp::semaphore::Semaphore;
use llbsp::{Millis, Timeout};

use crate::bus::SpiBus;
use crate::transfer::{DmaChannel, TransferError};

/// What the master task does next.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MasterState {
    /// Waiting for work.
    Idle = 0,
    /// Clock in `read_index` bytes.
    ReadData = 1,
    /// Clock out the pending transmit bytes, ignoring what comes back.
    WriteData = 2,
    /// Clock out the pending transmit bytes and keep what comes back.
    TransmitData = 3,
}

impl MasterState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => MasterState::ReadData,
            2 => MasterState::WriteData,
            3 => MasterState::TransmitData,
            _ => MasterState::Idle,
        }
    }
}

/// Buffers and cursors, guarded by the transfer-pending mutex.
#[derive(Debug)]
pub(crate) struct Buffers<B> {
    pub(crate) dma: DmaChannel<B>,
    pub(crate) tx: Box<[u8]>,
    pub(crate) rx: Box<[u8]>,
    /// Bytes queued in `tx`.
    pub(crate) write_index: usize,
    /// Next byte of `rx` to hand out, or, before a read cycle, how many bytes
    /// to read.
    pub(crate) read_index: usize,
    /// Bytes of `rx` not yet handed out.
    pub(crate) available: usize,
    /// Result of the most recent cycle.
    pub(crate) last: Option<Result<usize, TransferError>>,
}

/// State shared between the connection and its task.
#[derive(Debug)]
pub(crate) struct Driver<B> {
    state: AtomicU8,
    pub(crate) pending: Mutex<Buffers<B>>,
    ready: Semaphore,
    /// Released at the end of every cycle.
    cycle_done: Semaphore,
    stopping: AtomicBool,
    cycles: AtomicU64,
}

impl<B: SpiBus> Driver<B> {
    pub(crate) fn new(bus: B, buffer_len: usize) -> Self {
        Driver {
            state: AtomicU8::new(MasterState::Idle as u8),
            pending: Mutex::new(Buffers {
                dma: DmaChannel::new(bus, buffer_len),
                tx: vec![0; buffer_len].into_boxed_slice(),
                rx: vec![0; buffer_len].into_boxed_slice(),
                write_index: 0,
                read_index: 0,
                available: 0,
                last: None,
            }),
            ready: Semaphore::binary(),
            cycle_done: Semaphore::binary(),
            stopping: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> MasterState {
        MasterState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Stores the next state. Callers hold `pending`, which the `_held`
    /// borrow stands witness to.
    pub(crate) fn set_state(&self, _held: &Buffers<B>, state: MasterState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Wakes the task.
    pub(crate) fn kick(&self) {
        self.ready.release();
    }

    /// Blocks until the task finishes a cycle, or a short while has passed.
    /// Callers re-check the state afterwards; several of them may be waiting
    /// on one signal.
    pub(crate) fn wait_cycle_done(&self) {
        let _ = self.cycle_done.acquire(Timeout::After(Millis(10)));
    }

    /// Checks whether [`Driver::stop`] has been called.
    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.kick();
    }

    /// Body of the SPI master task. Returns after [`Driver::stop`].
    pub(crate) fn run(&self) {
        log::debug!("SPI master task running");
        loop {
            if self.is_stopping() {
                break;
            }
            if self.state() == MasterState::Idle {
                log::trace!("SPI master: idle");
                if let Err(e) = self.ready.acquire(Timeout::Forever) {
                    log::error!("SPI master: cannot wait for work: {}", e);
                }
                continue;
            }
            self.pending.perform(|b| {
                // Re-read under the lock.
                let state = self.state();
                if state == MasterState::Idle {
                    return;
                }
                let result = cycle(b, state);
                if let Err(e) = result {
                    log::warn!("SPI master: {:?} cycle failed: {}", state, e);
                }
                b.last = Some(result);
                self.set_state(b, MasterState::Idle);
                self.cycles.fetch_add(1, Ordering::Relaxed);
            });
            self.cycle_done.release();
        }
    }
}

/// Performs the one transfer `state` calls for and updates the cursors.
fn cycle<B: SpiBus>(b: &mut Buffers<B>, state: MasterState) -> Result<usize, TransferError> {
    log::trace!("SPI master: {:?}", state);
    match state {
        MasterState::Idle => Ok(0),
        MasterState::ReadData => {
            let len = b.read_index.min(b.rx.len());
            let r = b.dma.read(&mut b.rx[..len]);
            b.read_index = 0;
            b.available = r.unwrap_or(0);
            r
        }
        MasterState::WriteData => {
            let r = b.dma.write(&b.tx[..b.write_index]);
            b.write_index = 0;
            r
        }
        MasterState::TransmitData => {
            let r = b.dma.transmit(&b.tx[..b.write_index], &mut b.rx);
            b.available = r.unwrap_or(0);
            b.write_index = 0;
            b.read_index = 0;
            r
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Loopback;

    fn driver() -> Driver<Loopback> {
        Driver::new(Loopback, 16)
    }

    #[test]
    fn test_state_round_trip() {
        for s in [
            MasterState::Idle,
            MasterState::ReadData,
            MasterState::WriteData,
            MasterState::TransmitData,
        ] {
            assert_eq!(MasterState::from_u8(s as u8), s);
        }
    }

    #[test]
    fn test_transmit_cycle_makes_data_available() {
        let d = driver();
        let mut b = d.pending.lock();
        b.tx[..3].copy_from_slice(&[4, 5, 6]);
        b.write_index = 3;
        b.read_index = 2;
        assert_eq!(cycle(&mut *b, MasterState::TransmitData), Ok(3));
        assert_eq!((b.write_index, b.read_index, b.available), (0, 0, 3));
        assert_eq!(&b.rx[..3], &[4, 5, 6]);
    }

    #[test]
    fn test_write_cycle_keeps_rx() {
        let d = driver();
        let mut b = d.pending.lock();
        b.rx[0] = 0x11;
        b.available = 1;
        b.tx[0] = 0x22;
        b.write_index = 1;
        assert_eq!(cycle(&mut *b, MasterState::WriteData), Ok(1));
        assert_eq!((b.write_index, b.available, b.rx[0]), (0, 1, 0x11));
    }

    #[test]
    fn test_empty_cycles_are_undefined() {
        let d = driver();
        let mut b = d.pending.lock();
        assert_eq!(cycle(&mut *b, MasterState::WriteData), Err(TransferError::Undefined));
        assert_eq!(cycle(&mut *b, MasterState::ReadData), Err(TransferError::Undefined));
        assert_eq!(b.available, 0);
    }
}
