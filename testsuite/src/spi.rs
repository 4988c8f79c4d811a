// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use llbsp::time::sleep_for;
use llbsp::{Millis, TickTime};
use llbsp_spi::bus::{BusError, Loopback, SpiBus};
use llbsp_spi::{MasterState, SpiConfig, SpiConnection};

/// Loopback that counts transactions.
#[derive(Clone, Default)]
struct Counting(Arc<AtomicUsize>);

impl SpiBus for Counting {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Loopback.transfer(tx, rx)
    }
}

fn config() -> SpiConfig {
    SpiConfig {
        max_dma_len: 16,
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

pub fn test_cycles_return_to_idle() {
    let bus = Counting::default();
    let transactions = Arc::clone(&bus.0);
    let conn = SpiConnection::initialize(config(), bus).unwrap();

    for (n, byte) in [0x10u8, 0x20, 0x30].into_iter().enumerate() {
        conn.send_data(byte).unwrap();
        settle(&conn);
        assert_eq!(conn.state(), MasterState::Idle);
        // One request, one transaction.
        assert_eq!(conn.cycles(), n as u64 + 1);
        assert_eq!(transactions.load(Ordering::SeqCst), n + 1);
        assert_eq!(conn.get_next_rx_data(), Some(byte));
    }
}

pub fn test_indices_reset_after_transmit() {
    let conn = SpiConnection::initialize(config(), Loopback).unwrap();
    let data: Vec<u8> = (1..=16).collect();
    // A full buffer fits exactly.
    conn.send_bytes(&data, 0, 16).unwrap();
    settle(&conn);
    assert_eq!(conn.rx_data_available(), 16);

    // The transmit emptied the queue, so another full buffer fits too.
    conn.send_bytes(&data, 0, 16).unwrap();
    settle(&conn);
    let echoed: Vec<u8> = std::iter::from_fn(|| conn.get_next_rx_data()).collect();
    assert_eq!(echoed, data);
    assert!(!conn.is_rx_data_available());
}

pub fn test_write_overwrites_unread_rx() {
    let conn = SpiConnection::initialize(config(), Loopback).unwrap();
    conn.send_bytes(b"abcd", 0, 4).unwrap();
    settle(&conn);
    assert_eq!(conn.get_next_rx_data(), Some(b'a'));

    conn.send_bytes(b"xy", 0, 2).unwrap();
    settle(&conn);
    assert_eq!(conn.rx_data_available(), 2);
    assert_eq!(conn.get_next_rx_data(), Some(b'x'));
    assert_eq!(conn.get_next_rx_data(), Some(b'y'));
    assert_eq!(conn.get_next_rx_data(), None);
}
