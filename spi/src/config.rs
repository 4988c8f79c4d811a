// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Board configuration of the SPI master.

use llbsp::task::TaskConfig;
use static_assertions::const_assert;

/// Largest single DMA transfer, in bytes. Also the size of the connection's
/// receive and transmit buffers.
pub const COMM_SPI_MAX_DMA_LEN: usize = 4092;

/// Default bus clock.
pub const SPI_CLOCK_HZ: u32 = 5_000_000;

/// Default SPI host, 0-based (SPI2 on the board).
pub const SPI_HOST: u8 = 1;

// DMA descriptors move whole words.
const_assert!(COMM_SPI_MAX_DMA_LEN % 4 == 0);

/// Clock polarity and phase, as the usual mode number 0-3.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum SpiMode {
    /// CPOL 0, CPHA 0.
    #[default]
    Mode0,
    /// CPOL 0, CPHA 1.
    Mode1,
    /// CPOL 1, CPHA 0.
    Mode2,
    /// CPOL 1, CPHA 1.
    Mode3,
}

/// Everything needed to bring up the SPI master.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpiConfig {
    /// Hardware SPI host, 0-based.
    pub host: u8,
    /// Bus clock in Hz.
    pub clock_hz: u32,
    /// Clock mode.
    pub mode: SpiMode,
    /// Size of each buffer, and the longest transfer.
    pub max_dma_len: usize,
    /// The SPI master task.
    pub task: TaskConfig,
}

impl Default for SpiConfig {
    fn default() -> Self {
        SpiConfig {
            host: SPI_HOST,
            clock_hz: SPI_CLOCK_HZ,
            mode: SpiMode::Mode0,
            max_dma_len: COMM_SPI_MAX_DMA_LEN,
            task: TaskConfig::new("SPI Master", 7 * 1024, 9),
        }
    }
}
