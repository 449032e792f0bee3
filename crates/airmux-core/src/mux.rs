//! Sensor segments behind the TCA9548A multiplexer
//!
//! Channel routing is done by `tca9548a-embedded`: [`SensorMux::channel`]
//! hands out the crate's per-channel bus, which mutably borrows the
//! multiplexer, so only one segment can be addressed at any point in time.
//! This module adds the multiplexer address and the address probe used to
//! find out what sits behind a segment.

use embedded_hal_async::i2c::I2c;
use log::{debug, warn};
use tca9548a_embedded::r#async::Tca9548aAsync;
use thiserror_no_std::Error;

use crate::channel::Channel;

/// First and last non-reserved 7-bit addresses probed during a scan.
pub const SCAN_ADDRESS_FIRST: u8 = 0x08;
pub const SCAN_ADDRESS_LAST: u8 = 0x77;

const SCAN_CAPACITY: usize = (SCAN_ADDRESS_LAST - SCAN_ADDRESS_FIRST + 1) as usize;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxError {
    #[error("mux refused channel {0}")]
    Channel(Channel),
}

pub struct SensorMux<I> {
    mux: Tca9548aAsync<I>,
    address: u8,
}

impl<I: I2c> SensorMux<I> {
    pub fn new(i2c: I, address: u8) -> Self {
        Self {
            mux: Tca9548aAsync::new(i2c, address),
            address,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Borrow the bus behind `channel`.
    ///
    /// The control register is written by the returned bus as part of its
    /// transactions, so a failed select surfaces as a bus error there.
    pub fn channel(&mut self, channel: Channel) -> Result<impl I2c + '_, MuxError> {
        self.mux.channel(channel.index()).map_err(|e| {
            warn!("Failed to select mux channel {}: {:?}", channel, e);
            MuxError::Channel(channel)
        })
    }
}

/// Address-only write; a device that acknowledges is present.
pub async fn probe<B: I2c>(bus: &mut B, address: u8) -> bool {
    bus.write(address, &[]).await.is_ok()
}

/// Every address in the non-reserved range that acknowledges a probe on
/// `bus`. Through a selected segment the multiplexer itself always answers.
pub async fn scan<B: I2c>(bus: &mut B) -> heapless::Vec<u8, SCAN_CAPACITY> {
    let mut found = heapless::Vec::new();
    for address in SCAN_ADDRESS_FIRST..=SCAN_ADDRESS_LAST {
        if probe(bus, address).await {
            debug!("Device responded at {:#04x}", address);
            // Capacity covers the whole probed range.
            let _ = found.push(address);
        }
    }
    found
}
