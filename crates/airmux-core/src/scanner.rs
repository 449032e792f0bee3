//! Startup discovery of the multiplexer channels that carry a sensor

use embedded_hal_async::i2c::I2c;
use log::{debug, info, warn};

use crate::channel::{Channel, MAX_CHANNELS, OccupiedChannels};
use crate::mux::{self, SensorMux};

pub struct ChannelScanner {
    channel_count: u8,
}

impl ChannelScanner {
    pub fn new(channel_count: u8) -> Self {
        Self { channel_count }
    }

    /// Select each channel in turn and probe the address range behind it.
    ///
    /// A channel is occupied when anything other than the multiplexer itself
    /// acknowledges. A channel that cannot be selected is left out.
    pub async fn scan<I: I2c>(&self, mux: &mut SensorMux<I>) -> OccupiedChannels {
        let mut occupied = heapless::Vec::<Channel, MAX_CHANNELS>::new();
        let mux_address = mux.address();

        for channel in Channel::first(self.channel_count) {
            let mut segment = match mux.channel(channel) {
                Ok(segment) => segment,
                Err(e) => {
                    warn!("Skipping channel {}: {}", channel, e);
                    continue;
                }
            };
            info!("Scan channel {}", channel);

            let found = mux::scan(&mut segment).await;
            // The mux answers on every segment it managed to select.
            if found.is_empty() {
                warn!("Skipping channel {}: mux did not select it", channel);
                continue;
            }
            if found.iter().any(|&address| address != mux_address) {
                debug!("Channel {} responded at {:02x?}", channel, found.as_slice());
                // Channel::first never yields more than MAX_CHANNELS.
                let _ = occupied.push(channel);
            }
        }

        let occupied: OccupiedChannels = occupied.into_iter().collect();
        info!("Occupied channels {}", occupied);
        occupied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBus, SimScd4x};
    use embassy_futures::block_on;

    fn ch(index: u8) -> Channel {
        Channel::new(index).unwrap()
    }

    fn bus_with_sensors(channels: &[u8]) -> SimBus {
        let bus = SimBus::new(0x70);
        for &channel in channels {
            bus.attach(channel, SimScd4x::new(channel as u64));
        }
        bus
    }

    #[test]
    fn finds_sensors_in_ascending_order() {
        let bus = bus_with_sensors(&[6, 1, 3]);
        let mut mux = SensorMux::new(bus, 0x70);

        let occupied = block_on(ChannelScanner::new(8).scan(&mut mux));
        assert_eq!(occupied.as_slice(), &[ch(1), ch(3), ch(6)]);
    }

    #[test]
    fn unselectable_channel_is_not_occupied() {
        let bus = bus_with_sensors(&[2, 4]);
        bus.fail_select(2);
        let mut mux = SensorMux::new(bus, 0x70);

        let occupied = block_on(ChannelScanner::new(8).scan(&mut mux));
        assert_eq!(occupied.as_slice(), &[ch(4)]);
    }

    #[test]
    fn empty_bus_yields_no_channels() {
        let mut mux = SensorMux::new(SimBus::new(0x70), 0x70);
        assert!(block_on(ChannelScanner::new(8).scan(&mut mux)).is_empty());
    }

    #[test]
    fn only_the_configured_channel_range_is_scanned() {
        let bus = bus_with_sensors(&[1, 5]);
        let mut mux = SensorMux::new(bus, 0x70);

        let occupied = block_on(ChannelScanner::new(4).scan(&mut mux));
        assert_eq!(occupied.as_slice(), &[ch(1)]);
    }
}
