use airmux_core::controller::DeviceReset;
use embassy_time::{Duration, block_for};
use log::warn;

/// Restarts the chip through a software reset.
pub struct EspReset;

impl DeviceReset for EspReset {
    fn reset(&mut self) -> ! {
        warn!("Restarting device");
        // Give the RTT host a moment to drain the log buffer.
        block_for(Duration::from_millis(100));
        esp_hal::system::software_reset()
    }
}
