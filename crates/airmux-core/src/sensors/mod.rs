mod scd4x;

use embedded_hal::i2c::ErrorKind;
use thiserror_no_std::Error;

pub use scd4x::*;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("I2C error during {operation}: {kind:?}")]
    Bus {
        operation: &'static str,
        kind: ErrorKind,
    },
    #[error("CRC mismatch in response to {operation}")]
    Crc { operation: &'static str },
    #[error("no measurement available")]
    NotReady,
}

/// Capability surface of a CO2/climate sensor on the currently selected
/// multiplexer channel.
///
/// Settings written with the `set_*` methods only survive a power cycle after
/// [`Co2Sensor::persist_settings`], and only take effect in the running
/// firmware after [`Co2Sensor::reinit`].
pub trait Co2Sensor {
    /// Factory serial number. Used as the identity check at startup.
    fn serial_number(&mut self) -> impl Future<Output = Result<u64, SensorError>>;

    fn self_calibration_enabled(&mut self) -> impl Future<Output = Result<bool, SensorError>>;

    fn set_self_calibration_enabled(
        &mut self,
        enabled: bool,
    ) -> impl Future<Output = Result<(), SensorError>>;

    /// Automatic self-calibration standard period, in hours.
    fn self_calibration_standard_period(
        &mut self,
    ) -> impl Future<Output = Result<u16, SensorError>>;

    fn set_self_calibration_standard_period(
        &mut self,
        hours: u16,
    ) -> impl Future<Output = Result<(), SensorError>>;

    fn persist_settings(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    fn reinit(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    fn wake_up(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    fn power_down(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    /// Trigger one measurement and wait for it to complete.
    fn measure_single_shot(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    /// Temperature of the latest measurement, in degrees Celsius.
    fn temperature(&mut self) -> impl Future<Output = Result<f32, SensorError>>;

    /// Relative humidity of the latest measurement, in percent.
    fn relative_humidity(&mut self) -> impl Future<Output = Result<f32, SensorError>>;

    /// CO2 concentration of the latest measurement, in ppm.
    fn co2(&mut self) -> impl Future<Output = Result<u16, SensorError>>;
}
