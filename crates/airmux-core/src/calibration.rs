//! One-time startup tuning of each sensor's automatic self-calibration
//!
//! The SCD4x assumes one measurement every five minutes when it derives its
//! self-calibration schedule. The agent samples each sensor several times per
//! cycle, so the standard period is stretched by the same factor.

use alloc::vec::Vec;

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use log::{info, warn};
use thiserror_no_std::Error;

use crate::channel::{Channel, OccupiedChannels};
use crate::mux::{MuxError, SensorMux};
use crate::sensors::{Co2Sensor, Scd4x, SensorError};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("{0}")]
    Select(MuxError),
    #[error("sensor on channel {channel} did not identify itself: {error}")]
    Identity { channel: Channel, error: SensorError },
    #[error("failed to {step} on channel {channel}: {error}")]
    Setting {
        channel: Channel,
        step: &'static str,
        error: SensorError,
    },
    #[error("sensor on channel {channel} did not keep its {setting} setting")]
    Verify {
        channel: Channel,
        setting: &'static str,
    },
}

impl CalibrationError {
    /// Errors that leave the agent without a usable sensor map.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Select(_) | Self::Identity { .. })
    }
}

/// What startup calibration changed on one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationReport {
    pub channel: Channel,
    pub serial: u64,
    /// ASC was found disabled and has been switched on.
    pub enabled_asc: bool,
    /// The ASC standard period differed and has been rewritten.
    pub updated_period: bool,
}

fn setting(channel: Channel, step: &'static str) -> impl FnOnce(SensorError) -> CalibrationError {
    move |error| CalibrationError::Setting {
        channel,
        step,
        error,
    }
}

pub struct SensorCalibrator {
    asc_standard_period_hours: u16,
}

impl SensorCalibrator {
    pub fn new(asc_standard_period_hours: u16) -> Self {
        Self {
            asc_standard_period_hours,
        }
    }

    /// Calibrate every occupied channel in ascending order.
    ///
    /// Stops at the first fatal error. Tuning failures are logged and the
    /// remaining channels are still calibrated.
    pub async fn calibrate_all<I: I2c, D: DelayNs>(
        &self,
        mux: &mut SensorMux<I>,
        delay: &mut D,
        occupied: &OccupiedChannels,
    ) -> Result<Vec<CalibrationReport>, CalibrationError> {
        let mut reports = Vec::with_capacity(occupied.len());
        for channel in occupied.iter() {
            let bus = mux.channel(channel).map_err(CalibrationError::Select)?;
            let mut sensor = Scd4x::new(bus, &mut *delay);
            reports.push(self.calibrate(channel, &mut sensor).await?);
        }
        Ok(reports)
    }

    /// Identify one sensor, tune its ASC settings, take a test measurement and
    /// put it to sleep. Only a failed identity check is returned as an error.
    pub async fn calibrate<S: Co2Sensor>(
        &self,
        channel: Channel,
        sensor: &mut S,
    ) -> Result<CalibrationReport, CalibrationError> {
        let identity = |error| CalibrationError::Identity { channel, error };
        sensor.wake_up().await.map_err(identity)?;
        let serial = sensor.serial_number().await.map_err(identity)?;
        info!("Channel {} sensor serial {:#014x}", channel, serial);

        let mut report = CalibrationReport {
            channel,
            serial,
            enabled_asc: false,
            updated_period: false,
        };

        match Self::ensure_asc_enabled(channel, sensor).await {
            Ok(changed) => report.enabled_asc = changed,
            Err(e) => warn!("{}", e),
        }
        match self.ensure_standard_period(channel, sensor).await {
            Ok(changed) => report.updated_period = changed,
            Err(e) => warn!("{}", e),
        }

        match Self::test_measurement(sensor).await {
            Ok((temperature, humidity, co2)) => info!(
                "Channel {} test measurement: {:.2} C, {:.2} %RH, {} ppm",
                channel, temperature, humidity, co2
            ),
            Err(e) => warn!("Test measurement on channel {} failed: {}", channel, e),
        }
        if let Err(e) = sensor.power_down().await {
            warn!("Failed to power down sensor on channel {}: {}", channel, e);
        }

        Ok(report)
    }

    async fn ensure_asc_enabled<S: Co2Sensor>(
        channel: Channel,
        sensor: &mut S,
    ) -> Result<bool, CalibrationError> {
        let enabled = sensor
            .self_calibration_enabled()
            .await
            .map_err(setting(channel, "read ASC state"))?;
        if enabled {
            return Ok(false);
        }

        info!("Enabling ASC on channel {}", channel);
        sensor
            .set_self_calibration_enabled(true)
            .await
            .map_err(setting(channel, "enable ASC"))?;
        Self::persist_and_reinit(channel, sensor).await?;

        let enabled = sensor
            .self_calibration_enabled()
            .await
            .map_err(setting(channel, "read back ASC state"))?;
        if !enabled {
            return Err(CalibrationError::Verify {
                channel,
                setting: "ASC enabled",
            });
        }
        Ok(true)
    }

    async fn ensure_standard_period<S: Co2Sensor>(
        &self,
        channel: Channel,
        sensor: &mut S,
    ) -> Result<bool, CalibrationError> {
        let target = self.asc_standard_period_hours;
        let current = sensor
            .self_calibration_standard_period()
            .await
            .map_err(setting(channel, "read ASC standard period"))?;
        if current == target {
            return Ok(false);
        }

        info!(
            "Changing ASC standard period on channel {} from {} h to {} h",
            channel, current, target
        );
        sensor
            .set_self_calibration_standard_period(target)
            .await
            .map_err(setting(channel, "set ASC standard period"))?;
        Self::persist_and_reinit(channel, sensor).await?;

        let current = sensor
            .self_calibration_standard_period()
            .await
            .map_err(setting(channel, "read back ASC standard period"))?;
        if current != target {
            return Err(CalibrationError::Verify {
                channel,
                setting: "ASC standard period",
            });
        }
        Ok(true)
    }

    async fn persist_and_reinit<S: Co2Sensor>(
        channel: Channel,
        sensor: &mut S,
    ) -> Result<(), CalibrationError> {
        sensor
            .persist_settings()
            .await
            .map_err(setting(channel, "persist settings"))?;
        sensor.reinit().await.map_err(setting(channel, "reinit"))
    }

    async fn test_measurement<S: Co2Sensor>(sensor: &mut S) -> Result<(f32, f32, u16), SensorError> {
        sensor.measure_single_shot().await?;
        let temperature = sensor.temperature().await?;
        let humidity = sensor.relative_humidity().await?;
        let co2 = sensor.co2().await?;
        Ok((temperature, humidity, co2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::commands;
    use crate::sim::{Fault, SimBus, SimDelay, SimScd4x};
    use embassy_futures::block_on;
    use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource};

    fn ch(index: u8) -> Channel {
        Channel::new(index).unwrap()
    }

    /// Records every call and models the live/persisted split of SCD4x settings.
    #[derive(Default)]
    struct FakeSensor {
        calls: Vec<&'static str>,
        live: (bool, u16),
        persisted: (bool, u16),
        persist_ignored: bool,
        serial_fails: bool,
    }

    impl FakeSensor {
        fn with_settings(enabled: bool, period: u16) -> Self {
            Self {
                live: (enabled, period),
                persisted: (enabled, period),
                ..Self::default()
            }
        }
    }

    const NACK: SensorError = SensorError::Bus {
        operation: "fake",
        kind: ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address),
    };

    impl Co2Sensor for FakeSensor {
        async fn serial_number(&mut self) -> Result<u64, SensorError> {
            self.calls.push("serial");
            if self.serial_fails { Err(NACK) } else { Ok(42) }
        }

        async fn self_calibration_enabled(&mut self) -> Result<bool, SensorError> {
            self.calls.push("get_asc");
            Ok(self.live.0)
        }

        async fn set_self_calibration_enabled(&mut self, enabled: bool) -> Result<(), SensorError> {
            self.calls.push("set_asc");
            self.live.0 = enabled;
            Ok(())
        }

        async fn self_calibration_standard_period(&mut self) -> Result<u16, SensorError> {
            self.calls.push("get_period");
            Ok(self.live.1)
        }

        async fn set_self_calibration_standard_period(&mut self, hours: u16) -> Result<(), SensorError> {
            self.calls.push("set_period");
            self.live.1 = hours;
            Ok(())
        }

        async fn persist_settings(&mut self) -> Result<(), SensorError> {
            self.calls.push("persist");
            if !self.persist_ignored {
                self.persisted = self.live;
            }
            Ok(())
        }

        async fn reinit(&mut self) -> Result<(), SensorError> {
            self.calls.push("reinit");
            self.live = self.persisted;
            Ok(())
        }

        async fn wake_up(&mut self) -> Result<(), SensorError> {
            self.calls.push("wake_up");
            Ok(())
        }

        async fn power_down(&mut self) -> Result<(), SensorError> {
            self.calls.push("power_down");
            Ok(())
        }

        async fn measure_single_shot(&mut self) -> Result<(), SensorError> {
            self.calls.push("measure");
            Ok(())
        }

        async fn temperature(&mut self) -> Result<f32, SensorError> {
            Ok(21.0)
        }

        async fn relative_humidity(&mut self) -> Result<f32, SensorError> {
            Ok(40.0)
        }

        async fn co2(&mut self) -> Result<u16, SensorError> {
            Ok(600)
        }
    }

    #[test]
    fn untuned_sensor_is_enabled_and_stretched_with_persist_before_reinit() {
        let mut sensor = FakeSensor::with_settings(false, 156);
        let report = block_on(SensorCalibrator::new(624).calibrate(ch(2), &mut sensor)).unwrap();

        assert_eq!(
            report,
            CalibrationReport {
                channel: ch(2),
                serial: 42,
                enabled_asc: true,
                updated_period: true,
            }
        );
        assert_eq!(
            sensor.calls,
            [
                "wake_up",
                "serial",
                "get_asc",
                "set_asc",
                "persist",
                "reinit",
                "get_asc",
                "get_period",
                "set_period",
                "persist",
                "reinit",
                "get_period",
                "measure",
                "power_down",
            ]
        );
        assert_eq!(sensor.persisted, (true, 624));
    }

    #[test]
    fn tuned_sensor_is_left_alone() {
        let mut sensor = FakeSensor::with_settings(true, 624);
        let report = block_on(SensorCalibrator::new(624).calibrate(ch(0), &mut sensor)).unwrap();

        assert!(!report.enabled_asc && !report.updated_period);
        assert!(!sensor.calls.contains(&"persist"));
        assert!(!sensor.calls.contains(&"set_asc"));
        assert!(!sensor.calls.contains(&"set_period"));
    }

    #[test]
    fn identity_failure_is_fatal() {
        let mut sensor = FakeSensor {
            serial_fails: true,
            ..FakeSensor::default()
        };
        let err = block_on(SensorCalibrator::new(624).calibrate(ch(5), &mut sensor)).unwrap_err();

        assert_eq!(
            err,
            CalibrationError::Identity {
                channel: ch(5),
                error: NACK
            }
        );
        assert!(err.is_fatal());
        assert_eq!(sensor.calls, ["wake_up", "serial"]);
    }

    #[test]
    fn unverified_setting_does_not_abort_calibration() {
        let mut sensor = FakeSensor {
            persist_ignored: true,
            ..FakeSensor::with_settings(false, 156)
        };
        let report = block_on(SensorCalibrator::new(624).calibrate(ch(1), &mut sensor)).unwrap();

        assert!(!report.enabled_asc);
        assert!(!report.updated_period);
        assert_eq!(sensor.calls.last(), Some(&"power_down"));
    }

    #[test]
    fn calibrates_every_occupied_sensor_over_the_bus() {
        let bus = SimBus::new(0x70);
        bus.attach(1, SimScd4x::new(0x11).with_asc(false, 156));
        bus.attach(3, SimScd4x::new(0x33).with_asc(true, 624));
        let mut mux = SensorMux::new(bus.clone(), 0x70);
        let occupied = [ch(1), ch(3)].into_iter().collect();

        let reports = block_on(SensorCalibrator::new(624).calibrate_all(
            &mut mux,
            &mut SimDelay::new(),
            &occupied,
        ))
        .unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].serial, 0x11);
        assert!(reports[0].enabled_asc && reports[0].updated_period);
        assert!(!reports[1].enabled_asc && !reports[1].updated_period);
        assert_eq!(bus.persisted_asc(1), Some((true, 624)));
        assert_eq!(bus.asc(1), Some((true, 624)));
        assert_eq!(bus.command_count(3, commands::PERSIST_SETTINGS), 0);
        assert_eq!(bus.is_asleep(1), Some(true));
        assert_eq!(bus.is_asleep(3), Some(true));
    }

    #[test]
    fn silent_sensor_stops_calibration() {
        let bus = SimBus::new(0x70);
        bus.attach(1, SimScd4x::new(0x11));
        bus.attach(4, SimScd4x::new(0x44));
        bus.set_responsive(1, false);
        let mut mux = SensorMux::new(bus.clone(), 0x70);
        let occupied = [ch(1), ch(4)].into_iter().collect();

        let err = block_on(SensorCalibrator::new(624).calibrate_all(
            &mut mux,
            &mut SimDelay::new(),
            &occupied,
        ))
        .unwrap_err();

        assert!(matches!(err, CalibrationError::Identity { channel, .. } if channel == ch(1)));
        assert_eq!(bus.command_count(4, commands::GET_SERIAL_NUMBER), 0);
    }

    #[test]
    fn failed_persist_is_logged_and_skipped() {
        let bus = SimBus::new(0x70);
        bus.attach(2, SimScd4x::new(0x22).with_asc(false, 156));
        bus.inject(2, Fault::nack(commands::PERSIST_SETTINGS));
        let mut mux = SensorMux::new(bus.clone(), 0x70);
        let occupied = [ch(2)].into_iter().collect();

        let reports = block_on(SensorCalibrator::new(624).calibrate_all(
            &mut mux,
            &mut SimDelay::new(),
            &occupied,
        ))
        .unwrap();

        // The enable step lost its persist; the period step went through.
        assert!(!reports[0].enabled_asc);
        assert!(reports[0].updated_period);
        assert_eq!(bus.persisted_asc(2), Some((true, 624)));
    }

    #[test]
    fn unselectable_channel_is_a_fatal_identity_failure() {
        let bus = SimBus::new(0x70);
        bus.attach(6, SimScd4x::new(0x66));
        bus.fail_select(6);
        let mut mux = SensorMux::new(bus, 0x70);
        let occupied = [ch(6)].into_iter().collect();

        let err = block_on(SensorCalibrator::new(624).calibrate_all(
            &mut mux,
            &mut SimDelay::new(),
            &occupied,
        ))
        .unwrap_err();
        assert!(matches!(err, CalibrationError::Identity { channel, .. } if channel == ch(6)));
        assert!(err.is_fatal());
    }
}
