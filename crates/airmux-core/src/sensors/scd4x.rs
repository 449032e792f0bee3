use crate::sensors::{Co2Sensor, SensorError};

use embedded_hal::i2c::Error as _;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use log::debug;

/// Fixed I2C address of every SCD4x.
pub const SCD4X_ADDRESS: u8 = 0x62;

/// SCD4x command words.
pub mod commands {
    pub const MEASURE_SINGLE_SHOT: u16 = 0x219D;
    pub const READ_MEASUREMENT: u16 = 0xEC05;
    pub const GET_DATA_READY_STATUS: u16 = 0xE4B8;
    pub const GET_SERIAL_NUMBER: u16 = 0x3682;
    pub const SET_ASC_ENABLED: u16 = 0x2416;
    pub const GET_ASC_ENABLED: u16 = 0x2313;
    pub const SET_ASC_STANDARD_PERIOD: u16 = 0x244E;
    pub const GET_ASC_STANDARD_PERIOD: u16 = 0x234B;
    pub const PERSIST_SETTINGS: u16 = 0x3615;
    pub const REINIT: u16 = 0x3646;
    pub const WAKE_UP: u16 = 0x36F6;
    pub const POWER_DOWN: u16 = 0x36E0;
}

// Command execution times from the datasheet, in milliseconds.
const SINGLE_SHOT_MS: u32 = 5000;
const PERSIST_SETTINGS_MS: u32 = 800;
const REINIT_MS: u32 = 30;
const WAKE_UP_MS: u32 = 30;
const SHORT_COMMAND_MS: u32 = 1;

/// Sensirion CRC-8 (polynomial 0x31, init 0xFF) over one data word.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0xFF_u8;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// One decoded measurement frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub co2_ppm: u16,
    pub temperature_celsius: f32,
    pub humidity_percent: f32,
}

impl Measurement {
    fn from_words([co2, temperature, humidity]: [u16; 3]) -> Self {
        Self {
            co2_ppm: co2,
            temperature_celsius: -45.0 + 175.0 * temperature as f32 / 65535.0,
            humidity_percent: 100.0 * humidity as f32 / 65535.0,
        }
    }
}

/// SCD4x driver over an async I2C bus.
///
/// Measurement getters follow the data-ready protocol: each call checks the
/// data-ready flag and fetches a fresh frame when one is waiting, otherwise it
/// answers from the last frame read since the most recent trigger.
pub struct Scd4x<I, D> {
    i2c: I,
    delay: D,
    latest: Option<Measurement>,
}

impl<I: I2c, D: DelayNs> Scd4x<I, D> {
    pub fn new(i2c: I, delay: D) -> Self {
        Self {
            i2c,
            delay,
            latest: None,
        }
    }

    async fn send(
        &mut self,
        command: u16,
        operation: &'static str,
        execution_ms: u32,
    ) -> Result<(), SensorError> {
        self.i2c
            .write(SCD4X_ADDRESS, &command.to_be_bytes())
            .await
            .map_err(|e| SensorError::Bus {
                operation,
                kind: e.kind(),
            })?;
        self.delay.delay_ms(execution_ms).await;
        Ok(())
    }

    async fn send_with_argument(
        &mut self,
        command: u16,
        argument: u16,
        operation: &'static str,
        execution_ms: u32,
    ) -> Result<(), SensorError> {
        let [c0, c1] = command.to_be_bytes();
        let [a0, a1] = argument.to_be_bytes();
        let frame = [c0, c1, a0, a1, crc8(&[a0, a1])];
        self.i2c
            .write(SCD4X_ADDRESS, &frame)
            .await
            .map_err(|e| SensorError::Bus {
                operation,
                kind: e.kind(),
            })?;
        self.delay.delay_ms(execution_ms).await;
        Ok(())
    }

    async fn read_words<const N: usize>(
        &mut self,
        command: u16,
        operation: &'static str,
    ) -> Result<[u16; N], SensorError> {
        self.send(command, operation, SHORT_COMMAND_MS).await?;

        let mut buffer = [0_u8; 9];
        let frame = &mut buffer[..N * 3];
        self.i2c
            .read(SCD4X_ADDRESS, frame)
            .await
            .map_err(|e| SensorError::Bus {
                operation,
                kind: e.kind(),
            })?;

        let mut words = [0_u16; N];
        for (word, chunk) in words.iter_mut().zip(frame.chunks_exact(3)) {
            if crc8(&chunk[..2]) != chunk[2] {
                return Err(SensorError::Crc { operation });
            }
            *word = u16::from_be_bytes([chunk[0], chunk[1]]);
        }
        Ok(words)
    }

    pub async fn data_ready(&mut self) -> Result<bool, SensorError> {
        let [status] = self
            .read_words::<1>(commands::GET_DATA_READY_STATUS, "get data ready status")
            .await?;
        Ok(status & 0x07FF != 0)
    }

    pub async fn read_measurement(&mut self) -> Result<Measurement, SensorError> {
        let words = self
            .read_words::<3>(commands::READ_MEASUREMENT, "read measurement")
            .await?;
        Ok(Measurement::from_words(words))
    }

    async fn latest(&mut self) -> Result<Measurement, SensorError> {
        if self.data_ready().await? {
            let measurement = self.read_measurement().await?;
            debug!("SCD4x frame: {:?}", measurement);
            self.latest = Some(measurement);
        }
        self.latest.ok_or(SensorError::NotReady)
    }
}

impl<I: I2c, D: DelayNs> Co2Sensor for Scd4x<I, D> {
    async fn serial_number(&mut self) -> Result<u64, SensorError> {
        let [high, mid, low] = self
            .read_words::<3>(commands::GET_SERIAL_NUMBER, "get serial number")
            .await?;
        Ok(((high as u64) << 32) | ((mid as u64) << 16) | low as u64)
    }

    async fn self_calibration_enabled(&mut self) -> Result<bool, SensorError> {
        let [enabled] = self
            .read_words::<1>(commands::GET_ASC_ENABLED, "get automatic self calibration")
            .await?;
        Ok(enabled != 0)
    }

    async fn set_self_calibration_enabled(&mut self, enabled: bool) -> Result<(), SensorError> {
        self.send_with_argument(
            commands::SET_ASC_ENABLED,
            enabled as u16,
            "set automatic self calibration",
            SHORT_COMMAND_MS,
        )
        .await
    }

    async fn self_calibration_standard_period(&mut self) -> Result<u16, SensorError> {
        let [hours] = self
            .read_words::<1>(commands::GET_ASC_STANDARD_PERIOD, "get ASC standard period")
            .await?;
        Ok(hours)
    }

    async fn set_self_calibration_standard_period(&mut self, hours: u16) -> Result<(), SensorError> {
        self.send_with_argument(
            commands::SET_ASC_STANDARD_PERIOD,
            hours,
            "set ASC standard period",
            SHORT_COMMAND_MS,
        )
        .await
    }

    async fn persist_settings(&mut self) -> Result<(), SensorError> {
        self.send(commands::PERSIST_SETTINGS, "persist settings", PERSIST_SETTINGS_MS)
            .await
    }

    async fn reinit(&mut self) -> Result<(), SensorError> {
        self.send(commands::REINIT, "reinit", REINIT_MS).await
    }

    async fn wake_up(&mut self) -> Result<(), SensorError> {
        // The sensor does not acknowledge the wake-up command.
        let _ = self
            .i2c
            .write(SCD4X_ADDRESS, &commands::WAKE_UP.to_be_bytes())
            .await;
        self.delay.delay_ms(WAKE_UP_MS).await;
        Ok(())
    }

    async fn power_down(&mut self) -> Result<(), SensorError> {
        self.send(commands::POWER_DOWN, "power down", SHORT_COMMAND_MS)
            .await
    }

    async fn measure_single_shot(&mut self) -> Result<(), SensorError> {
        self.latest = None;
        self.send(
            commands::MEASURE_SINGLE_SHOT,
            "measure single shot",
            SINGLE_SHOT_MS,
        )
        .await
    }

    async fn temperature(&mut self) -> Result<f32, SensorError> {
        Ok(self.latest().await?.temperature_celsius)
    }

    async fn relative_humidity(&mut self) -> Result<f32, SensorError> {
        Ok(self.latest().await?.humidity_percent)
    }

    async fn co2(&mut self) -> Result<u16, SensorError> {
        Ok(self.latest().await?.co2_ppm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Fault, SimBus, SimDelay, SimScd4x};
    use embassy_futures::block_on;

    fn sensor_on_channel_zero(sim: SimScd4x) -> (SimBus, Scd4x<SimBus, SimDelay>) {
        let bus = SimBus::new(0x70);
        bus.attach(0, sim);
        bus.route(0x01);
        (bus.clone(), Scd4x::new(bus, SimDelay::new()))
    }

    #[test]
    fn crc_matches_datasheet_example() {
        assert_eq!(crc8(&[0xBE, 0xEF]), 0x92);
    }

    #[test]
    fn reads_serial_number() {
        let (_, mut sensor) = sensor_on_channel_zero(SimScd4x::new(0x1234_5678_9ABC));
        assert_eq!(block_on(sensor.serial_number()).unwrap(), 0x1234_5678_9ABC);
    }

    #[test]
    fn single_shot_produces_converted_readings() {
        let (_, mut sensor) =
            sensor_on_channel_zero(SimScd4x::new(1).with_readings(21.5, 45.0, 812));

        block_on(async {
            sensor.measure_single_shot().await.unwrap();
            let temperature = sensor.temperature().await.unwrap();
            let humidity = sensor.relative_humidity().await.unwrap();
            let co2 = sensor.co2().await.unwrap();

            assert!((temperature - 21.5).abs() < 0.01, "{temperature}");
            assert!((humidity - 45.0).abs() < 0.01, "{humidity}");
            assert_eq!(co2, 812);
        });
    }

    #[test]
    fn getters_fail_without_a_triggered_measurement() {
        let (_, mut sensor) = sensor_on_channel_zero(SimScd4x::new(1));
        assert_eq!(block_on(sensor.temperature()), Err(SensorError::NotReady));
    }

    #[test]
    fn corrupted_frame_is_rejected() {
        let (bus, mut sensor) = sensor_on_channel_zero(SimScd4x::new(1));
        bus.inject(0, Fault::corrupt(commands::GET_SERIAL_NUMBER));

        assert_eq!(
            block_on(sensor.serial_number()),
            Err(SensorError::Crc {
                operation: "get serial number"
            })
        );
    }

    #[test]
    fn wake_up_tolerates_missing_acknowledge() {
        let (bus, mut sensor) = sensor_on_channel_zero(SimScd4x::new(1));

        block_on(async {
            sensor.power_down().await.unwrap();
            assert!(sensor.measure_single_shot().await.is_err());
            sensor.wake_up().await.unwrap();
            sensor.measure_single_shot().await.unwrap();
        });
        assert_eq!(bus.command_count(0, commands::WAKE_UP), 1);
    }

    #[test]
    fn settings_round_trip_through_persist_and_reinit() {
        let (bus, mut sensor) = sensor_on_channel_zero(SimScd4x::new(1).with_asc(false, 156));

        block_on(async {
            sensor.set_self_calibration_enabled(true).await.unwrap();
            sensor.set_self_calibration_standard_period(624).await.unwrap();
            sensor.persist_settings().await.unwrap();
            sensor.reinit().await.unwrap();
            assert!(sensor.self_calibration_enabled().await.unwrap());
            assert_eq!(sensor.self_calibration_standard_period().await.unwrap(), 624);
        });
        assert_eq!(bus.persisted_asc(0), Some((true, 624)));
    }
}
