//! Multi-pass sampling of every occupied channel

use alloc::vec::Vec;

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use log::{debug, info, warn};
use thiserror_no_std::Error;

use crate::channel::{Channel, OccupiedChannels};
use crate::mux::{MuxError, SensorMux};
use crate::sensors::{Co2Sensor, Scd4x, SensorError};

/// Upper bound on passes per cycle; sizes the per-metric sample buffers.
pub const MAX_PASSES: usize = 8;

/// One channel's raw readings for one cycle, at most one entry per pass per metric.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleSet {
    pub temperature: heapless::Vec<f32, MAX_PASSES>,
    pub humidity: heapless::Vec<f32, MAX_PASSES>,
    pub co2: heapless::Vec<f32, MAX_PASSES>,
}

impl SampleSet {
    /// Total readings across the three metrics.
    pub fn entry_count(&self) -> usize {
        self.temperature.len() + self.humidity.len() + self.co2.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSamples {
    pub channel: Channel,
    pub samples: SampleSet,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
enum VisitError {
    #[error("{0}")]
    Mux(MuxError),
    #[error("{0}")]
    Sensor(SensorError),
}

/// Read temperature, humidity and CO2 from a sensor that has just measured.
///
/// Readings are appended as they succeed; the first failure ends the pass
/// for this sensor and leaves the remaining metrics without an entry.
pub async fn read_pass<S: Co2Sensor>(
    sensor: &mut S,
    samples: &mut SampleSet,
) -> Result<(), SensorError> {
    // Buffers hold MAX_PASSES entries and the engine never runs more passes.
    let temperature = sensor.temperature().await?;
    let _ = samples.temperature.push(temperature);
    let humidity = sensor.relative_humidity().await?;
    let _ = samples.humidity.push(humidity);
    let co2 = sensor.co2().await?;
    let _ = samples.co2.push(co2 as f32);
    Ok(())
}

pub struct SamplingEngine {
    passes: u8,
}

impl SamplingEngine {
    /// `passes` is capped at [`MAX_PASSES`].
    pub fn new(passes: u8) -> Self {
        Self {
            passes: passes.min(MAX_PASSES as u8),
        }
    }

    /// Run every pass over every occupied channel, ascending within a pass.
    ///
    /// Read failures never abort the cycle: the affected entries are simply
    /// missing from the channel's [`SampleSet`].
    pub async fn run<I: I2c, D: DelayNs>(
        &self,
        mux: &mut SensorMux<I>,
        delay: &mut D,
        occupied: &OccupiedChannels,
    ) -> Vec<ChannelSamples> {
        let mut results: Vec<ChannelSamples> = occupied
            .iter()
            .map(|channel| ChannelSamples {
                channel,
                samples: SampleSet::default(),
            })
            .collect();

        for pass in 1..=self.passes {
            for entry in results.iter_mut() {
                debug!("Querying channel {} on pass {}", entry.channel, pass);
                if let Err(e) = Self::visit(mux, delay, entry.channel, &mut entry.samples).await {
                    warn!(
                        "Sensor on channel {} unready on pass {}: {}",
                        entry.channel, pass, e
                    );
                }
            }
        }

        for entry in &results {
            info!(
                "Channel {} delivered {} readings",
                entry.channel,
                entry.samples.entry_count()
            );
        }
        results
    }

    async fn visit<I: I2c, D: DelayNs>(
        mux: &mut SensorMux<I>,
        delay: &mut D,
        channel: Channel,
        samples: &mut SampleSet,
    ) -> Result<(), VisitError> {
        let bus = mux.channel(channel).map_err(VisitError::Mux)?;
        let mut sensor = Scd4x::new(bus, delay);

        let measured = Self::measure(&mut sensor, samples).await;
        if let Err(e) = sensor.power_down().await {
            warn!("Failed to power down sensor on channel {}: {}", channel, e);
        }
        measured.map_err(VisitError::Sensor)
    }

    async fn measure<S: Co2Sensor>(sensor: &mut S, samples: &mut SampleSet) -> Result<(), SensorError> {
        sensor.wake_up().await?;
        sensor.measure_single_shot().await?;
        read_pass(sensor, samples).await
    }
}
