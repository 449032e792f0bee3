//! The acquisition loop: startup, cycles and restart escalation
//!
//! ```text
//! start:     power on -> scan -> calibrate -> power off
//! run_cycle: power on -> sample -> power off -> average -> account failures
//!            -> deltas -> record -> upload -> restart check
//! ```
//!
//! All state that lives across cycles is held in [`AgentState`], which the
//! caller owns and passes in by reference.

use alloc::vec::Vec;

use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use crate::calibration::{CalibrationError, SensorCalibrator};
use crate::channel::{Channel, OccupiedChannels};
use crate::config::{AcquisitionConfig, Config, ConfigError};
use crate::failures::{FailureLedger, RestartPolicy};
use crate::mux::SensorMux;
use crate::record::ResultRecord;
use crate::sampling::SamplingEngine;
use crate::scanner::ChannelScanner;
use crate::stats::{ChannelAggregate, Deltas};
use crate::upload::{UploadError, Uploader, Uplink};

/// Full device restart.
pub trait DeviceReset {
    fn reset(&mut self) -> !;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(ConfigError),
    #[error("invalid upload endpoint: {0}")]
    Endpoint(UploadError),
    #[error("calibration failed: {0}")]
    Calibration(CalibrationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    /// `channel` is the first occupied channel whose lifetime failure count
    /// exceeded the restart threshold.
    Restart { channel: Channel, failures: u32 },
}

/// State carried from one cycle to the next. Rebuilt from scratch on every
/// start, so failure counts reset with the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentState {
    occupied: OccupiedChannels,
    ledger: FailureLedger,
    cycles: u32,
}

impl AgentState {
    pub fn new(occupied: OccupiedChannels) -> Self {
        Self {
            occupied,
            ledger: FailureLedger::new(),
            cycles: 0,
        }
    }

    pub fn occupied(&self) -> &OccupiedChannels {
        &self.occupied
    }

    pub fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    /// Cycles started since startup.
    pub fn cycles(&self) -> u32 {
        self.cycles
    }
}

/// Everything one cycle produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub record: ResultRecord,
    pub upload: Result<(), UploadError>,
    pub outcome: CycleOutcome,
}

pub struct CycleController<'a, I, D, P, U> {
    mux: SensorMux<I>,
    delay: D,
    power: P,
    uploader: Uploader<'a, U>,
    settings: AcquisitionConfig,
}

impl<'a, I, D, P, U> CycleController<'a, I, D, P, U>
where
    I: I2c,
    D: DelayNs,
    P: OutputPin,
    U: Uplink,
{
    /// Validate `config` and take ownership of the hardware.
    pub fn new(
        i2c: I,
        delay: D,
        power: P,
        uplink: U,
        config: &Config<'a>,
    ) -> Result<Self, StartupError> {
        config.validate().map_err(StartupError::Config)?;
        let settings = config.acquisition.clone();
        let uploader = Uploader::new(uplink, &config.upload, settings.connect_timeout_secs)
            .map_err(StartupError::Endpoint)?;

        Ok(Self {
            mux: SensorMux::new(i2c, settings.mux_address),
            delay,
            power,
            uploader,
            settings,
        })
    }

    pub fn settings(&self) -> &AcquisitionConfig {
        &self.settings
    }

    async fn power_on(&mut self) {
        if let Err(e) = self.power.set_high() {
            warn!("Failed to switch sensor power on: {:?}", e);
        }
        self.delay.delay_ms(self.settings.power_settle_ms).await;
    }

    fn power_off(&mut self) {
        if let Err(e) = self.power.set_low() {
            warn!("Failed to switch sensor power off: {:?}", e);
        }
    }

    /// Discover and calibrate the sensors.
    pub async fn start(&mut self) -> Result<AgentState, StartupError> {
        info!("Starting acquisition agent");
        self.power_on().await;

        let occupied = ChannelScanner::new(self.settings.channel_count)
            .scan(&mut self.mux)
            .await;
        if occupied.is_empty() {
            warn!("No sensors found behind the multiplexer");
        }

        let calibrated = SensorCalibrator::new(self.settings.asc_standard_period_hours)
            .calibrate_all(&mut self.mux, &mut self.delay, &occupied)
            .await;
        self.power_off();

        let reports = calibrated.map_err(StartupError::Calibration)?;
        info!("Calibrated {} sensors", reports.len());
        Ok(AgentState::new(occupied))
    }

    /// Run one acquisition cycle against `state`.
    pub async fn run_cycle(&mut self, state: &mut AgentState) -> CycleReport {
        state.cycles = state.cycles.wrapping_add(1);
        info!("Cycle {} on channels {}", state.cycles, state.occupied);

        self.power_on().await;
        let samples = SamplingEngine::new(self.settings.passes_per_cycle)
            .run(&mut self.mux, &mut self.delay, &state.occupied)
            .await;
        self.power_off();

        let expected = self.settings.expected_readings();
        let aggregates: Vec<ChannelAggregate> = samples
            .iter()
            .map(|entry| ChannelAggregate::from_samples(entry.channel, &entry.samples, expected))
            .collect();

        let failed = state.ledger.record_cycle(&aggregates);
        for &channel in &failed {
            warn!(
                "Channel {} incomplete this cycle, {} failures so far",
                channel,
                state.ledger.count(channel)
            );
        }

        let deltas = Deltas::across(&aggregates);
        let failures = if failed.is_empty() {
            Vec::new()
        } else {
            state.ledger.report(&state.occupied)
        };
        let record = ResultRecord {
            channels: aggregates,
            deltas,
            failures,
        };
        if let Ok(json) = record.to_json() {
            debug!("Record: {}", core::str::from_utf8(&json).unwrap_or("<binary>"));
        }

        let upload = self.uploader.upload(&record, &mut self.delay).await;
        if let Err(e) = &upload {
            warn!("Upload skipped this cycle: {}", e);
        }

        let outcome = match RestartPolicy::new(self.settings.restart_threshold)
            .first_breach(&state.ledger, &state.occupied)
        {
            Some(channel) => {
                let failures = state.ledger.count(channel);
                error!(
                    "Channel {} has failed {} cycles, above the limit of {}; restarting",
                    channel, failures, self.settings.restart_threshold
                );
                CycleOutcome::Restart { channel, failures }
            }
            None => CycleOutcome::Continue,
        };

        CycleReport {
            record,
            upload,
            outcome,
        }
    }

    /// Start, then cycle forever with a fixed pause between cycles. A fatal
    /// startup error or a restart outcome hands over to `reset`.
    pub async fn run<R: DeviceReset>(mut self, reset: &mut R) -> ! {
        let mut state = match self.start().await {
            Ok(state) => state,
            Err(e) => {
                error!("Startup failed: {}", e);
                reset.reset()
            }
        };

        loop {
            let report = self.run_cycle(&mut state).await;
            if let CycleOutcome::Restart { .. } = report.outcome {
                reset.reset();
            }
            let pause_ms = self.settings.cycle_delay_secs.saturating_mul(1000);
            debug!("Sleeping {} ms until the next cycle", pause_ms);
            self.delay.delay_ms(pause_ms).await;
        }
    }
}
