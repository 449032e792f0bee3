//! Injected configuration for the acquisition agent

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::channel::MAX_CHANNELS;
use crate::sampling::MAX_PASSES;

/// Factory ASC standard period of the SCD4x, in hours.
pub const SCD4X_DEFAULT_ASC_STANDARD_PERIOD_HOURS: u16 = 156;

/// Default number of sampling passes per cycle.
pub const DEFAULT_PASSES_PER_CYCLE: u8 = 4;

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(bound(deserialize = "'de: 'a"))]
pub struct Config<'a> {
    #[serde(default)]
    pub internet: InternetConfig<'a>,
    #[serde(default)]
    pub upload: UploadConfig<'a>,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct InternetConfig<'a> {
    pub ssid: &'a str,
    pub password: &'a str,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct UploadConfig<'a> {
    /// `http://host[:port]/path` of the feed that receives each cycle's record.
    pub endpoint: &'a str,
    /// Sent as the `api-key` request header.
    pub api_key: &'a str,
}

/// Timing, topology and escalation settings for the acquisition pipeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// 7-bit address of the I2C multiplexer.
    pub mux_address: u8,
    /// Number of multiplexer channels to scan, starting at channel 0.
    pub channel_count: u8,
    pub passes_per_cycle: u8,
    /// Fixed pause between the end of one cycle and the start of the next.
    pub cycle_delay_secs: u32,
    /// A channel whose lifetime failure count exceeds this value triggers a restart.
    pub restart_threshold: u32,
    /// ASC standard period the sensors are tuned to.
    ///
    /// The sensor assumes one measurement per five minutes; sampling four
    /// times as often needs a period four times as long.
    pub asc_standard_period_hours: u16,
    /// Pause after switching the sensor rail on, before the first bus access.
    pub power_settle_ms: u32,
    /// Upper bound on the wait for network association before an upload.
    pub connect_timeout_secs: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            mux_address: 0x70,
            channel_count: MAX_CHANNELS as u8,
            passes_per_cycle: DEFAULT_PASSES_PER_CYCLE,
            cycle_delay_secs: 300,
            restart_threshold: 9,
            asc_standard_period_hours: SCD4X_DEFAULT_ASC_STANDARD_PERIOD_HOURS
                * DEFAULT_PASSES_PER_CYCLE as u16,
            power_settle_ms: 30,
            connect_timeout_secs: 30,
        }
    }
}

impl AcquisitionConfig {
    /// Readings a channel must deliver in one cycle to count as complete.
    pub const fn expected_readings(&self) -> usize {
        self.passes_per_cycle as usize * 3
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("passes per cycle must be between 1 and {max}, got {got}")]
    PassCount { got: u8, max: usize },
    #[error("channel count must be between 1 and {max}, got {got}")]
    ChannelCount { got: u8, max: usize },
    #[error("mux address {0:#04x} is not a 7-bit I2C address")]
    MuxAddress(u8),
    #[error("ASC standard period must be a non-zero multiple of 4 hours, got {0}")]
    AscPeriod(u16),
}

impl Config<'_> {
    /// Check the settings the pipeline relies on before anything touches the bus.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.acquisition.validate()
    }
}

impl AcquisitionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.passes_per_cycle == 0 || self.passes_per_cycle as usize > MAX_PASSES {
            return Err(ConfigError::PassCount {
                got: self.passes_per_cycle,
                max: MAX_PASSES,
            });
        }
        if self.channel_count == 0 || self.channel_count as usize > MAX_CHANNELS {
            return Err(ConfigError::ChannelCount {
                got: self.channel_count,
                max: MAX_CHANNELS,
            });
        }
        if self.mux_address > 0x7F {
            return Err(ConfigError::MuxAddress(self.mux_address));
        }
        if self.asc_standard_period_hours == 0 || self.asc_standard_period_hours % 4 != 0 {
            return Err(ConfigError::AscPeriod(self.asc_standard_period_hours));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_deployed_device() {
        let config = AcquisitionConfig::default();
        assert_eq!(config.mux_address, 0x70);
        assert_eq!(config.passes_per_cycle, 4);
        assert_eq!(config.expected_readings(), 12);
        assert_eq!(config.asc_standard_period_hours, 624);
        assert_eq!(config.restart_threshold, 9);
        assert_eq!(config.cycle_delay_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loads_partial_json_over_defaults() {
        let json = r#"{
            "internet": { "ssid": "lab", "password": "hunter2" },
            "upload": { "endpoint": "http://example.com/feed/1", "api_key": "k" },
            "acquisition": { "cycle_delay_secs": 60 }
        }"#;
        let config: Config<'_> = serde_json::from_str(json).unwrap();
        assert_eq!(config.internet.ssid, "lab");
        assert_eq!(config.upload.api_key, "k");
        assert_eq!(config.acquisition.cycle_delay_secs, 60);
        assert_eq!(config.acquisition.passes_per_cycle, 4);
    }

    #[test]
    fn rejects_invalid_settings() {
        let mut config = AcquisitionConfig::default();
        config.passes_per_cycle = 0;
        assert!(matches!(config.validate(), Err(ConfigError::PassCount { .. })));

        let mut config = AcquisitionConfig::default();
        config.channel_count = 9;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ChannelCount { got: 9, .. })
        ));

        let mut config = AcquisitionConfig::default();
        config.asc_standard_period_hours = 625;
        assert_eq!(config.validate(), Err(ConfigError::AscPeriod(625)));

        let mut config = AcquisitionConfig::default();
        config.mux_address = 0x80;
        assert_eq!(config.validate(), Err(ConfigError::MuxAddress(0x80)));
    }
}
