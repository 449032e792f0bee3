//! Board wiring and build-time deployment settings

use airmux_core::config::{AcquisitionConfig, Config, InternetConfig, UploadConfig};

/// Sensor bus clock. The multiplexer and the SCD4x both run at standard mode.
pub const I2C_FREQUENCY_KHZ: u32 = 100;

/// Heap for the Wi-Fi driver and the per-cycle record.
pub const HEAP_SIZE: usize = 72 * 1024;

// The I2C bus uses SDA on GPIO21 and SCL on GPIO22. The sensor supply rail
// switch is driven from GPIO4, active high.

pub const WIFI_SSID: &str = env!("AIRMUX_WIFI_SSID");
pub const WIFI_PASSWORD: &str = env!("AIRMUX_WIFI_PASSWORD");
pub const UPLOAD_ENDPOINT: &str = env!("AIRMUX_UPLOAD_ENDPOINT");
pub const UPLOAD_API_KEY: &str = env!("AIRMUX_UPLOAD_API_KEY");

/// Deployment configuration: secrets from the build plus default acquisition settings.
pub fn config() -> Config<'static> {
    Config {
        internet: InternetConfig {
            ssid: WIFI_SSID,
            password: WIFI_PASSWORD,
        },
        upload: UploadConfig {
            endpoint: UPLOAD_ENDPOINT,
            api_key: UPLOAD_API_KEY,
        },
        acquisition: AcquisitionConfig::default(),
    }
}
