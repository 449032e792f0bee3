//! Desktop simulator for the airmux acquisition agent.
//!
//! Runs the real startup and cycle pipeline from `airmux-core` against the
//! in-memory multiplexer bus, with SCD4x sensors on channels 1, 3 and 6.
//! Channel 6 drops one single-shot trigger every cycle, so it accumulates
//! failures and eventually forces a restart, which the simulator models by
//! running startup again.
//!
//! ```text
//! airmux-simulator [config.json]
//! ```
//!
//! | Variable              | Default | Meaning                              |
//! |-----------------------|---------|--------------------------------------|
//! | `AIRMUX_SIM_CYCLES`   | 12      | Cycles to run before exiting         |
//! | `AIRMUX_SIM_SPEEDUP`  | 1000    | Divisor applied to every delay       |
//! | `RUST_LOG`            | unset   | `env_logger` filter, e.g. `info`     |

use std::time::Duration;

use embassy_futures::block_on;
use embedded_hal_async::delay::DelayNs;
use log::{error, info};

use airmux_core::config::{Config, UploadConfig};
use airmux_core::controller::{CycleController, CycleOutcome};
use airmux_core::sensors::commands;
use airmux_core::sim::{Fault, SimBus, SimScd4x};
use airmux_core::upload::{UploadError, Uplink};

const DEFAULT_CYCLES: u32 = 12;
const DEFAULT_SPEEDUP: u32 = 1000;

/// Flaky sensor channel.
const FLAKY_CHANNEL: u8 = 6;

/// Real-time delay divided by a speedup factor.
struct StdDelay {
    speedup: u32,
}

impl DelayNs for StdDelay {
    async fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(u64::from(ns / self.speedup)));
    }

    async fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_micros(
            u64::from(ms) * 1000 / u64::from(self.speedup),
        ));
    }
}

/// Uplink that logs each request instead of sending it.
struct LogUplink;

impl Uplink for LogUplink {
    async fn connect(&mut self) -> Result<(), UploadError> {
        info!("Network associated");
        Ok(())
    }

    async fn send(&mut self, host: &str, port: u16, request: &[u8]) -> Result<u16, UploadError> {
        info!(
            "POST to {}:{}\n{}",
            host,
            port,
            String::from_utf8_lossy(request)
        );
        Ok(200)
    }

    async fn disconnect(&mut self) {
        info!("Network released");
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .filter(|&value| value > 0)
        .unwrap_or(default)
}

fn build_bus() -> SimBus {
    let bus = SimBus::new(0x70);
    bus.attach(
        1,
        SimScd4x::new(0x0001_a1b2_c3d4)
            .with_asc(false, 156)
            .with_temperature_series(vec![21.2, 21.4, 21.3, 25.0, 21.1])
            .with_humidity_series(vec![41.0, 41.5, 40.8])
            .with_co2_series(vec![612, 618, 605, 640]),
    );
    bus.attach(
        3,
        SimScd4x::new(0x0003_a1b2_c3d4)
            .with_temperature_series(vec![22.6, 22.9, 22.7])
            .with_humidity_series(vec![44.0, 43.6])
            .with_co2_series(vec![655, 661, 649]),
    );
    bus.attach(
        FLAKY_CHANNEL,
        SimScd4x::new(0x0006_a1b2_c3d4)
            .with_asc(true, 624)
            .with_temperature_series(vec![20.1, 20.4])
            .with_humidity_series(vec![47.2, 46.9, 47.5])
            .with_co2_series(vec![702, 698]),
    );
    bus
}

fn main() {
    env_logger::init();
    info!("Starting airmux simulator");

    let text = std::env::args()
        .nth(1)
        .map(|path| match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                error!("Cannot read {}: {}", path, e);
                std::process::exit(1);
            }
        });
    let config = match text.as_deref() {
        Some(text) => match serde_json::from_str::<Config<'_>>(text) {
            Ok(config) => config,
            Err(e) => {
                error!("Invalid configuration: {}", e);
                std::process::exit(1);
            }
        },
        None => Config {
            upload: UploadConfig {
                endpoint: "http://localhost:8080/api/v2/feeds/airmux",
                api_key: "simulator",
            },
            ..Config::default()
        },
    };

    let cycles = env_u32("AIRMUX_SIM_CYCLES", DEFAULT_CYCLES);
    let speedup = env_u32("AIRMUX_SIM_SPEEDUP", DEFAULT_SPEEDUP);
    info!("Running {} cycles at {}x speed", cycles, speedup);

    let bus = build_bus();
    let mut controller = match CycleController::new(
        bus.clone(),
        StdDelay { speedup },
        bus.power_pin(),
        LogUplink,
        &config,
    ) {
        Ok(controller) => controller,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    block_on(async {
        let mut restarts = 0;
        let mut state = match controller.start().await {
            Ok(state) => state,
            Err(e) => {
                error!("Startup failed: {}", e);
                return;
            }
        };

        for _ in 0..cycles {
            bus.inject(FLAKY_CHANNEL, Fault::nack(commands::MEASURE_SINGLE_SHOT));
            let report = controller.run_cycle(&mut state).await;

            if let CycleOutcome::Restart { channel, failures } = report.outcome {
                restarts += 1;
                info!(
                    "Simulated restart #{} after channel {} reached {} failures",
                    restarts, channel, failures
                );
                state = match controller.start().await {
                    Ok(state) => state,
                    Err(e) => {
                        error!("Startup failed: {}", e);
                        return;
                    }
                };
            }

            let pause_ms = controller.settings().cycle_delay_secs.saturating_mul(1000);
            StdDelay { speedup }.delay_ms(pause_ms).await;
        }
        info!("Finished {} cycles with {} restarts", cycles, restarts);
    });
}
