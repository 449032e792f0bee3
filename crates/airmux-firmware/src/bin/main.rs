#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use embassy_executor::Spawner;
use embassy_futures::select::{Either, select};
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use log::{error, info};

use airmux_core::controller::{CycleController, DeviceReset};
use airmux_firmware::board;
use airmux_firmware::network::WifiUplink;
use airmux_firmware::reset::EspReset;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(_spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(size: board::HEAP_SIZE);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!("Embassy initialized");

    let mut reset = EspReset;

    let i2c = match I2c::new(
        peripherals.I2C0,
        I2cConfig::default().with_frequency(Rate::from_khz(board::I2C_FREQUENCY_KHZ)),
    ) {
        Ok(i2c) => i2c
            .with_sda(peripherals.GPIO21)
            .with_scl(peripherals.GPIO22)
            .into_async(),
        Err(e) => {
            error!("I2C configuration rejected: {:?}", e);
            reset.reset()
        }
    };
    let power = Output::new(peripherals.GPIO4, Level::Low, OutputConfig::default());

    let config = board::config();
    let (uplink, mut runner) =
        match WifiUplink::new(peripherals.WIFI, config.internet.ssid, config.internet.password) {
            Ok(network) => network,
            Err(e) => {
                error!("Network bring-up failed: {:?}", e);
                reset.reset()
            }
        };

    let controller =
        match CycleController::new(i2c, embassy_time::Delay, power, uplink, &config) {
            Ok(controller) => controller,
            Err(e) => {
                error!("{}", e);
                reset.reset()
            }
        };

    info!("Sensor bus and network ready; starting acquisition");
    match select(runner.run(), controller.run(&mut reset)).await {
        Either::First(never) => never,
        Either::Second(never) => never,
    }
}
