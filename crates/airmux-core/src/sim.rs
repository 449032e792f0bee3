//! In-memory hardware for tests and the desktop simulator
//!
//! [`SimBus`] is an I2C bus with a TCA9548A-style multiplexer and one optional
//! [`SimScd4x`] behind each channel. Handles are cheap clones sharing one
//! state, so a test can keep a handle for inspection and fault injection while
//! the code under test owns another.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::convert::Infallible;

use embedded_hal::digital::{ErrorType as PinErrorType, OutputPin};
use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{ErrorType, I2c, Operation};

use crate::channel::MAX_CHANNELS;
use crate::sensors::{SCD4X_ADDRESS, commands, crc8};
use crate::upload::{UploadError, Uplink};

/// Bus error carrying only its [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimError(pub ErrorKind);

impl embedded_hal::i2c::Error for SimError {
    fn kind(&self) -> ErrorKind {
        self.0
    }
}

const NACK: SimError = SimError(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The command write is not acknowledged.
    Nack,
    /// The command executes, but the CRC of the next response word is wrong.
    Corrupt,
}

/// A scripted misbehaviour of one sensor command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    command: u16,
    kind: FaultKind,
    skip: u32,
    times: u32,
}

impl Fault {
    pub fn nack(command: u16) -> Self {
        Self {
            command,
            kind: FaultKind::Nack,
            skip: 0,
            times: 1,
        }
    }

    pub fn corrupt(command: u16) -> Self {
        Self {
            kind: FaultKind::Corrupt,
            ..Self::nack(command)
        }
    }

    /// Let the first `n` matching commands through untouched.
    pub fn after(mut self, n: u32) -> Self {
        self.skip = n;
        self
    }

    /// Misbehave on `n` consecutive matching commands.
    pub fn times(mut self, n: u32) -> Self {
        self.times = n;
        self
    }
}

/// Behavioural model of one SCD4x.
///
/// Settings are split into the live copy the firmware runs with and the
/// persisted copy that survives `reinit` and power cycles. Readings cycle
/// through the configured series, one step per single-shot measurement.
#[derive(Debug, Clone)]
pub struct SimScd4x {
    serial: u64,
    live_asc: (bool, u16),
    persisted_asc: (bool, u16),
    temperatures: Vec<f32>,
    humidities: Vec<f32>,
    co2: Vec<u16>,
    shots: usize,
    asleep: bool,
    responsive: bool,
    ready: Option<[u16; 3]>,
    response: Option<Vec<u16>>,
    corrupt_response: bool,
    faults: Vec<Fault>,
    counts: BTreeMap<u16, u32>,
}

impl SimScd4x {
    pub fn new(serial: u64) -> Self {
        Self {
            serial,
            live_asc: (true, 156),
            persisted_asc: (true, 156),
            temperatures: alloc::vec![22.0],
            humidities: alloc::vec![45.0],
            co2: alloc::vec![600],
            shots: 0,
            asleep: false,
            responsive: true,
            ready: None,
            response: None,
            corrupt_response: false,
            faults: Vec::new(),
            counts: BTreeMap::new(),
        }
    }

    /// Persisted (and live) ASC enabled flag and standard period.
    pub fn with_asc(mut self, enabled: bool, period_hours: u16) -> Self {
        self.live_asc = (enabled, period_hours);
        self.persisted_asc = (enabled, period_hours);
        self
    }

    pub fn with_readings(mut self, temperature: f32, humidity: f32, co2: u16) -> Self {
        self.temperatures = alloc::vec![temperature];
        self.humidities = alloc::vec![humidity];
        self.co2 = alloc::vec![co2];
        self
    }

    pub fn with_temperature_series(mut self, series: Vec<f32>) -> Self {
        if !series.is_empty() {
            self.temperatures = series;
        }
        self
    }

    pub fn with_humidity_series(mut self, series: Vec<f32>) -> Self {
        if !series.is_empty() {
            self.humidities = series;
        }
        self
    }

    pub fn with_co2_series(mut self, series: Vec<u16>) -> Self {
        if !series.is_empty() {
            self.co2 = series;
        }
        self
    }

    fn next_frame(&mut self) -> [u16; 3] {
        let shot = self.shots;
        self.shots += 1;
        let temperature = self.temperatures[shot % self.temperatures.len()];
        let humidity = self.humidities[shot % self.humidities.len()];
        let co2 = self.co2[shot % self.co2.len()];
        [
            co2,
            encode((temperature + 45.0) / 175.0),
            encode(humidity / 100.0),
        ]
    }

    fn power_on_reset(&mut self) {
        self.live_asc = self.persisted_asc;
        self.asleep = false;
        self.ready = None;
        self.response = None;
    }

    /// Returns the fault to apply to this occurrence of `command`, if any.
    fn take_fault(&mut self, command: u16) -> Option<FaultKind> {
        let index = self.faults.iter().position(|f| f.command == command)?;
        let fault = &mut self.faults[index];
        if fault.skip > 0 {
            fault.skip -= 1;
            return None;
        }
        let kind = fault.kind;
        fault.times = fault.times.saturating_sub(1);
        if fault.times == 0 {
            self.faults.remove(index);
        }
        Some(kind)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), SimError> {
        if !self.responsive {
            return Err(NACK);
        }
        let [c0, c1, argument @ ..] = bytes else {
            // Only an address-only probe is acknowledged.
            return if bytes.is_empty() && !self.asleep {
                Ok(())
            } else {
                Err(NACK)
            };
        };
        let command = u16::from_be_bytes([*c0, *c1]);
        *self.counts.entry(command).or_insert(0) += 1;

        if command == commands::WAKE_UP {
            // Woken, but never acknowledges.
            self.asleep = false;
            return Err(NACK);
        }
        if self.asleep {
            return Err(NACK);
        }
        match self.take_fault(command) {
            Some(FaultKind::Nack) => return Err(NACK),
            Some(FaultKind::Corrupt) => self.corrupt_response = true,
            None => {}
        }

        self.response = None;
        match command {
            commands::MEASURE_SINGLE_SHOT => self.ready = Some(self.next_frame()),
            commands::GET_DATA_READY_STATUS => {
                let status = if self.ready.is_some() { 0x0006 } else { 0x8000 };
                self.response = Some(alloc::vec![status]);
            }
            commands::READ_MEASUREMENT => {
                let frame = self.ready.take().ok_or(NACK)?;
                self.response = Some(frame.to_vec());
            }
            commands::GET_SERIAL_NUMBER => {
                let serial = self.serial;
                self.response = Some(alloc::vec![
                    (serial >> 32) as u16,
                    (serial >> 16) as u16,
                    serial as u16,
                ]);
            }
            commands::GET_ASC_ENABLED => {
                self.response = Some(alloc::vec![self.live_asc.0 as u16]);
            }
            commands::GET_ASC_STANDARD_PERIOD => {
                self.response = Some(alloc::vec![self.live_asc.1]);
            }
            commands::SET_ASC_ENABLED => self.live_asc.0 = parse_argument(argument)? != 0,
            commands::SET_ASC_STANDARD_PERIOD => self.live_asc.1 = parse_argument(argument)?,
            commands::PERSIST_SETTINGS => self.persisted_asc = self.live_asc,
            commands::REINIT => {
                self.live_asc = self.persisted_asc;
                self.ready = None;
            }
            commands::POWER_DOWN => {
                self.asleep = true;
                self.ready = None;
            }
            _ => return Err(NACK),
        }
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<(), SimError> {
        if !self.responsive || self.asleep {
            return Err(NACK);
        }
        let words = self.response.take().ok_or(NACK)?;
        let mut bytes = Vec::with_capacity(words.len() * 3);
        for word in words {
            let [hi, lo] = word.to_be_bytes();
            bytes.extend_from_slice(&[hi, lo, crc8(&[hi, lo])]);
        }
        if core::mem::take(&mut self.corrupt_response) {
            bytes[2] ^= 0xFF;
        }
        let n = buffer.len().min(bytes.len());
        buffer[..n].copy_from_slice(&bytes[..n]);
        Ok(())
    }
}

fn encode(fraction: f32) -> u16 {
    (fraction * 65535.0 + 0.5) as u16
}

fn parse_argument(argument: &[u8]) -> Result<u16, SimError> {
    match argument {
        [a0, a1, crc] if crc8(&[*a0, *a1]) == *crc => Ok(u16::from_be_bytes([*a0, *a1])),
        _ => Err(SimError(ErrorKind::Other)),
    }
}

struct BusState {
    mux_address: u8,
    mask: u8,
    failing_selects: u8,
    powered: bool,
    sensors: [Option<SimScd4x>; MAX_CHANNELS],
}

impl BusState {
    fn sensor(&mut self, channel: u8) -> Option<&mut SimScd4x> {
        self.sensors.get_mut(channel as usize)?.as_mut()
    }

    /// The sensor answering at 0x62: the lowest selected channel that has one.
    fn routed_sensor(&mut self) -> Option<&mut SimScd4x> {
        let mask = self.mask;
        self.sensors
            .iter_mut()
            .enumerate()
            .filter(|(i, _)| mask & (1 << *i) != 0)
            .find_map(|(_, slot)| slot.as_mut())
    }

    fn mux_operation(&mut self, operation: &mut Operation<'_>) -> Result<(), SimError> {
        match operation {
            Operation::Write([]) => Ok(()),
            Operation::Write([mask, ..]) => {
                if *mask & self.failing_selects != 0 {
                    return Err(NACK);
                }
                self.mask = *mask;
                Ok(())
            }
            Operation::Read(buffer) => {
                buffer.fill(self.mask);
                Ok(())
            }
        }
    }

    fn sensor_operation(&mut self, operation: &mut Operation<'_>) -> Result<(), SimError> {
        if !self.powered {
            return Err(NACK);
        }
        let sensor = self.routed_sensor().ok_or(NACK)?;
        match operation {
            Operation::Write(bytes) => sensor.write(bytes),
            Operation::Read(buffer) => sensor.read(buffer),
        }
    }
}

/// Simulated root I2C bus with a multiplexer at a fixed address.
#[derive(Clone)]
pub struct SimBus {
    state: Rc<RefCell<BusState>>,
}

impl SimBus {
    pub fn new(mux_address: u8) -> Self {
        Self {
            state: Rc::new(RefCell::new(BusState {
                mux_address,
                mask: 0,
                failing_selects: 0,
                powered: true,
                sensors: Default::default(),
            })),
        }
    }

    /// Place `sensor` behind multiplexer channel `channel`.
    pub fn attach(&self, channel: u8, sensor: SimScd4x) {
        assert!((channel as usize) < MAX_CHANNELS, "no channel {channel}");
        self.state.borrow_mut().sensors[channel as usize] = Some(sensor);
    }

    /// Make every select that includes `channel` fail.
    pub fn fail_select(&self, channel: u8) {
        self.state.borrow_mut().failing_selects |= 1 << channel;
    }

    /// Write the multiplexer control register directly.
    pub fn route(&self, mask: u8) {
        self.state.borrow_mut().mask = mask;
    }

    pub fn selected_mask(&self) -> u8 {
        self.state.borrow().mask
    }

    pub fn inject(&self, channel: u8, fault: Fault) {
        if let Some(sensor) = self.state.borrow_mut().sensor(channel) {
            sensor.faults.push(fault);
        }
    }

    /// How many times `command` reached the sensor on `channel`, acknowledged or not.
    pub fn command_count(&self, channel: u8, command: u16) -> u32 {
        self.state
            .borrow_mut()
            .sensor(channel)
            .and_then(|sensor| sensor.counts.get(&command).copied())
            .unwrap_or(0)
    }

    /// Live ASC enabled flag and standard period.
    pub fn asc(&self, channel: u8) -> Option<(bool, u16)> {
        self.state
            .borrow_mut()
            .sensor(channel)
            .map(|sensor| sensor.live_asc)
    }

    pub fn persisted_asc(&self, channel: u8) -> Option<(bool, u16)> {
        self.state
            .borrow_mut()
            .sensor(channel)
            .map(|sensor| sensor.persisted_asc)
    }

    /// An unresponsive sensor acknowledges nothing, probes included.
    pub fn set_responsive(&self, channel: u8, responsive: bool) {
        if let Some(sensor) = self.state.borrow_mut().sensor(channel) {
            sensor.responsive = responsive;
        }
    }

    pub fn is_asleep(&self, channel: u8) -> Option<bool> {
        self.state
            .borrow_mut()
            .sensor(channel)
            .map(|sensor| sensor.asleep)
    }

    pub fn is_powered(&self) -> bool {
        self.state.borrow().powered
    }

    /// A switch for the sensor supply rail. Switching it on power-cycles every
    /// sensor: persisted settings are reloaded and sleeping sensors wake.
    pub fn power_pin(&self) -> SimPowerPin {
        SimPowerPin {
            history: Rc::new(RefCell::new(Vec::new())),
            bus: Some(self.clone()),
        }
    }

    fn set_powered(&self, powered: bool) {
        let mut state = self.state.borrow_mut();
        if powered && !state.powered {
            for sensor in state.sensors.iter_mut().flatten() {
                sensor.power_on_reset();
            }
        }
        state.powered = powered;
    }
}

impl ErrorType for SimBus {
    type Error = SimError;
}

impl I2c for SimBus {
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();
        for operation in operations.iter_mut() {
            if address == state.mux_address {
                state.mux_operation(operation)?;
            } else if address == SCD4X_ADDRESS {
                state.sensor_operation(operation)?;
            } else {
                return Err(NACK);
            }
        }
        Ok(())
    }
}

/// Delay that returns immediately and accumulates the requested time.
#[derive(Debug, Clone, Default)]
pub struct SimDelay {
    elapsed_ns: Rc<Cell<u64>>,
}

impl SimDelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ns.get() / 1_000_000
    }
}

impl DelayNs for SimDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns.set(self.elapsed_ns.get() + ns as u64);
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ns
            .set(self.elapsed_ns.get() + ms as u64 * 1_000_000);
    }
}

/// Output pin that records every level written to it.
#[derive(Clone, Default)]
pub struct SimPowerPin {
    history: Rc<RefCell<Vec<bool>>>,
    bus: Option<SimBus>,
}

impl SimPowerPin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_high(&self) -> bool {
        self.history.borrow().last().copied().unwrap_or(false)
    }

    /// Every level written, oldest first.
    pub fn transitions(&self) -> Vec<bool> {
        self.history.borrow().clone()
    }

    fn set(&mut self, high: bool) {
        self.history.borrow_mut().push(high);
        if let Some(bus) = &self.bus {
            bus.set_powered(high);
        }
    }
}

impl PinErrorType for SimPowerPin {
    type Error = Infallible;
}

impl OutputPin for SimPowerPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set(true);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectBehaviour {
    #[default]
    Succeed,
    Fail,
    /// Never completes; only a timeout ends the wait.
    Hang,
}

#[derive(Debug, Default)]
struct UplinkState {
    status: u16,
    connect: ConnectBehaviour,
    connected: bool,
    connects: u32,
    disconnects: u32,
    requests: Vec<Vec<u8>>,
}

/// Uplink that records requests and answers with a scripted status.
#[derive(Debug, Clone)]
pub struct SimUplink {
    state: Rc<RefCell<UplinkState>>,
}

impl Default for SimUplink {
    fn default() -> Self {
        Self::new()
    }
}

impl SimUplink {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(UplinkState {
                status: 200,
                ..UplinkState::default()
            })),
        }
    }

    pub fn set_status(&self, status: u16) {
        self.state.borrow_mut().status = status;
    }

    pub fn set_connect(&self, behaviour: ConnectBehaviour) {
        self.state.borrow_mut().connect = behaviour;
    }

    pub fn connects(&self) -> u32 {
        self.state.borrow().connects
    }

    pub fn disconnects(&self) -> u32 {
        self.state.borrow().disconnects
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state.borrow().requests.clone()
    }

    /// Body of the most recent request.
    pub fn last_body(&self) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        let request = state.requests.last()?;
        let start = request.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
        Some(request[start..].to_vec())
    }
}

impl Uplink for SimUplink {
    async fn connect(&mut self) -> Result<(), UploadError> {
        let behaviour = {
            let mut state = self.state.borrow_mut();
            state.connects += 1;
            state.connect
        };
        match behaviour {
            ConnectBehaviour::Succeed => {
                self.state.borrow_mut().connected = true;
                Ok(())
            }
            ConnectBehaviour::Fail => Err(UploadError::Connect),
            ConnectBehaviour::Hang => core::future::pending().await,
        }
    }

    async fn send(&mut self, _host: &str, _port: u16, request: &[u8]) -> Result<u16, UploadError> {
        let mut state = self.state.borrow_mut();
        if !state.connected {
            return Err(UploadError::Transport("not associated"));
        }
        state.requests.push(request.to_vec());
        Ok(state.status)
    }

    async fn disconnect(&mut self) {
        let mut state = self.state.borrow_mut();
        state.connected = false;
        state.disconnects += 1;
    }
}
