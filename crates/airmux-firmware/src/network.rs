//! Wi-Fi station uplink for the cycle uploads
//!
//! The station is associated only around each upload and released afterwards.
//! The `embassy-net` stack runner must be polled alongside the controller for
//! DHCP, DNS and TCP to make progress.

use alloc::string::String;

use airmux_core::upload::{UploadError, Uplink, parse_status_line};
use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::TcpSocket;
use embassy_net::{Config as NetConfig, DhcpConfig, Runner, Stack, StackResources};
use embassy_time::Duration;
use esp_hal::peripherals::WIFI;
use esp_hal::rng::Rng;
use esp_radio::Controller as RadioController;
use esp_radio::wifi::{self, ClientConfig, ModeConfig, WifiController, WifiDevice};
use log::{debug, info, warn};
use static_cell::StaticCell;

/// Socket read/write timeout once the TCP connection is up.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

const SOCKET_BUFFER_SIZE: usize = 1024;

/// Enough for the status line and a few headers.
const RESPONSE_HEAD_SIZE: usize = 256;

static RADIO_CONTROLLER: StaticCell<RadioController<'static>> = StaticCell::new();
static NET_RESOURCES: StaticCell<StackResources<3>> = StaticCell::new();

#[derive(Debug)]
pub enum NetworkInitError {
    Radio(esp_radio::InitializationError),
    Wifi(wifi::WifiError),
}

pub struct WifiUplink {
    controller: WifiController<'static>,
    stack: Stack<'static>,
    ssid: &'static str,
    password: &'static str,
}

impl WifiUplink {
    /// Bring up the radio and a DHCP network stack.
    ///
    /// Returns the uplink and the stack runner; the runner has to be driven for
    /// as long as the uplink is in use.
    pub fn new(
        wifi: WIFI<'static>,
        ssid: &'static str,
        password: &'static str,
    ) -> Result<(Self, Runner<'static, WifiDevice<'static>>), NetworkInitError> {
        let radio = esp_radio::init().map_err(NetworkInitError::Radio)?;
        let radio = RADIO_CONTROLLER.init(radio);
        let (controller, interfaces) =
            wifi::new(radio, wifi, Default::default()).map_err(NetworkInitError::Wifi)?;

        let rng = Rng::new();
        let seed = (rng.random() as u64) << 32 | rng.random() as u64;
        let resources = NET_RESOURCES.init(StackResources::new());
        let (stack, runner) = embassy_net::new(
            interfaces.sta,
            NetConfig::dhcpv4(DhcpConfig::default()),
            resources,
            seed,
        );

        Ok((
            Self {
                controller,
                stack,
                ssid,
                password,
            },
            runner,
        ))
    }
}

impl Uplink for WifiUplink {
    async fn connect(&mut self) -> Result<(), UploadError> {
        if !matches!(self.controller.is_started(), Ok(true)) {
            let config = ModeConfig::Client(
                ClientConfig::default()
                    .with_ssid(String::from(self.ssid))
                    .with_password(String::from(self.password)),
            );
            self.controller.set_config(&config).map_err(|e| {
                warn!("Wi-Fi set_config error: {:?}", e);
                UploadError::Connect
            })?;
            info!("Starting Wi-Fi STA");
            self.controller.start_async().await.map_err(|e| {
                warn!("Wi-Fi start error: {:?}", e);
                UploadError::Connect
            })?;
        }

        info!("Connecting to Wi-Fi SSID \"{}\"", self.ssid);
        self.controller.connect_async().await.map_err(|e| {
            warn!("Wi-Fi connect error: {:?}", e);
            UploadError::Connect
        })?;

        self.stack.wait_config_up().await;
        if let Some(config) = self.stack.config_v4() {
            info!("Wi-Fi link up: ip={}", config.address);
        }
        Ok(())
    }

    async fn send(&mut self, host: &str, port: u16, request: &[u8]) -> Result<u16, UploadError> {
        let addresses = self
            .stack
            .dns_query(host, DnsQueryType::A)
            .await
            .map_err(|_| UploadError::Dns)?;
        let address = addresses.first().copied().ok_or(UploadError::Dns)?;
        debug!("Resolved {} to {}", host, address);

        let mut rx_buffer = [0_u8; SOCKET_BUFFER_SIZE];
        let mut tx_buffer = [0_u8; SOCKET_BUFFER_SIZE];
        let mut socket = TcpSocket::new(self.stack, &mut rx_buffer, &mut tx_buffer);
        socket.set_timeout(Some(SOCKET_TIMEOUT));

        socket
            .connect((address, port))
            .await
            .map_err(|_| UploadError::Transport("tcp connect"))?;

        let mut sent = 0;
        while sent < request.len() {
            sent += socket
                .write(&request[sent..])
                .await
                .map_err(|_| UploadError::Transport("tcp write"))?;
        }
        socket
            .flush()
            .await
            .map_err(|_| UploadError::Transport("tcp flush"))?;

        let mut head = [0_u8; RESPONSE_HEAD_SIZE];
        let mut filled = 0;
        while filled < head.len() {
            let n = socket
                .read(&mut head[filled..])
                .await
                .map_err(|_| UploadError::Transport("tcp read"))?;
            if n == 0 {
                break;
            }
            filled += n;
            if head[..filled].windows(2).any(|w| w == b"\r\n") {
                break;
            }
        }
        socket.close();

        parse_status_line(&head[..filled])
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.controller.disconnect_async().await {
            debug!("Wi-Fi disconnect: {:?}", e);
        }
    }
}
