//! Delivery of a cycle's record to the HTTP feed
//!
//! The core frames the request and interprets the response status; the
//! [`Uplink`] implementation owns the network interface and the socket.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use embassy_futures::select::{Either, select};
use embedded_hal_async::delay::DelayNs;
use log::{debug, info};
use thiserror_no_std::Error;

use crate::config::UploadConfig;
use crate::record::ResultRecord;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadError {
    #[error("upload endpoint must be an http://host[:port]/path URL")]
    InvalidEndpoint,
    #[error("network association did not complete within {0} s")]
    ConnectTimeout(u32),
    #[error("network association failed")]
    Connect,
    #[error("could not resolve the upload host")]
    Dns,
    #[error("transport error: {0}")]
    Transport(&'static str),
    #[error("malformed HTTP response")]
    MalformedResponse,
    #[error("server answered with status {0}")]
    Status(u16),
    #[error("failed to encode the result record")]
    Encode,
}

/// Network side of an upload: association, one request/response exchange, and
/// deassociation.
pub trait Uplink {
    /// Associate with the network. May wait indefinitely; [`Uploader`] bounds it.
    fn connect(&mut self) -> impl Future<Output = Result<(), UploadError>>;

    /// Deliver a complete HTTP request to `host:port` and return the response status code.
    fn send(
        &mut self,
        host: &str,
        port: u16,
        request: &[u8],
    ) -> impl Future<Output = Result<u16, UploadError>>;

    fn disconnect(&mut self) -> impl Future<Output = ()>;
}

/// A parsed `http://host[:port]/path` URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint<'a> {
    pub host: &'a str,
    pub port: u16,
    pub path: &'a str,
}

impl<'a> Endpoint<'a> {
    pub fn parse(url: &'a str) -> Result<Self, UploadError> {
        let rest = url
            .strip_prefix("http://")
            .ok_or(UploadError::InvalidEndpoint)?;
        let (authority, path) = match rest.find('/') {
            Some(slash) => rest.split_at(slash),
            None => (rest, "/"),
        };
        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| UploadError::InvalidEndpoint)?,
            ),
            None => (authority, 80),
        };
        if host.is_empty() {
            return Err(UploadError::InvalidEndpoint);
        }
        Ok(Self { host, port, path })
    }
}

/// Frame a complete HTTP/1.1 POST carrying a JSON body.
pub fn build_post_request(endpoint: &Endpoint<'_>, api_key: &str, body: &[u8]) -> Vec<u8> {
    let host = if endpoint.port == 80 {
        String::from(endpoint.host)
    } else {
        format!("{}:{}", endpoint.host, endpoint.port)
    };
    let head = format!(
        "POST {} HTTP/1.1\r\n\
         Host: {}\r\n\
         api-key: {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        endpoint.path,
        host,
        api_key,
        body.len()
    );

    let mut request = Vec::with_capacity(head.len() + body.len());
    request.extend_from_slice(head.as_bytes());
    request.extend_from_slice(body);
    request
}

/// Status code from the first line of an HTTP response, e.g. `HTTP/1.1 200 OK`.
pub fn parse_status_line(response: &[u8]) -> Result<u16, UploadError> {
    let line_end = response
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(response.len());
    let line =
        core::str::from_utf8(&response[..line_end]).map_err(|_| UploadError::MalformedResponse)?;

    let mut parts = line.split(' ');
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse::<u16>()
            .map_err(|_| UploadError::MalformedResponse),
        _ => Err(UploadError::MalformedResponse),
    }
}

/// Connect → POST → disconnect around one record. No retry and no queue: a
/// failed attempt drops that cycle's upload.
pub struct Uploader<'a, U> {
    uplink: U,
    endpoint: Endpoint<'a>,
    api_key: &'a str,
    connect_timeout_secs: u32,
}

impl<'a, U: Uplink> Uploader<'a, U> {
    pub fn new(
        uplink: U,
        config: &UploadConfig<'a>,
        connect_timeout_secs: u32,
    ) -> Result<Self, UploadError> {
        Ok(Self {
            uplink,
            endpoint: Endpoint::parse(config.endpoint)?,
            api_key: config.api_key,
            connect_timeout_secs,
        })
    }

    /// Upload `record`. The uplink is always disconnected afterwards, whatever the outcome.
    pub async fn upload<D: DelayNs>(
        &mut self,
        record: &ResultRecord,
        delay: &mut D,
    ) -> Result<(), UploadError> {
        let body = record.to_json().map_err(|_| UploadError::Encode)?;
        let request = build_post_request(&self.endpoint, self.api_key, &body);

        let result = self.deliver(&request, delay).await;
        self.uplink.disconnect().await;
        result
    }

    async fn deliver<D: DelayNs>(&mut self, request: &[u8], delay: &mut D) -> Result<(), UploadError> {
        let timeout_ms = self.connect_timeout_secs.saturating_mul(1000);
        match select(self.uplink.connect(), delay.delay_ms(timeout_ms)).await {
            Either::First(connected) => connected?,
            Either::Second(()) => return Err(UploadError::ConnectTimeout(self.connect_timeout_secs)),
        }
        debug!(
            "Posting {} bytes to {}:{}{}",
            request.len(),
            self.endpoint.host,
            self.endpoint.port,
            self.endpoint.path
        );

        let status = self
            .uplink
            .send(self.endpoint.host, self.endpoint.port, request)
            .await?;
        if !(200..300).contains(&status) {
            return Err(UploadError::Status(status));
        }
        info!("Upload accepted with status {}", status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ConnectBehaviour, SimDelay, SimUplink};
    use embassy_futures::block_on;

    fn config() -> UploadConfig<'static> {
        UploadConfig {
            endpoint: "http://feeds.example.com/api/v2/feed/42",
            api_key: "secret",
        }
    }

    #[test]
    fn parses_endpoints() {
        assert_eq!(
            Endpoint::parse("http://feeds.example.com/api/v2/feed/42"),
            Ok(Endpoint {
                host: "feeds.example.com",
                port: 80,
                path: "/api/v2/feed/42"
            })
        );
        assert_eq!(
            Endpoint::parse("http://10.0.0.2:8080"),
            Ok(Endpoint {
                host: "10.0.0.2",
                port: 8080,
                path: "/"
            })
        );
        assert_eq!(
            Endpoint::parse("https://feeds.example.com/"),
            Err(UploadError::InvalidEndpoint)
        );
        assert_eq!(
            Endpoint::parse("http://host:http/"),
            Err(UploadError::InvalidEndpoint)
        );
        assert_eq!(Endpoint::parse("http:///x"), Err(UploadError::InvalidEndpoint));
    }

    #[test]
    fn frames_post_with_api_key_header() {
        let endpoint = Endpoint::parse("http://example.com:8080/feed").unwrap();
        let request = build_post_request(&endpoint, "k3y", b"{\"data\":{}}");
        let text = core::str::from_utf8(&request).unwrap();

        assert!(text.starts_with("POST /feed HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com:8080\r\n"));
        assert!(text.contains("api-key: k3y\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"data\":{}}"));
    }

    #[test]
    fn parses_status_lines() {
        assert_eq!(parse_status_line(b"HTTP/1.1 200 OK\r\nServer: x\r\n"), Ok(200));
        assert_eq!(parse_status_line(b"HTTP/1.0 404 Not Found"), Ok(404));
        assert_eq!(
            parse_status_line(b"garbage"),
            Err(UploadError::MalformedResponse)
        );
    }

    #[test]
    fn upload_posts_record_and_disconnects() {
        let uplink = SimUplink::new();
        let mut uploader = Uploader::new(uplink.clone(), &config(), 30).unwrap();

        block_on(uploader.upload(&ResultRecord::default(), &mut SimDelay::new())).unwrap();

        assert_eq!(uplink.connects(), 1);
        assert_eq!(uplink.disconnects(), 1);
        assert_eq!(uplink.last_body().unwrap(), b"{\"data\":{}}");
    }

    #[test]
    fn rejected_status_is_an_upload_error() {
        let uplink = SimUplink::new();
        uplink.set_status(401);
        let mut uploader = Uploader::new(uplink.clone(), &config(), 30).unwrap();

        let result = block_on(uploader.upload(&ResultRecord::default(), &mut SimDelay::new()));
        assert_eq!(result, Err(UploadError::Status(401)));
        assert_eq!(uplink.disconnects(), 1);
    }

    #[test]
    fn hanging_association_times_out() {
        let uplink = SimUplink::new();
        uplink.set_connect(ConnectBehaviour::Hang);
        let mut uploader = Uploader::new(uplink.clone(), &config(), 15).unwrap();
        let delay = SimDelay::new();

        let result = block_on(uploader.upload(&ResultRecord::default(), &mut delay.clone()));
        assert_eq!(result, Err(UploadError::ConnectTimeout(15)));
        assert_eq!(delay.elapsed_ms(), 15_000);
        assert!(uplink.requests().is_empty());
        assert_eq!(uplink.disconnects(), 1);
    }

    #[test]
    fn failed_association_skips_the_request() {
        let uplink = SimUplink::new();
        uplink.set_connect(ConnectBehaviour::Fail);
        let mut uploader = Uploader::new(uplink.clone(), &config(), 30).unwrap();

        let result = block_on(uploader.upload(&ResultRecord::default(), &mut SimDelay::new()));
        assert_eq!(result, Err(UploadError::Connect));
        assert!(uplink.requests().is_empty());
    }
}
