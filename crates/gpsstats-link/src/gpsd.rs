//! gpsd JSON client link
//!
//! Speaks gpsd's newline-delimited JSON protocol over TCP. After connecting it
//! enables watcher mode with `?WATCH`; from then on every TPV, SKY, TOFF or PPS
//! report updates a [`GpsData`] aggregate, and each update is delivered as one
//! reading.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use gpsstats_protocol::gpsd::{Report, Watch};
use gpsstats_protocol::GpsData;
use tracing::{debug, info, trace};

use crate::{Link, LinkError, net};

/// Longest accepted report line, excluding the terminator
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpsdSettings {
    pub host: String,
    pub port: u16,
    /// Restrict the watch to one receiver
    pub device: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for GpsdSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: gpsstats_protocol::gpsd::DEFAULT_PORT,
            device: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

pub struct GpsdLink {
    settings: GpsdSettings,
    stream: Option<TcpStream>,
    rx: Vec<u8>,
    /// Bytes of `rx` already searched for a newline
    scanned: usize,
    /// Dropping the rest of an overlong line
    discarding: bool,
    data: GpsData,
}

impl GpsdLink {
    pub fn new(settings: GpsdSettings) -> Self {
        Self {
            settings,
            stream: None,
            rx: Vec::new(),
            scanned: 0,
            discarding: false,
            data: GpsData::new(),
        }
    }

    pub fn settings(&self) -> &GpsdSettings {
        &self.settings
    }

    fn reset(&mut self) {
        self.rx.clear();
        self.scanned = 0;
        self.discarding = false;
        self.data = GpsData::new();
    }

    fn find_newline(&mut self) -> Option<usize> {
        match self.rx[self.scanned..].iter().position(|&b| b == b'\n') {
            Some(pos) => Some(self.scanned + pos),
            None => {
                self.scanned = self.rx.len();
                None
            },
        }
    }

    fn decode_line(data: &mut GpsData, line: &[u8]) -> Result<Option<GpsData>, LinkError> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let report = Report::parse(line)?;
        match report {
            Report::Version(ref version) => {
                debug!(
                    "gpsd {} (rev {}), protocol {}.{}",
                    version.release, version.rev, version.proto_major, version.proto_minor
                );
            },
            Report::Error(ref error) => return Err(LinkError::Remote(error.message.clone())),
            _ => {},
        }

        if data.apply(&report)? {
            trace!(?report, "gpsd report applied");
            Ok(Some(data.clone()))
        } else {
            Ok(None)
        }
    }
}

impl Link for GpsdLink {
    type Inbound = GpsData;

    fn name(&self) -> &'static str {
        "gpsd"
    }

    fn open(&mut self) -> Result<(), LinkError> {
        self.close();
        self.reset();

        let GpsdSettings {
            ref host,
            port,
            ref device,
            connect_timeout,
        } = self.settings;
        let mut stream = net::connect(host, port, connect_timeout)?;
        let watch = Watch::enable(device.as_deref()).to_command()?;
        stream.write_all(&watch)?;
        net::make_nonblocking(&stream)?;

        info!("Connected to gpsd at {}:{}", host, port);
        self.stream = Some(stream);
        Ok(())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    fn read_frame(&mut self) -> Result<Option<GpsData>, LinkError> {
        loop {
            while let Some(end) = self.find_newline() {
                let result = if self.discarding {
                    Ok(None)
                } else {
                    Self::decode_line(&mut self.data, &self.rx[..end])
                };
                self.rx.drain(..=end);
                self.scanned = 0;
                self.discarding = false;
                if let Some(reading) = result? {
                    return Ok(Some(reading));
                }
            }

            if self.rx.len() > MAX_LINE_LENGTH {
                self.rx.clear();
                self.scanned = 0;
                if !std::mem::replace(&mut self.discarding, true) {
                    return Err(LinkError::Malformed(format!(
                        "report line exceeds {} bytes",
                        MAX_LINE_LENGTH
                    )));
                }
            }

            let stream = self.stream.as_mut().ok_or(LinkError::NotConnected)?;
            let mut chunk = [0u8; READ_CHUNK];
            match stream.read(&mut chunk) {
                Ok(0) => return Err(LinkError::Closed),
                Ok(n) => {
                    self.rx.try_reserve(n)?;
                    self.rx.extend_from_slice(&chunk[..n]);
                },
                Err(e) if net::is_interrupted(&e) => continue,
                Err(e) if net::is_would_block(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        match Watch::disable().to_command() {
            Ok(cmd) => {
                if let Err(e) = stream.write_all(&cmd) {
                    debug!("gpsd unwatch failed: {}", e);
                }
            },
            Err(e) => debug!("gpsd unwatch not encoded: {}", e),
        }
        let _ = stream.shutdown(Shutdown::Both);
        self.reset();
        debug!("gpsd connection closed");
    }
}

impl Drop for GpsdLink {
    fn drop(&mut self) {
        self.close();
    }
}
