//! MQTT publisher link
//!
//! A minimal MQTT 3.1.1 client over TCP or TLS. `open()` performs the
//! TCP connect, the optional TLS handshake and the CONNECT/CONNACK exchange
//! with blocking I/O bounded by the connect timeout, then switches the socket
//! to non-blocking mode for the event loop.
//!
//! Acknowledgement bookkeeping is done here: PUBREC is answered with PUBREL,
//! PUBACK/PUBCOMP retire in-flight packet ids and PINGRESP clears the
//! keep-alive deadline. Messages are never retransmitted.

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use gpsstats_protocol::mqtt::{self, Connect, Publish};
use gpsstats_protocol::{ConnectReturnCode, Packet, QoS};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use tracing::{debug, info, trace};

use crate::{BusLink, Link, LinkError, TlsSettings, net, tls};

const READ_CHUNK: usize = 4096;

/// Inbound bytes buffered without completing a packet before giving up
const MAX_INBOUND_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub auth: Option<MqttAuth>,
    pub tls: Option<TlsSettings>,
    pub connect_timeout: Duration,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            client_id: "gpsstats".to_string(),
            host: "localhost".to_string(),
            port: mqtt::DEFAULT_PORT,
            keep_alive: Duration::from_secs(60),
            auth: None,
            tls: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Transport {
    fn socket(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(stream) => stream.get_ref(),
        }
    }

    /// TLS records produced but not yet written to the socket
    fn has_pending_output(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls(stream) => stream.conn.wants_write(),
        }
    }

    fn shutdown(self) {
        let socket = match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(mut stream) => {
                stream.conn.send_close_notify();
                let _ = stream.flush();
                let (_, sock) = (*stream).into_parts();
                sock
            },
        };
        let _ = socket.shutdown(Shutdown::Both);
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf),
            Transport::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(buf),
            Transport::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush(),
            Transport::Tls(stream) => stream.flush(),
        }
    }
}

pub struct MqttLink {
    settings: MqttSettings,
    tls: Option<(Arc<ClientConfig>, ServerName<'static>)>,
    transport: Option<Transport>,
    rx: BytesMut,
    tx: Vec<u8>,
    next_packet_id: u16,
    inflight: HashSet<u16>,
    last_send: Instant,
    ping_deadline: Option<Instant>,
}

impl MqttLink {
    /// Validates the settings and prepares the TLS configuration.
    ///
    /// Unreadable certificates, unknown cipher suites or an invalid server
    /// name fail here with [`LinkError::Setup`], before any connection attempt.
    pub fn new(settings: MqttSettings) -> Result<Self, LinkError> {
        let tls = match settings.tls {
            Some(ref tls_settings) => {
                let config = tls::client_config(tls_settings)?;
                let name = ServerName::try_from(settings.host.clone()).map_err(|e| {
                    LinkError::Setup(format!("invalid TLS server name {:?}: {}", settings.host, e))
                })?;
                Some((config, name))
            },
            None => None,
        };

        Ok(Self {
            settings,
            tls,
            transport: None,
            rx: BytesMut::new(),
            tx: Vec::new(),
            next_packet_id: 0,
            inflight: HashSet::new(),
            last_send: Instant::now(),
            ping_deadline: None,
        })
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }

    /// Packet ids published with QoS 1/2 and not yet acknowledged
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    fn reset(&mut self) {
        self.rx.clear();
        self.tx.clear();
        self.inflight.clear();
        self.ping_deadline = None;
    }

    fn next_packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        self.next_packet_id
    }

    fn queue(&mut self, packet: &[u8]) -> Result<(), LinkError> {
        self.tx.try_reserve(packet.len())?;
        self.tx.extend_from_slice(packet);
        Ok(())
    }

    fn handshake(&mut self) -> Result<Transport, LinkError> {
        let tcp = net::connect(
            &self.settings.host,
            self.settings.port,
            self.settings.connect_timeout,
        )?;

        let mut transport = match self.tls {
            Some((ref config, ref name)) => {
                let mut conn = ClientConnection::new(config.clone(), name.clone())?;
                let mut tcp = tcp;
                while conn.is_handshaking() {
                    conn.complete_io(&mut tcp).map_err(handshake_error)?;
                }
                Transport::Tls(Box::new(StreamOwned::new(conn, tcp)))
            },
            None => Transport::Plain(tcp),
        };

        let auth = self.settings.auth.as_ref();
        let mut packet = BytesMut::new();
        mqtt::encode_connect(
            &Connect {
                client_id: &self.settings.client_id,
                keep_alive: u16::try_from(self.settings.keep_alive.as_secs()).unwrap_or(u16::MAX),
                clean_session: true,
                username: auth.map(|a| a.username.as_str()),
                password: auth.map(|a| a.password.as_str()),
            },
            &mut packet,
        )?;
        transport.write_all(&packet).map_err(handshake_error)?;
        transport.flush().map_err(handshake_error)?;

        let deadline = Instant::now() + self.settings.connect_timeout;
        loop {
            match mqtt::decode(&mut self.rx)? {
                Some(Packet::ConnAck {
                    code: ConnectReturnCode::Accepted,
                    session_present,
                }) => {
                    debug!("CONNACK accepted (session present: {})", session_present);
                    return Ok(transport);
                },
                Some(Packet::ConnAck { code, .. }) => return Err(LinkError::Refused(code)),
                Some(other) => {
                    debug!("Ignoring {:?} before CONNACK", other);
                    continue;
                },
                None => {},
            }
            if self.rx.len() > MAX_INBOUND_BUFFER {
                return Err(LinkError::Overflow(MAX_INBOUND_BUFFER));
            }
            if Instant::now() >= deadline {
                return Err(LinkError::HandshakeTimeout);
            }
            let mut chunk = [0u8; READ_CHUNK];
            match transport.read(&mut chunk) {
                Ok(0) => return Err(LinkError::Closed),
                Ok(n) => self.rx.extend_from_slice(&chunk[..n]),
                Err(e) if net::is_interrupted(&e) => {},
                Err(e) => return Err(handshake_error(e)),
            }
        }
    }

    fn flush_tx(&mut self) -> Result<(), LinkError> {
        let transport = self.transport.as_mut().ok_or(LinkError::NotConnected)?;
        while !self.tx.is_empty() {
            match transport.write(&self.tx) {
                Ok(0) => return Err(LinkError::Closed),
                Ok(n) => {
                    self.tx.drain(..n);
                    self.last_send = Instant::now();
                },
                Err(e) if net::is_interrupted(&e) => {},
                Err(e) if net::is_would_block(&e) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        match transport.flush() {
            Err(e) if net::is_would_block(&e) => Ok(()),
            other => other.map_err(LinkError::from),
        }
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<(), LinkError> {
        match packet {
            Packet::PubAck(id) | Packet::PubComp(id) => {
                if !self.inflight.remove(&id) {
                    debug!("Acknowledgement for unknown packet id {}", id);
                }
            },
            Packet::PubRec(id) => {
                let mut pubrel = BytesMut::with_capacity(4);
                mqtt::encode_pubrel(id, &mut pubrel);
                self.queue(&pubrel)?;
                self.flush_tx()?;
            },
            Packet::PingResp => self.ping_deadline = None,
            Packet::ConnAck { .. } | Packet::PubRel(_) => {
                debug!("Unexpected {:?} from broker", packet);
            },
        }
        Ok(())
    }
}

/// Blocking handshake I/O times out with `WouldBlock`/`TimedOut`
fn handshake_error(err: io::Error) -> LinkError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => LinkError::HandshakeTimeout,
        _ => LinkError::Io(err),
    }
}

impl Link for MqttLink {
    type Inbound = Packet;

    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn open(&mut self) -> Result<(), LinkError> {
        self.close();
        self.reset();

        let transport = self.handshake()?;
        net::make_nonblocking(transport.socket())?;
        self.transport = Some(transport);
        self.last_send = Instant::now();

        info!(
            "Connected to MQTT broker at {}:{}{}",
            self.settings.host,
            self.settings.port,
            if self.tls.is_some() { " (TLS)" } else { "" }
        );
        Ok(())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.transport.as_ref().map(|t| t.socket().as_raw_fd())
    }

    fn wants_write(&self) -> bool {
        !self.tx.is_empty() || self.transport.as_ref().is_some_and(Transport::has_pending_output)
    }

    fn read_frame(&mut self) -> Result<Option<Packet>, LinkError> {
        loop {
            if let Some(packet) = mqtt::decode(&mut self.rx)? {
                trace!(?packet, "MQTT packet received");
                self.handle_packet(packet)?;
                return Ok(Some(packet));
            }
            if self.rx.len() > MAX_INBOUND_BUFFER {
                return Err(LinkError::Overflow(MAX_INBOUND_BUFFER));
            }

            let transport = self.transport.as_mut().ok_or(LinkError::NotConnected)?;
            let mut chunk = [0u8; READ_CHUNK];
            match transport.read(&mut chunk) {
                Ok(0) => return Err(LinkError::Closed),
                Ok(n) => self.rx.extend_from_slice(&chunk[..n]),
                Err(e) if net::is_interrupted(&e) => continue,
                Err(e) if net::is_would_block(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn on_writable(&mut self) -> Result<(), LinkError> {
        self.flush_tx()
    }

    fn close(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        let mut disconnect = BytesMut::with_capacity(2);
        mqtt::encode_disconnect(&mut disconnect);
        if let Err(e) = transport.write_all(&disconnect).and_then(|()| transport.flush()) {
            debug!("MQTT DISCONNECT not delivered: {}", e);
        }
        transport.shutdown();
        if !self.inflight.is_empty() {
            debug!("{} unacknowledged MQTT messages dropped", self.inflight.len());
        }
        self.reset();
        debug!("MQTT connection closed");
    }
}

impl BusLink for MqttLink {
    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), LinkError> {
        if self.transport.is_none() {
            return Err(LinkError::NotConnected);
        }

        let packet_id = match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce | QoS::ExactlyOnce => Some(self.next_packet_id()),
        };
        let mut packet = BytesMut::new();
        mqtt::encode_publish(
            &Publish {
                topic,
                payload,
                qos,
                retain,
                packet_id,
            },
            &mut packet,
        )?;
        self.queue(&packet)?;
        if let Some(id) = packet_id {
            self.inflight.insert(id);
        }
        self.flush_tx()
    }

    fn housekeeping(&mut self) -> Result<(), LinkError> {
        if self.transport.is_none() {
            return Err(LinkError::NotConnected);
        }

        let now = Instant::now();
        match self.ping_deadline {
            Some(deadline) if now >= deadline => return Err(LinkError::KeepAliveTimeout),
            Some(_) => {},
            None if now.duration_since(self.last_send) >= self.settings.keep_alive / 2 => {
                let mut ping = BytesMut::with_capacity(2);
                mqtt::encode_pingreq(&mut ping);
                self.queue(&ping)?;
                self.ping_deadline = Some(now + self.settings.keep_alive);
                trace!("PINGREQ queued");
            },
            None => {},
        }
        self.flush_tx()
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.close();
    }
}
