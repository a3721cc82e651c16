//! # gpsstats Link Layer
//!
//! Network links owned by the connection supervisors: a gpsd JSON client and an
//! MQTT publisher over plain TCP or TLS.
//!
//! Every link follows the same lifecycle:
//!
//! ```text
//! open()  -> bounded blocking connect + handshake, then non-blocking socket
//! raw_fd() / wants_write()   -> what the event host has to watch
//! read_frame() until None    -> drain after a readiness notification
//! on_writable()              -> flush queued output
//! close()                    -> best-effort graceful goodbye, never fails
//! ```
//!
//! A link can be reopened after `close()`; it never reconnects by itself.

use std::os::fd::RawFd;

use gpsstats_protocol::QoS;

mod error;
mod net;
pub mod gpsd;
pub mod mqtt;
pub mod tls;

pub use error::{Disposition, LinkError};
pub use gpsd::{GpsdLink, GpsdSettings};
pub use mqtt::{MqttAuth, MqttLink, MqttSettings};
pub use tls::{TlsSettings, TlsVersion};

/// A reconnectable, non-blocking connection
pub trait Link {
    /// Decoded unit delivered by [`read_frame`](Link::read_frame)
    type Inbound;

    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Establishes the connection, including any protocol handshake.
    ///
    /// On success the socket is non-blocking and `raw_fd()` returns `Some`.
    fn open(&mut self) -> Result<(), LinkError>;

    /// Descriptor to watch, `None` while closed
    fn raw_fd(&self) -> Option<RawFd>;

    /// Whether output is queued and write readiness is of interest
    fn wants_write(&self) -> bool {
        false
    }

    /// Returns the next complete inbound frame, or `None` once the socket
    /// would block.
    ///
    /// A [`Disposition::Discard`] error consumes only the offending frame; the
    /// caller may keep reading.
    fn read_frame(&mut self) -> Result<Option<Self::Inbound>, LinkError>;

    /// Flushes as much queued output as the socket accepts
    fn on_writable(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    /// Says goodbye to the peer if possible and drops the socket
    fn close(&mut self);
}

/// Message-bus extension of [`Link`]
pub trait BusLink: Link {
    /// Queues a message and tries to flush it immediately
    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), LinkError>;

    /// Periodic keep-alive and output pump
    fn housekeeping(&mut self) -> Result<(), LinkError>;
}
