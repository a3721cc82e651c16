//! # gpsstats Protocol
//!
//! Wire formats spoken by the gpsstats bridge (no I/O in this crate).
//!
//! ## Modules
//!
//! - `gpsd`: gpsd JSON reports, the `?WATCH` command and the aggregated [`GpsData`] view
//! - `mqtt`: MQTT 3.1.1 packet encoding/decoding for a publish-only client
//!
//! ## Layering
//!
//! ```text
//! Protocol Layer (gpsstats-protocol)   <- this crate, pure codecs
//!     ↓
//! Link Layer (gpsstats-link)           <- sockets, TLS, reconnect-safe open/close
//!     ↓
//! Driver (gpsstats-driver)             <- supervisors, differ, orchestrator
//! ```

pub mod gpsd;
pub mod mqtt;

pub use gpsd::{Constellation, FixMode, GpsData, Report, SkySatellite, Skyview, Timestamp};
pub use mqtt::{ConnectReturnCode, Packet, QoS};

use thiserror::Error;

/// Protocol layer error type
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed JSON report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid time value {value:?}: {reason}")]
    InvalidTime { value: String, reason: String },

    #[error("Invalid packet length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: String, value: u8 },

    /// The variable-length "remaining length" header is corrupt; the stream
    /// can no longer be framed.
    #[error("Malformed remaining length")]
    MalformedRemainingLength,

    #[error("Unsupported packet type: {0}")]
    UnsupportedPacket(u8),

    #[error("String too long for a length prefix: {0} bytes")]
    StringTooLong(usize),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),
}

impl ProtocolError {
    /// Returns `true` when the byte stream can no longer be framed after this error.
    pub fn is_desync(&self) -> bool {
        matches!(self, ProtocolError::MalformedRemainingLength)
    }
}
