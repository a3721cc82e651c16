//! Link error taxonomy

use std::collections::TryReserveError;

use gpsstats_protocol::{ConnectReturnCode, ProtocolError};
use thiserror::Error;

/// What a supervisor should do about a [`LinkError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Connectivity is gone or unusable: tear down and retry with backoff
    Reconnect,
    /// One frame was bad: log it and keep reading
    Discard,
    /// The supervisor cannot continue until it is rebuilt
    Fatal,
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection refused by broker: {0}")]
    Refused(ConnectReturnCode),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("No PINGRESP within the keep-alive period")]
    KeepAliveTimeout,

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Inbound data exceeds {0} bytes without a complete frame")]
    Overflow(usize),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Peer reported an error: {0}")]
    Remote(String),

    #[error("Buffer allocation failed: {0}")]
    OutOfMemory(#[from] TryReserveError),

    #[error("Link setup failed: {0}")]
    Setup(String),
}

impl LinkError {
    pub fn disposition(&self) -> Disposition {
        match self {
            LinkError::Io(_)
            | LinkError::Closed
            | LinkError::NotConnected
            | LinkError::Refused(_)
            | LinkError::HandshakeTimeout
            | LinkError::KeepAliveTimeout
            | LinkError::Overflow(_)
            | LinkError::Tls(_) => Disposition::Reconnect,
            LinkError::Protocol(e) if e.is_desync() => Disposition::Reconnect,
            LinkError::Protocol(_) | LinkError::Malformed(_) | LinkError::Remote(_) => {
                Disposition::Discard
            },
            LinkError::OutOfMemory(_) | LinkError::Setup(_) => Disposition::Fatal,
        }
    }
}
