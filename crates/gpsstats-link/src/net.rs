//! TCP helpers shared by the links

use std::io::{self, ErrorKind};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::LinkError;

/// Resolves `host:port` and connects to the first address that answers.
///
/// The returned stream is still blocking, with read/write timeouts set to
/// `timeout` so handshakes are bounded.
pub(crate) fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, LinkError> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            },
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_err = Some(e);
            },
        }
    }
    Err(LinkError::Io(last_err.unwrap_or_else(|| {
        io::Error::new(
            ErrorKind::NotFound,
            format!("{}:{} did not resolve to any address", host, port),
        )
    })))
}

/// Switches a connected stream into event-loop mode
pub(crate) fn make_nonblocking(stream: &TcpStream) -> Result<(), LinkError> {
    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)?;
    stream.set_nonblocking(true)?;
    Ok(())
}

pub(crate) fn is_would_block(err: &io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
}

pub(crate) fn is_interrupted(err: &io::Error) -> bool {
    err.kind() == ErrorKind::Interrupted
}
