//! Event host interface
//!
//! The host owns readiness polling and timers. Supervisors borrow it for the
//! duration of a call to register descriptors and schedule retries; the host
//! reports back through typed [`Event`]s.

use std::os::fd::RawFd;
use std::time::Duration;

use thiserror::Error;

/// The two supervised connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnId {
    /// gpsd client
    Feed,
    /// MQTT publisher
    Bus,
}

impl ConnId {
    pub fn name(self) -> &'static str {
        match self {
            ConnId::Feed => "feed",
            ConnId::Bus => "bus",
        }
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies one scheduled timer task. Never reused by a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

/// Identifies a descriptor registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub usize);

/// Work carried by a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Tear down and reopen one connection
    Reconnect(ConnId),
    /// Periodic keep-alive and retry check
    Housekeeping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Reload,
    DumpStats,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Readable(ConnId),
    Writable(ConnId),
    Timer { id: TaskId, task: Task },
    Signal(SignalKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    ReadWrite,
}

impl Interest {
    pub fn from_wants_write(wants_write: bool) -> Self {
        if wants_write {
            Interest::ReadWrite
        } else {
            Interest::Read
        }
    }
}

#[derive(Error, Debug)]
#[error("Event host error: {0}")]
pub struct HostError(#[from] pub std::io::Error);

pub trait EventHost {
    /// Starts watching `fd` and reporting readiness for `conn`
    fn register(&mut self, conn: ConnId, fd: RawFd, interest: Interest)
    -> Result<HandlerId, HostError>;

    fn reregister(
        &mut self,
        handler: HandlerId,
        fd: RawFd,
        interest: Interest,
    ) -> Result<(), HostError>;

    /// Stops watching; must be called while `fd` is still open
    fn deregister(&mut self, handler: HandlerId, fd: RawFd);

    /// Delivers `Event::Timer { id, task }` after `delay`
    fn schedule(&mut self, delay: Duration, task: Task) -> TaskId;

    /// Drops a scheduled task; unknown ids are ignored
    fn cancel(&mut self, id: TaskId);
}
