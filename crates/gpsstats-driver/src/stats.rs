//! Per-connection statistics
//!
//! Lifetime counters kept in atomics so reads never disturb the event loop.
//! The registry hands out one shared [`LinkMetrics`] per connection; rebuilt
//! supervisors receive the same instance, so totals survive reconnects and
//! configuration reloads.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::host::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connect,
    Disconnect,
    Receive,
    Send,
}

#[derive(Debug, Default)]
pub struct LinkMetrics {
    pub connects: AtomicU64,
    pub disconnects: AtomicU64,
    pub events_in: AtomicU64,
    pub events_out: AtomicU64,
    /// Unix seconds of the last receive/send, 0 if none
    pub last_event: AtomicU64,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: LinkEvent) {
        let counter = match event {
            LinkEvent::Connect => &self.connects,
            LinkEvent::Disconnect => &self.disconnects,
            LinkEvent::Receive => &self.events_in,
            LinkEvent::Send => &self.events_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if matches!(event, LinkEvent::Receive | LinkEvent::Send) {
            let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
            self.last_event.store(now, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let last_event = match self.last_event.load(Ordering::Relaxed) {
            0 => None,
            secs => i64::try_from(secs)
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        };
        StatsSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            events_in: self.events_in.load(Ordering::Relaxed),
            events_out: self.events_out.load(Ordering::Relaxed),
            last_event,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connects: u64,
    pub disconnects: u64,
    pub events_in: u64,
    pub events_out: u64,
    pub last_event: Option<DateTime<Utc>>,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connects={} disconnects={} events_in={} events_out={} last_event=",
            self.connects, self.disconnects, self.events_in, self.events_out
        )?;
        match self.last_event {
            Some(at) => write!(f, "{}", at.to_rfc3339()),
            None => f.write_str("never"),
        }
    }
}

#[derive(Debug, Default)]
pub struct StatsRegistry {
    feed: Arc<LinkMetrics>,
    bus: Arc<LinkMetrics>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self, conn: ConnId) -> Arc<LinkMetrics> {
        match conn {
            ConnId::Feed => Arc::clone(&self.feed),
            ConnId::Bus => Arc::clone(&self.bus),
        }
    }

    pub fn snapshot(&self, conn: ConnId) -> StatsSnapshot {
        match conn {
            ConnId::Feed => self.feed.snapshot(),
            ConnId::Bus => self.bus.snapshot(),
        }
    }
}
