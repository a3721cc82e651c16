//! Orchestrator
//!
//! Owns both supervisors, the [`Differ`] and the [`StatsRegistry`], and turns
//! host [`Event`]s into work:
//!
//! - feed readings go through the differ, get encoded and are published on
//!   the bus
//! - reload rebuilds both supervisors from fresh configuration, keeping the
//!   differ state and statistics
//! - a housekeeping timer keeps the bus alive and restarts idle supervisors

use std::fmt;
use std::time::Duration;

use gpsstats_link::{BusLink, Link};
use gpsstats_protocol::{GpsData, QoS};
use tracing::{debug, error, info, warn};

use crate::error::{OrchestratorError, SupervisorError};
use crate::host::{ConnId, Event, EventHost, SignalKind, Task, TaskId};
use crate::payload;
use crate::stats::StatsRegistry;
use crate::supervisor::Supervisor;
use crate::telemetry::{ChangeResult, Differ};

/// Topic snapshots are published on
pub const TOPIC: &str = "gpsstats";

pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            topic: TOPIC.to_string(),
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }
}

/// A freshly configured pair of links
pub struct Links<F, B> {
    pub feed: F,
    pub bus: B,
    pub publish: PublishOptions,
}

/// Builds links from the current configuration
pub trait LinkProvider {
    type Feed: Link<Inbound = GpsData>;
    type Bus: BusLink<Inbound: fmt::Debug>;

    /// Fails with [`OrchestratorError::Config`] when the configuration is invalid
    fn provide(&mut self) -> Result<Links<Self::Feed, Self::Bus>, OrchestratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Shutdown,
}

pub struct Orchestrator<P: LinkProvider> {
    provider: P,
    feed: Supervisor<P::Feed>,
    bus: Supervisor<P::Bus>,
    publish: PublishOptions,
    differ: Differ,
    stats: StatsRegistry,
    housekeeping: Option<TaskId>,
}

impl<P: LinkProvider> Orchestrator<P> {
    /// Builds the initial links; a configuration error here is returned as is
    pub fn new(mut provider: P) -> Result<Self, OrchestratorError> {
        let links = provider.provide()?;
        let stats = StatsRegistry::new();
        Ok(Self {
            feed: Supervisor::new(ConnId::Feed, links.feed, stats.metrics(ConnId::Feed)),
            bus: Supervisor::new(ConnId::Bus, links.bus, stats.metrics(ConnId::Bus)),
            publish: links.publish,
            provider,
            differ: Differ::new(),
            stats,
            housekeeping: None,
        })
    }

    pub fn feed(&self) -> &Supervisor<P::Feed> {
        &self.feed
    }

    pub fn bus(&self) -> &Supervisor<P::Bus> {
        &self.bus
    }

    pub fn stats(&self) -> &StatsRegistry {
        &self.stats
    }

    pub fn differ(&self) -> &Differ {
        &self.differ
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    /// Connects both supervisors and starts the housekeeping timer
    pub fn start<H: EventHost>(&mut self, host: &mut H) {
        self.connect_all(host);
        self.housekeeping = Some(host.schedule(HOUSEKEEPING_INTERVAL, Task::Housekeeping));
    }

    pub fn handle<H: EventHost>(&mut self, host: &mut H, event: Event) -> Control {
        match event {
            Event::Readable(ConnId::Feed) => self.on_feed_readable(host),
            Event::Readable(ConnId::Bus) => {
                let result = self
                    .bus
                    .on_readable(host, |packet| debug!(?packet, "broker packet"));
                log_halt(result);
            },
            Event::Writable(ConnId::Feed) => log_halt(self.feed.on_writable(host)),
            Event::Writable(ConnId::Bus) => log_halt(self.bus.on_writable(host)),
            Event::Timer { id, task } => self.on_timer(host, id, task),
            Event::Signal(SignalKind::Reload) => self.reload(host),
            Event::Signal(SignalKind::DumpStats) => self.dump_stats(),
            Event::Signal(SignalKind::Shutdown) => {
                self.shutdown(host);
                return Control::Shutdown;
            },
        }
        Control::Continue
    }

    /// Tears both connections down and stops housekeeping
    pub fn shutdown<H: EventHost>(&mut self, host: &mut H) {
        info!("Shutting down");
        if let Some(id) = self.housekeeping.take() {
            host.cancel(id);
        }
        self.feed.disconnect(host);
        self.bus.disconnect(host);
    }

    pub fn dump_stats(&self) {
        info!("gpsd stats: {}", self.stats.snapshot(ConnId::Feed));
        info!("mqtt stats: {}", self.stats.snapshot(ConnId::Bus));
    }

    fn connect_all<H: EventHost>(&mut self, host: &mut H) {
        log_halt(self.feed.connect(host));
        log_halt(self.bus.connect(host));
    }

    fn on_feed_readable<H: EventHost>(&mut self, host: &mut H) {
        let mut payloads = Vec::new();
        let differ = &mut self.differ;
        let result = self.feed.on_readable(host, |reading| {
            if let ChangeResult::Publish(snapshot) = differ.observe(&reading) {
                match payload::encode(&snapshot) {
                    Ok(payload) => payloads.push(payload),
                    Err(e) => error!("Snapshot not encoded: {}", e),
                }
            }
        });
        log_halt(result);

        for payload in payloads {
            let PublishOptions {
                ref topic,
                qos,
                retain,
            } = self.publish;
            match self.bus.publish(host, topic, &payload, qos, retain) {
                Ok(true) => debug!("Published {} bytes on {}", payload.len(), topic),
                Ok(false) => debug!("Snapshot dropped, bus unavailable"),
                Err(e) => error!("{}", e),
            }
        }
    }

    fn on_timer<H: EventHost>(&mut self, host: &mut H, id: TaskId, task: Task) {
        match task {
            Task::Reconnect(ConnId::Feed) => log_halt(self.feed.on_timer(host, id).map(drop)),
            Task::Reconnect(ConnId::Bus) => log_halt(self.bus.on_timer(host, id).map(drop)),
            Task::Housekeeping => {
                if self.housekeeping != Some(id) {
                    debug!("Ignoring stale housekeeping task {:?}", id);
                    return;
                }
                log_halt(self.bus.housekeeping(host));
                self.feed.ensure_retry(host);
                self.housekeeping = Some(host.schedule(HOUSEKEEPING_INTERVAL, Task::Housekeeping));
            },
        }
    }

    /// Swaps in freshly configured links; keeps the current ones on error
    fn reload<H: EventHost>(&mut self, host: &mut H) {
        info!("Reloading configuration");
        let links = match self.provider.provide() {
            Ok(links) => links,
            Err(e) => {
                warn!("Reload rejected, keeping current connections: {}", e);
                return;
            },
        };

        self.feed.disconnect(host);
        self.bus.disconnect(host);
        self.feed = Supervisor::new(
            ConnId::Feed,
            links.feed,
            self.stats.metrics(ConnId::Feed),
        );
        self.bus = Supervisor::new(ConnId::Bus, links.bus, self.stats.metrics(ConnId::Bus));
        self.publish = links.publish;
        self.connect_all(host);
    }
}

fn log_halt(result: Result<(), SupervisorError>) {
    if let Err(e) = result {
        error!("{}; waiting for a configuration reload", e);
    }
}
