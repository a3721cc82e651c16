//! Test infrastructure: a recording event host, scripted links and a provider

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gpsstats_driver::{
    ConnId, Event, EventHost, HandlerId, HostError, Interest, LinkProvider, Links,
    OrchestratorError, PublishOptions, Task, TaskId,
};
use gpsstats_link::{BusLink, Link, LinkError};
use gpsstats_protocol::{FixMode, GpsData, Packet, QoS, SkySatellite, Timestamp};

// ============================================================================
// Host
// ============================================================================

#[derive(Debug, Default)]
pub struct FakeHost {
    next_task: u64,
    next_handler: usize,
    /// Tasks scheduled and neither fired nor cancelled
    pub timers: Vec<(TaskId, Duration, Task)>,
    /// Every schedule() call, in order
    pub history: Vec<(TaskId, Duration, Task)>,
    pub cancelled: Vec<TaskId>,
    pub handlers: HashMap<HandlerId, (ConnId, RawFd, Interest)>,
    pub registrations: Vec<ConnId>,
    pub reregistrations: Vec<(HandlerId, Interest)>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconnect delays scheduled for `conn`, in seconds
    pub fn reconnect_delays(&self, conn: ConnId) -> Vec<u64> {
        self.history
            .iter()
            .filter(|(_, _, task)| *task == Task::Reconnect(conn))
            .map(|(_, delay, _)| delay.as_secs())
            .collect()
    }

    /// The live timer for `task`, if any
    pub fn timer_for(&self, task: Task) -> Option<TaskId> {
        self.timers
            .iter()
            .find(|(_, _, t)| *t == task)
            .map(|(id, _, _)| *id)
    }

    /// Removes the live timer for `task` and returns its event
    pub fn fire(&mut self, task: Task) -> Event {
        let id = self
            .timer_for(task)
            .unwrap_or_else(|| panic!("no timer scheduled for {:?}", task));
        self.timers.retain(|(t, _, _)| *t != id);
        Event::Timer { id, task }
    }

    pub fn registered(&self, conn: ConnId) -> usize {
        self.handlers.values().filter(|(c, _, _)| *c == conn).count()
    }

    pub fn interest(&self, conn: ConnId) -> Option<Interest> {
        self.handlers
            .values()
            .find(|(c, _, _)| *c == conn)
            .map(|(_, _, interest)| *interest)
    }
}

impl EventHost for FakeHost {
    fn register(
        &mut self,
        conn: ConnId,
        fd: RawFd,
        interest: Interest,
    ) -> Result<HandlerId, HostError> {
        assert_eq!(self.registered(conn), 0, "{} registered twice", conn);
        self.next_handler += 1;
        let handler = HandlerId(self.next_handler);
        self.handlers.insert(handler, (conn, fd, interest));
        self.registrations.push(conn);
        Ok(handler)
    }

    fn reregister(
        &mut self,
        handler: HandlerId,
        _fd: RawFd,
        interest: Interest,
    ) -> Result<(), HostError> {
        let entry = self
            .handlers
            .get_mut(&handler)
            .expect("reregister of unknown handler");
        entry.2 = interest;
        self.reregistrations.push((handler, interest));
        Ok(())
    }

    fn deregister(&mut self, handler: HandlerId, _fd: RawFd) {
        assert!(
            self.handlers.remove(&handler).is_some(),
            "deregister of unknown handler"
        );
    }

    fn schedule(&mut self, delay: Duration, task: Task) -> TaskId {
        self.next_task += 1;
        let id = TaskId(self.next_task);
        self.timers.push((id, delay, task));
        self.history.push((id, delay, task));
        id
    }

    fn cancel(&mut self, id: TaskId) {
        self.timers.retain(|(t, _, _)| *t != id);
        self.cancelled.push(id);
    }
}

// ============================================================================
// Links
// ============================================================================

/// Shared, scriptable state of a fake link
pub struct Script<T> {
    /// Results of successive `open()` calls; `Ok` once exhausted
    pub open_results: VecDeque<Result<(), LinkError>>,
    pub inbound: VecDeque<Result<T, LinkError>>,
    pub publish_errors: VecDeque<LinkError>,
    pub housekeeping_errors: VecDeque<LinkError>,
    pub published: Vec<(String, Vec<u8>, QoS, bool)>,
    pub opens: usize,
    pub closes: usize,
    pub housekeeping_calls: usize,
    pub is_open: bool,
    pub wants_write: bool,
}

impl<T> Default for Script<T> {
    fn default() -> Self {
        Self {
            open_results: VecDeque::new(),
            inbound: VecDeque::new(),
            publish_errors: VecDeque::new(),
            housekeeping_errors: VecDeque::new(),
            published: Vec::new(),
            opens: 0,
            closes: 0,
            housekeeping_calls: 0,
            is_open: false,
            wants_write: false,
        }
    }
}

pub type ScriptHandle<T> = Arc<Mutex<Script<T>>>;

pub struct FakeLink<T> {
    name: &'static str,
    fd: RawFd,
    script: ScriptHandle<T>,
}

impl<T> FakeLink<T> {
    pub fn new(name: &'static str, fd: RawFd) -> (Self, ScriptHandle<T>) {
        let script = Arc::new(Mutex::new(Script::default()));
        (
            Self {
                name,
                fd,
                script: Arc::clone(&script),
            },
            script,
        )
    }
}

impl<T> Link for FakeLink<T> {
    type Inbound = T;

    fn name(&self) -> &'static str {
        self.name
    }

    fn open(&mut self) -> Result<(), LinkError> {
        let mut script = self.script.lock().unwrap();
        script.opens += 1;
        let result = script.open_results.pop_front().unwrap_or(Ok(()));
        script.is_open = result.is_ok();
        result
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.script.lock().unwrap().is_open.then_some(self.fd)
    }

    fn wants_write(&self) -> bool {
        self.script.lock().unwrap().wants_write
    }

    fn read_frame(&mut self) -> Result<Option<T>, LinkError> {
        let mut script = self.script.lock().unwrap();
        if !script.is_open {
            return Err(LinkError::NotConnected);
        }
        match script.inbound.pop_front() {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn on_writable(&mut self) -> Result<(), LinkError> {
        self.script.lock().unwrap().wants_write = false;
        Ok(())
    }

    fn close(&mut self) {
        let mut script = self.script.lock().unwrap();
        if script.is_open {
            script.closes += 1;
        }
        script.is_open = false;
    }
}

impl BusLink for FakeLink<Packet> {
    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), LinkError> {
        let mut script = self.script.lock().unwrap();
        if !script.is_open {
            return Err(LinkError::NotConnected);
        }
        if let Some(e) = script.publish_errors.pop_front() {
            return Err(e);
        }
        script
            .published
            .push((topic.to_string(), payload.to_vec(), qos, retain));
        Ok(())
    }

    fn housekeeping(&mut self) -> Result<(), LinkError> {
        let mut script = self.script.lock().unwrap();
        script.housekeeping_calls += 1;
        match script.housekeeping_errors.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub type FeedLink = FakeLink<GpsData>;
pub type BusLinkFake = FakeLink<Packet>;

pub const FEED_FD: RawFd = 10;
pub const BUS_FD: RawFd = 11;

pub fn feed_link() -> (FeedLink, ScriptHandle<GpsData>) {
    FakeLink::new("gpsd", FEED_FD)
}

pub fn bus_link() -> (BusLinkFake, ScriptHandle<Packet>) {
    FakeLink::new("mqtt", BUS_FD)
}

// ============================================================================
// Provider
// ============================================================================

/// Hands out fresh fake links; each `provide()` records their scripts
#[derive(Default)]
pub struct FakeProvider {
    pub feeds: Vec<ScriptHandle<GpsData>>,
    pub buses: Vec<ScriptHandle<Packet>>,
    /// Scripts applied to the next links handed out
    pub next_feed: Option<Script<GpsData>>,
    pub next_bus: Option<Script<Packet>>,
    pub reject_next: bool,
    pub publish: PublishOptions,
}

impl FakeProvider {
    pub fn feed(&self) -> ScriptHandle<GpsData> {
        Arc::clone(self.feeds.last().expect("no feed provided yet"))
    }

    pub fn bus(&self) -> ScriptHandle<Packet> {
        Arc::clone(self.buses.last().expect("no bus provided yet"))
    }
}

impl LinkProvider for FakeProvider {
    type Feed = FeedLink;
    type Bus = BusLinkFake;

    fn provide(&mut self) -> Result<Links<FeedLink, BusLinkFake>, OrchestratorError> {
        if std::mem::take(&mut self.reject_next) {
            return Err(OrchestratorError::Config("mqtt.qos must be 0, 1 or 2".into()));
        }
        let (feed, feed_script) = feed_link();
        let (bus, bus_script) = bus_link();
        if let Some(script) = self.next_feed.take() {
            *feed_script.lock().unwrap() = script;
        }
        if let Some(script) = self.next_bus.take() {
            *bus_script.lock().unwrap() = script;
        }
        self.feeds.push(feed_script);
        self.buses.push(bus_script);
        Ok(Links {
            feed,
            bus,
            publish: self.publish.clone(),
        })
    }
}

// ============================================================================
// Readings
// ============================================================================

/// A 3D fix with `used` GPS satellites and `visible` total
pub fn reading(used: u32, visible: u32, tdop: f64) -> GpsData {
    let mut data = GpsData::new();
    data.fix_mode = FixMode::Fix3d;
    data.fix_time = Timestamp::new(1_700_000_000, 0);
    data.tdop = tdop;
    for svid in 1..=visible {
        data.skyview.push(SkySatellite {
            gnssid: Some(0),
            svid: svid as u16,
            ss: 30.0,
            used: svid <= used,
        });
    }
    data.satellites_used = used;
    data.satellites_visible = visible;
    data
}

pub fn refused() -> LinkError {
    LinkError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "connection refused",
    ))
}

pub fn out_of_memory() -> LinkError {
    LinkError::OutOfMemory(Vec::<u8>::new().try_reserve(usize::MAX).unwrap_err())
}
