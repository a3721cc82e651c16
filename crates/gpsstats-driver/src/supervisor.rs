//! Connection supervisor
//!
//! One generic state machine keeps a [`Link`] connected:
//!
//! ```text
//!                 open ok
//! Disconnected ──► Connecting ──────────► Connected
//!      ▲               │ transient error     │ transient error
//!      │               ▼                     ▼
//!      └──(teardown)── ReconnectScheduled ◄──┘
//!                      │ timer: disconnect + connect
//!                      └──────► Connecting
//! ```
//!
//! Retries go through the host's timer with exponential backoff. The pending
//! retry is identified by its [`TaskId`]; a timer carrying any other id is stale
//! and ignored. A fatal link error halts the supervisor in `Disconnected` until
//! it is replaced.

use std::sync::Arc;

use gpsstats_link::{BusLink, Disposition, Link, LinkError};
use gpsstats_protocol::QoS;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::error::SupervisorError;
use crate::host::{ConnId, EventHost, HandlerId, Interest, Task, TaskId};
use crate::stats::{LinkEvent, LinkMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
}

pub struct Supervisor<L: Link> {
    conn: ConnId,
    link: L,
    state: ConnState,
    backoff: Backoff,
    pending: Option<TaskId>,
    handler: Option<HandlerId>,
    interest: Interest,
    /// The link holds an open socket that `close()` has to release
    link_open: bool,
    halted: bool,
    metrics: Arc<LinkMetrics>,
}

impl<L: Link> Supervisor<L> {
    pub fn new(conn: ConnId, link: L, metrics: Arc<LinkMetrics>) -> Self {
        Self {
            conn,
            link,
            state: ConnState::Disconnected,
            backoff: Backoff::new(),
            pending: None,
            handler: None,
            interest: Interest::Read,
            link_open: false,
            halted: false,
            metrics,
        }
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn pending_task(&self) -> Option<TaskId> {
        self.pending
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Opens the link and registers it with the host.
    ///
    /// Transient failures schedule a retry and return `Ok`; only a fatal link
    /// error is returned, after halting the supervisor.
    pub fn connect<H: EventHost>(&mut self, host: &mut H) -> Result<(), SupervisorError> {
        if self.halted {
            debug!("{}: halted, not connecting", self.conn);
            return Ok(());
        }
        self.cancel_pending(host);
        self.state = ConnState::Connecting;

        if let Err(e) = self.link.open() {
            self.link.close();
            return self.open_failed(host, e);
        }
        let Some(fd) = self.link.raw_fd() else {
            self.link.close();
            return self.open_failed(host, LinkError::NotConnected);
        };
        let interest = Interest::from_wants_write(self.link.wants_write());
        match host.register(self.conn, fd, interest) {
            Ok(handler) => {
                self.handler = Some(handler);
                self.interest = interest;
            },
            Err(e) => {
                warn!("{}: cannot watch {} socket: {}", self.conn, self.link.name(), e);
                self.link.close();
                self.schedule_retry(host);
                return Ok(());
            },
        }

        self.link_open = true;
        self.state = ConnState::Connected;
        self.backoff.reset();
        self.metrics.record(LinkEvent::Connect);
        info!("{}: {} link connected", self.conn, self.link.name());
        Ok(())
    }

    /// Cancels any retry, unregisters and closes the link. Never fails.
    pub fn disconnect<H: EventHost>(&mut self, host: &mut H) {
        self.cancel_pending(host);
        self.release(host);
        self.state = ConnState::Disconnected;
    }

    /// Drains every complete frame into `sink`
    pub fn on_readable<H, F>(&mut self, host: &mut H, mut sink: F) -> Result<(), SupervisorError>
    where
        H: EventHost,
        F: FnMut(L::Inbound),
    {
        if self.state != ConnState::Connected {
            return Ok(());
        }
        loop {
            match self.link.read_frame() {
                Ok(Some(frame)) => {
                    self.metrics.record(LinkEvent::Receive);
                    sink(frame);
                },
                Ok(None) => break,
                Err(e) => {
                    let disposition = e.disposition();
                    self.handle_error(host, e)?;
                    if disposition != Disposition::Discard {
                        return Ok(());
                    }
                },
            }
        }
        self.update_interest(host);
        Ok(())
    }

    pub fn on_writable<H: EventHost>(&mut self, host: &mut H) -> Result<(), SupervisorError> {
        if self.state != ConnState::Connected {
            return Ok(());
        }
        if let Err(e) = self.link.on_writable() {
            return self.handle_error(host, e);
        }
        self.update_interest(host);
        Ok(())
    }

    /// Runs a timer task addressed to this supervisor.
    ///
    /// Returns `false` when the task is stale and was ignored.
    pub fn on_timer<H: EventHost>(
        &mut self,
        host: &mut H,
        id: TaskId,
    ) -> Result<bool, SupervisorError> {
        if self.pending != Some(id) {
            debug!("{}: ignoring stale reconnect task {:?}", self.conn, id);
            return Ok(false);
        }
        self.pending = None;
        self.disconnect(host);
        self.connect(host)?;
        Ok(true)
    }

    /// Schedules a retry if the supervisor is idle without one
    pub fn ensure_retry<H: EventHost>(&mut self, host: &mut H) {
        if self.state == ConnState::Disconnected && !self.halted && self.pending.is_none() {
            debug!("{}: idle without retry, scheduling one", self.conn);
            self.schedule_retry(host);
        }
    }

    fn open_failed<H: EventHost>(
        &mut self,
        host: &mut H,
        err: LinkError,
    ) -> Result<(), SupervisorError> {
        if err.disposition() == Disposition::Fatal {
            return self.handle_error(host, err);
        }
        warn!("{}: {} connect failed: {}", self.conn, self.link.name(), err);
        self.schedule_retry(host);
        Ok(())
    }

    fn handle_error<H: EventHost>(
        &mut self,
        host: &mut H,
        err: LinkError,
    ) -> Result<(), SupervisorError> {
        match err.disposition() {
            Disposition::Discard => {
                warn!("{}: {} frame discarded: {}", self.conn, self.link.name(), err);
                Ok(())
            },
            Disposition::Reconnect => {
                warn!("{}: {} link failed: {}", self.conn, self.link.name(), err);
                self.request_reconnect(host);
                Ok(())
            },
            Disposition::Fatal => {
                error!("{}: {} link halted: {}", self.conn, self.link.name(), err);
                self.cancel_pending(host);
                self.release(host);
                self.state = ConnState::Disconnected;
                self.halted = true;
                Err(SupervisorError::Fatal {
                    conn: self.conn,
                    source: err,
                })
            },
        }
    }

    /// Stops watching the socket now; the link is closed when the retry runs
    fn request_reconnect<H: EventHost>(&mut self, host: &mut H) {
        if let Some(handler) = self.handler.take() {
            self.deregister(host, handler);
        }
        self.schedule_retry(host);
    }

    fn schedule_retry<H: EventHost>(&mut self, host: &mut H) {
        self.cancel_pending(host);
        let delay = self.backoff.next_delay();
        let id = host.schedule(delay, Task::Reconnect(self.conn));
        self.pending = Some(id);
        self.state = ConnState::ReconnectScheduled;
        info!("{}: reconnecting in {}s", self.conn, delay.as_secs());
    }

    fn cancel_pending<H: EventHost>(&mut self, host: &mut H) {
        if let Some(id) = self.pending.take() {
            host.cancel(id);
        }
    }

    /// Deregisters (while the descriptor is still open), then closes
    fn release<H: EventHost>(&mut self, host: &mut H) {
        if let Some(handler) = self.handler.take() {
            self.deregister(host, handler);
        }
        self.link.close();
        if std::mem::replace(&mut self.link_open, false) {
            self.metrics.record(LinkEvent::Disconnect);
            info!("{}: {} link disconnected", self.conn, self.link.name());
        }
    }

    fn deregister<H: EventHost>(&mut self, host: &mut H, handler: HandlerId) {
        match self.link.raw_fd() {
            Some(fd) => host.deregister(handler, fd),
            None => debug!("{}: no descriptor left to deregister", self.conn),
        }
    }

    fn update_interest<H: EventHost>(&mut self, host: &mut H) {
        let (Some(handler), Some(fd)) = (self.handler, self.link.raw_fd()) else {
            return;
        };
        let interest = Interest::from_wants_write(self.link.wants_write());
        if interest == self.interest {
            return;
        }
        match host.reregister(handler, fd, interest) {
            Ok(()) => self.interest = interest,
            Err(e) => {
                warn!("{}: cannot update socket interest: {}", self.conn, e);
                self.request_reconnect(host);
            },
        }
    }
}

impl<L: BusLink> Supervisor<L> {
    /// Publishes when connected.
    ///
    /// Returns `Ok(true)` when the message was handed to the link and
    /// `Ok(false)` when it was dropped.
    pub fn publish<H: EventHost>(
        &mut self,
        host: &mut H,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<bool, SupervisorError> {
        if self.state != ConnState::Connected {
            debug!("{}: not connected, message dropped", self.conn);
            return Ok(false);
        }
        match self.link.publish(topic, payload, qos, retain) {
            Ok(()) => {
                self.metrics.record(LinkEvent::Send);
                self.update_interest(host);
                Ok(true)
            },
            Err(e) => {
                self.handle_error(host, e)?;
                Ok(false)
            },
        }
    }

    /// Keep-alive pump plus the idle retry check
    pub fn housekeeping<H: EventHost>(&mut self, host: &mut H) -> Result<(), SupervisorError> {
        if self.state == ConnState::Connected {
            match self.link.housekeeping() {
                Ok(()) => self.update_interest(host),
                Err(e) => self.handle_error(host, e)?,
            }
        }
        self.ensure_retry(host);
        Ok(())
    }
}
