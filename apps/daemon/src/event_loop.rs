//! mio-based event host
//!
//! One `Poll` services socket readiness. Timers live in a deadline heap with
//! lazy cancellation, and signals are latched by `signal-hook` into atomic
//! flags that the loop turns into [`Event::Signal`] between polls.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use gpsstats_driver::{
    ConnId, Control, Event, EventHost, HandlerId, HostError, Interest, LinkProvider,
    Orchestrator, SignalKind, Task, TaskId,
};
use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use signal_hook::SigId;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1};
use tracing::{debug, info, trace};

/// Upper bound on one poll, so latched signals are noticed promptly
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(250);

const EVENT_CAPACITY: usize = 64;

struct SignalFlags {
    reload: Arc<AtomicBool>,
    dump_stats: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    ids: Vec<SigId>,
}

impl SignalFlags {
    fn register() -> io::Result<Self> {
        let mut flags = Self {
            reload: Arc::new(AtomicBool::new(false)),
            dump_stats: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            ids: Vec::new(),
        };
        let routes = [
            (SIGHUP, &flags.reload),
            (SIGUSR1, &flags.dump_stats),
            (SIGINT, &flags.shutdown),
            (SIGTERM, &flags.shutdown),
            (SIGQUIT, &flags.shutdown),
        ];
        let mut ids = Vec::with_capacity(routes.len());
        for (signal, flag) in routes {
            ids.push(signal_hook::flag::register(signal, Arc::clone(flag))?);
        }
        flags.ids = ids;
        Ok(flags)
    }

    /// Shutdown first: nothing else matters once it is requested
    fn drain(&self, out: &mut Vec<Event>) {
        if self.shutdown.swap(false, Ordering::SeqCst) {
            out.push(Event::Signal(SignalKind::Shutdown));
            return;
        }
        if self.reload.swap(false, Ordering::SeqCst) {
            out.push(Event::Signal(SignalKind::Reload));
        }
        if self.dump_stats.swap(false, Ordering::SeqCst) {
            out.push(Event::Signal(SignalKind::DumpStats));
        }
    }
}

impl Drop for SignalFlags {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

pub struct MioHost {
    poll: Poll,
    events: Events,
    next_token: usize,
    handlers: HashMap<Token, ConnId>,
    next_task: u64,
    deadlines: BinaryHeap<Reverse<(Instant, TaskId)>>,
    /// Live tasks; a heap entry without one here was cancelled
    tasks: HashMap<TaskId, Task>,
    signals: SignalFlags,
}

impl MioHost {
    pub fn new() -> Result<Self, HostError> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            next_token: 0,
            handlers: HashMap::new(),
            next_task: 0,
            deadlines: BinaryHeap::new(),
            tasks: HashMap::new(),
            signals: SignalFlags::register()?,
        })
    }

    /// Runs until a shutdown signal has been handled
    pub fn run<P: LinkProvider>(&mut self, orchestrator: &mut Orchestrator<P>) -> Result<(), HostError> {
        orchestrator.start(self);
        loop {
            for event in self.next_events()? {
                trace!(?event, "dispatch");
                if orchestrator.handle(self, event) == Control::Shutdown {
                    info!("Event loop stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Collects latched signals, expired timers, then one round of readiness
    pub fn next_events(&mut self) -> Result<Vec<Event>, HostError> {
        let mut out = Vec::new();
        self.signals.drain(&mut out);
        if !out.is_empty() {
            return Ok(out);
        }

        self.expire_timers(Instant::now(), &mut out);
        if !out.is_empty() {
            return Ok(out);
        }

        let timeout = self.poll_timeout(Instant::now());
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            // A signal interrupted the wait; its flag is picked up next round
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(out);
            }
            return Err(e.into());
        }
        for event in self.events.iter() {
            let Some(&conn) = self.handlers.get(&event.token()) else {
                continue;
            };
            // Hang-ups and errors surface through the read path
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                out.push(Event::Readable(conn));
            }
            if event.is_writable() {
                out.push(Event::Writable(conn));
            }
        }
        Ok(out)
    }

    fn expire_timers(&mut self, now: Instant, out: &mut Vec<Event>) {
        while let Some(&Reverse((deadline, id))) = self.deadlines.peek() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if let Some(task) = self.tasks.remove(&id) {
                out.push(Event::Timer { id, task });
            }
        }
    }

    fn poll_timeout(&mut self, now: Instant) -> Duration {
        // Drop cancelled entries so they do not shorten the wait
        while let Some(&Reverse((_, id))) = self.deadlines.peek() {
            if self.tasks.contains_key(&id) {
                break;
            }
            self.deadlines.pop();
        }
        match self.deadlines.peek() {
            Some(&Reverse((deadline, _))) => {
                deadline.saturating_duration_since(now).min(MAX_POLL_TIMEOUT)
            },
            None => MAX_POLL_TIMEOUT,
        }
    }
}

fn mio_interest(interest: Interest) -> mio::Interest {
    match interest {
        Interest::Read => mio::Interest::READABLE,
        Interest::ReadWrite => mio::Interest::READABLE | mio::Interest::WRITABLE,
    }
}

impl EventHost for MioHost {
    fn register(
        &mut self,
        conn: ConnId,
        fd: RawFd,
        interest: Interest,
    ) -> Result<HandlerId, HostError> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, mio_interest(interest))?;
        self.handlers.insert(token, conn);
        debug!(%conn, fd, ?interest, "watching socket");
        Ok(HandlerId(token.0))
    }

    fn reregister(
        &mut self,
        handler: HandlerId,
        fd: RawFd,
        interest: Interest,
    ) -> Result<(), HostError> {
        self.poll.registry().reregister(
            &mut SourceFd(&fd),
            Token(handler.0),
            mio_interest(interest),
        )?;
        Ok(())
    }

    fn deregister(&mut self, handler: HandlerId, fd: RawFd) {
        if let Some(conn) = self.handlers.remove(&Token(handler.0)) {
            debug!(%conn, fd, "no longer watching socket");
        }
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            debug!("deregister of fd {} failed: {}", fd, e);
        }
    }

    fn schedule(&mut self, delay: Duration, task: Task) -> TaskId {
        self.next_task += 1;
        let id = TaskId(self.next_task);
        self.deadlines.push(Reverse((Instant::now() + delay, id)));
        self.tasks.insert(id, task);
        id
    }

    fn cancel(&mut self, id: TaskId) {
        self.tasks.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut host = MioHost::new().unwrap();
        let late = host.schedule(Duration::from_millis(20), Task::Housekeeping);
        let early = host.schedule(Duration::ZERO, Task::Reconnect(ConnId::Feed));

        let now = Instant::now() + Duration::from_millis(50);
        let mut out = Vec::new();
        host.expire_timers(now, &mut out);

        assert_eq!(
            out,
            vec![
                Event::Timer {
                    id: early,
                    task: Task::Reconnect(ConnId::Feed)
                },
                Event::Timer {
                    id: late,
                    task: Task::Housekeeping
                },
            ]
        );
        assert!(host.tasks.is_empty());
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let mut host = MioHost::new().unwrap();
        let id = host.schedule(Duration::ZERO, Task::Reconnect(ConnId::Bus));
        host.cancel(id);

        let mut out = Vec::new();
        host.expire_timers(Instant::now() + Duration::from_secs(1), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_poll_timeout_is_bounded() {
        let mut host = MioHost::new().unwrap();
        let now = Instant::now();
        assert_eq!(host.poll_timeout(now), MAX_POLL_TIMEOUT);

        host.schedule(Duration::from_secs(30), Task::Housekeeping);
        assert_eq!(host.poll_timeout(now), MAX_POLL_TIMEOUT);

        let soon = host.schedule(Duration::from_millis(10), Task::Reconnect(ConnId::Feed));
        let after = Instant::now();
        assert!(host.poll_timeout(after) <= Duration::from_millis(10));

        host.cancel(soon);
        assert_eq!(host.poll_timeout(after), MAX_POLL_TIMEOUT);
    }

    #[test]
    fn test_readable_socket_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client.set_nonblocking(true).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let mut host = MioHost::new().unwrap();
        let handler = host
            .register(ConnId::Feed, client.as_raw_fd(), Interest::Read)
            .unwrap();
        server.write_all(b"{}\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = false;
        while Instant::now() < deadline && !seen {
            seen = host
                .next_events()
                .unwrap()
                .contains(&Event::Readable(ConnId::Feed));
        }
        assert!(seen);

        host.deregister(handler, client.as_raw_fd());
        assert!(host.handlers.is_empty());
    }

    #[test]
    fn test_write_interest_reports_writable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client.set_nonblocking(true).unwrap();
        let _server = listener.accept().unwrap();

        let mut host = MioHost::new().unwrap();
        let handler = host
            .register(ConnId::Bus, client.as_raw_fd(), Interest::Read)
            .unwrap();
        host.reregister(handler, client.as_raw_fd(), Interest::ReadWrite)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = false;
        while Instant::now() < deadline && !seen {
            seen = host
                .next_events()
                .unwrap()
                .contains(&Event::Writable(ConnId::Bus));
        }
        assert!(seen);
    }

    #[test]
    fn test_shutdown_signal_takes_precedence() {
        let flags = SignalFlags {
            reload: Arc::new(AtomicBool::new(true)),
            dump_stats: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(AtomicBool::new(true)),
            ids: Vec::new(),
        };
        let mut out = Vec::new();
        flags.drain(&mut out);
        assert_eq!(out, vec![Event::Signal(SignalKind::Shutdown)]);

        flags.shutdown.store(false, Ordering::SeqCst);
        let mut out = Vec::new();
        flags.drain(&mut out);
        assert_eq!(
            out,
            vec![
                Event::Signal(SignalKind::Reload),
                Event::Signal(SignalKind::DumpStats)
            ]
        );
    }

    #[test]
    fn test_sighup_latches_reload() {
        let mut host = MioHost::new().unwrap();
        signal_hook::low_level::raise(SIGHUP).unwrap();

        let events = host.next_events().unwrap();
        assert!(events.contains(&Event::Signal(SignalKind::Reload)));
    }
}
