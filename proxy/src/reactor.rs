//! Single-session event loop built on mio.
//!
//! One socket registration (read/write interest toggled as watchers), plus
//! a small set of repeating timers. The worker drives the loop: pre-poll
//! hook, `poll`, then event dispatch.

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::time::{Duration, Instant};

const SOCKET: Token = Token(0);

/// Handle to a repeating timer owned by the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(usize);

/// An event returned from one poll turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Readable,
    Writable,
    Timer(TimerId),
}

struct Timer {
    interval: Duration,
    deadline: Option<Instant>,
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    timers: Slab<Timer>,
    interest: Option<Interest>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
            timers: Slab::with_capacity(8),
            interest: None,
        })
    }

    /// Create a repeating timer; inactive until `timer_again`.
    pub fn add_timer(&mut self, interval: Duration) -> TimerId {
        TimerId(self.timers.insert(Timer {
            interval,
            deadline: None,
        }))
    }

    /// (Re)arm a timer from its stored interval.
    pub fn timer_again(&mut self, id: TimerId) {
        if let Some(timer) = self.timers.get_mut(id.0) {
            timer.deadline = Some(Instant::now() + timer.interval);
        }
    }

    pub fn timer_stop(&mut self, id: TimerId) {
        if let Some(timer) = self.timers.get_mut(id.0) {
            timer.deadline = None;
        }
    }

    pub fn timer_active(&self, id: TimerId) -> bool {
        self.timers
            .get(id.0)
            .is_some_and(|timer| timer.deadline.is_some())
    }

    /// Set the socket watchers. Passing `false, false` deregisters.
    pub fn watch(&mut self, sock: &mut TcpStream, read: bool, write: bool) -> io::Result<()> {
        let wanted = match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };

        match (self.interest, wanted) {
            (None, None) => {}
            (Some(current), Some(next)) if current == next => {}
            (Some(_), Some(next)) => {
                self.poll.registry().reregister(sock, SOCKET, next)?;
                self.interest = Some(next);
            }
            (None, Some(next)) => {
                self.poll.registry().register(sock, SOCKET, next)?;
                self.interest = Some(next);
            }
            (Some(_), None) => {
                self.poll.registry().deregister(sock)?;
                self.interest = None;
            }
        }
        Ok(())
    }

    /// Drop the socket registration, e.g. before closing the socket.
    pub fn forget(&mut self, sock: &mut TcpStream) {
        if self.interest.take().is_some() {
            let _ = self.poll.registry().deregister(sock);
        }
    }

    /// Wait up to `cap` for I/O or timer expiry. Expired repeating timers
    /// re-arm themselves from their interval.
    pub fn poll(&mut self, cap: Duration) -> io::Result<Vec<Event>> {
        let now = Instant::now();
        let mut timeout = cap;
        for (_, timer) in self.timers.iter() {
            if let Some(deadline) = timer.deadline {
                timeout = timeout.min(deadline.saturating_duration_since(now));
            }
        }

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let mut out = Vec::new();
        for event in self.events.iter() {
            if event.token() != SOCKET {
                continue;
            }
            if event.is_readable() || event.is_read_closed() {
                out.push(Event::Readable);
            }
            if event.is_writable() || event.is_error() {
                out.push(Event::Writable);
            }
        }

        let now = Instant::now();
        for (key, timer) in self.timers.iter_mut() {
            if let Some(deadline) = timer.deadline {
                if deadline <= now {
                    timer.deadline = Some(now + timer.interval);
                    out.push(Event::Timer(TimerId(key)));
                }
            }
        }

        Ok(out)
    }
}
