//! Worker loop: one reactor, one backend session.

use crate::config::Config;
use crate::reactor::Reactor;
use crate::session::Http2Session;

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Owns the event loop and the session it drives. The loop shape is
/// fixed: write scheduler (pre-poll hook), poll, then event dispatch —
/// so `signal_write` coalesces to exactly one drain per turn.
pub struct Worker {
    pub reactor: Reactor,
    pub session: Http2Session,
}

impl Worker {
    pub fn new(config: Arc<Config>) -> io::Result<Self> {
        let mut reactor = Reactor::new()?;
        let session = Http2Session::new(config, &mut reactor)?;
        Ok(Self { reactor, session })
    }

    /// One loop turn, waiting at most `max_wait` for events.
    pub fn turn(&mut self, max_wait: Duration) -> io::Result<()> {
        self.session.prepare(&mut self.reactor);
        let events = self.reactor.poll(max_wait)?;
        for event in events {
            self.session.handle_event(&mut self.reactor, event);
        }
        Ok(())
    }

    /// Drive the loop until `done` reports true or `timeout` elapses.
    /// Returns whether the predicate was satisfied.
    pub fn run_until(
        &mut self,
        timeout: Duration,
        mut done: impl FnMut(&Http2Session) -> bool,
    ) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if done(&self.session) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let wait = (deadline - now).min(Duration::from_millis(20));
            self.turn(wait)?;
        }
    }
}
