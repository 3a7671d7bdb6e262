//! Liveness bookkeeping for one link session.
//!
//! The watchdog declares a session dead once no liveness response arrived
//! within the timeout window. The verdict is latched: [`Heartbeat::expired`]
//! reports it exactly once, so the owner tears down and reconnects once per
//! dead session no matter how many probe cycles it keeps polling.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    last_ack_at: Instant,
    dead: bool,
}

impl Heartbeat {
    /// `started_at` counts as the first liveness signal (the handshake).
    pub fn new(interval: Duration, timeout: Duration, started_at: Instant) -> Self {
        Self {
            interval,
            timeout,
            last_ack_at: started_at,
            dead: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn on_ack(&mut self, now: Instant) {
        if !self.dead {
            self.last_ack_at = now;
        }
    }

    /// Returns `true` the first time the timeout window has been exceeded.
    pub fn expired(&mut self, now: Instant) -> bool {
        if self.dead {
            return false;
        }
        if now.saturating_duration_since(self.last_ack_at) > self.timeout {
            self.dead = true;
            return true;
        }
        false
    }
}
