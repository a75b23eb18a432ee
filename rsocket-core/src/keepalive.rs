//! Keepalive interval and lifetime bookkeeping.
//!
//! Passive: the timer never schedules anything itself. The connection's
//! driver calls `ConnectionStateMachine::on_keepalive_tick` periodically and
//! this tracker answers "is a probe due" and "has the peer gone silent past
//! the lifetime bound". Uses `tokio::time::Instant` so tests can run under a
//! paused clock.

use tokio::time::{Duration, Instant};

#[derive(Debug)]
pub struct KeepaliveTimer {
    interval: Duration,
    max_lifetime: Duration,
    last_sent: Instant,
    last_received: Instant,
}

impl KeepaliveTimer {
    pub fn new(interval: Duration, max_lifetime: Duration, now: Instant) -> Self {
        KeepaliveTimer {
            interval,
            max_lifetime,
            last_sent: now,
            last_received: now,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_lifetime(&self) -> Duration {
        self.max_lifetime
    }

    /// Any inbound frame counts as liveness.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_received = now;
    }

    /// Whether a KEEPALIVE probe is due.
    pub fn should_send(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_sent) >= self.interval
    }

    pub fn mark_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// Whether the peer has been silent longer than the maximum lifetime.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_received) >= self.max_lifetime
    }

    /// When the driver should tick next: the earlier of the next probe and
    /// the lifetime deadline.
    pub fn next_deadline(&self) -> Instant {
        let send_at = self.last_sent + self.interval;
        let expire_at = self.last_received + self.max_lifetime;
        send_at.min(expire_at)
    }

    /// Reset both clocks, used when a transport is (re)attached.
    pub fn rearm(&mut self, now: Instant) {
        self.last_sent = now;
        self.last_received = now;
    }
}
