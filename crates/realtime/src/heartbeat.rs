use std::time::Duration;

use tokio::time::Instant;

/// Tracks liveness of the current link. Stopped while no link is up.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    last_seen: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout, last_seen: None }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn start(&mut self, now: Instant) {
        self.last_seen = Some(now);
    }

    pub fn beat(&mut self, now: Instant) {
        if self.last_seen.is_some() {
            self.last_seen = Some(now);
        }
    }

    pub fn stop(&mut self) {
        self.last_seen = None;
    }

    /// When the link will be declared dead absent another heartbeat.
    pub fn deadline(&self) -> Option<Instant> {
        self.last_seen.map(|t| t + self.timeout)
    }
}
