use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub message_id: String,
    pub sent_at: Instant,
    pub timeout_at: Instant,
}

/// Outstanding chat messages awaiting a server confirmation. Each tracked id
/// leaves the map exactly once, through `confirm`, `expire` or `fail_all`.
#[derive(Debug)]
pub struct DeliveryTracker {
    timeout: Duration,
    pending: HashMap<String, PendingDelivery>,
}

impl DeliveryTracker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, pending: HashMap::new() }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns false if the id is already pending.
    pub fn track(&mut self, message_id: &str, now: Instant) -> bool {
        if self.pending.contains_key(message_id) {
            return false;
        }
        self.pending.insert(
            message_id.to_string(),
            PendingDelivery { message_id: message_id.to_string(), sent_at: now, timeout_at: now + self.timeout },
        );
        true
    }

    /// `None` for unknown or already expired ids.
    pub fn confirm(&mut self, message_id: &str) -> Option<PendingDelivery> {
        self.pending.remove(message_id)
    }

    /// Remove and return every entry whose deadline has passed, oldest first.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingDelivery> {
        let due: Vec<String> = self
            .pending
            .values()
            .filter(|p| p.timeout_at <= now)
            .map(|p| p.message_id.clone())
            .collect();
        let mut expired: Vec<PendingDelivery> = due.iter().filter_map(|id| self.pending.remove(id)).collect();
        expired.sort_by_key(|p| p.sent_at);
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.timeout_at).min()
    }

    pub fn fail_all(&mut self) -> Vec<PendingDelivery> {
        let mut all: Vec<PendingDelivery> = self.pending.drain().map(|(_, p)| p).collect();
        all.sort_by_key(|p| p.sent_at);
        all
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
