use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipients: &[String], notification: &Notification) -> Result<()>;
}

#[async_trait]
pub trait EscalationQueue: Send + Sync {
    async fn enqueue(&self, entry: QueueEntry) -> Result<()>;

    /// Drop the conversation's entry. Returns `false` when it was not queued.
    async fn remove(&self, conversation_id: &str) -> Result<bool>;

    /// Entries ordered by priority (highest first), then by longest wait.
    async fn snapshot(&self) -> Result<Vec<QueueEntry>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub conversation_id: String,
    pub subject: String,
    pub body: String,
    pub priority: EscalationPriority,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl fmt::Display for EscalationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationPriority::Low => write!(f, "low"),
            EscalationPriority::Medium => write!(f, "medium"),
            EscalationPriority::High => write!(f, "high"),
            EscalationPriority::Urgent => write!(f, "urgent"),
        }
    }
}

/// A conversation waiting for a human agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub conversation_id: String,
    pub priority: EscalationPriority,
    pub wait_seconds: i64,
    pub tags: Vec<String>,
    pub rule_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}
