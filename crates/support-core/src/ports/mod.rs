pub mod dispatch;
pub mod store;

pub use dispatch::{EscalationPriority, EscalationQueue, Notification, Notifier, QueueEntry};
pub use store::{ConversationContext, ConversationStore, StatusRecord};

use anyhow::Result;
use async_trait::async_trait;

use crate::triage::TriageRule;

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Rules with `is_active == true`.
    async fn active_rules(&self) -> Result<Vec<TriageRule>>;
}

/// Fan-out of status changes to every live client of a conversation.
#[async_trait]
pub trait StatusBroadcaster: Send + Sync {
    async fn broadcast(&self, update: &protocol::StatusUpdate) -> Result<()>;
}
