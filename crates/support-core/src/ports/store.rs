use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use protocol::ConversationStatus;
use serde::{Deserialize, Serialize};

/// Persistence seam for conversation status and the facts triage reads.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, conversation_id: &str, token: &str) -> Result<ConversationContext>;

    async fn conversation_token(&self, conversation_id: &str) -> Result<Option<String>>;

    async fn get_status(&self, conversation_id: &str) -> Result<Option<StatusRecord>>;

    /// Atomically write `new` only if the stored status still equals `expected`.
    async fn compare_and_set_status(
        &self,
        conversation_id: &str,
        expected: ConversationStatus,
        new: ConversationStatus,
        assignee: Option<&str>,
    ) -> Result<bool>;

    async fn load_context(&self, conversation_id: &str) -> Result<Option<ConversationContext>>;

    /// Bump the message counter and remember the latest sentiment, if any.
    async fn record_message(&self, conversation_id: &str, sentiment: Option<f64>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: ConversationStatus,
    pub assignee: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub conversation_id: String,
    pub status: ConversationStatus,
    pub message_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_sentiment: Option<f64>,
}
