use protocol::ConversationStatus;
use thiserror::Error;

/// Failures of a conversation-status transition attempt.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("conversation {0} not found")]
    NotFound(String),

    /// Rejected locally; nothing was written or broadcast.
    #[error("invalid transition from {} to {to}", .from.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into()))]
    InvalidTransition {
        from: Option<ConversationStatus>,
        to: String,
    },

    #[error("conversation {conversation_id} changed concurrently; gave up after {attempts} attempts")]
    Conflict {
        conversation_id: String,
        attempts: u32,
    },

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl StatusError {
    /// Short machine-readable code used on the wire and in the escalation log.
    pub fn code(&self) -> &'static str {
        match self {
            StatusError::NotFound(_) => "not_found",
            StatusError::InvalidTransition { .. } => "invalid_transition",
            StatusError::Conflict { .. } => "conflict",
            StatusError::Store(_) => "store_error",
        }
    }
}

#[derive(Debug, Error)]
pub enum TriageError {
    #[error("conversation {0} not found")]
    NotFound(String),

    #[error("failed to load triage rules: {0}")]
    Rules(#[source] anyhow::Error),

    #[error("failed to load conversation context: {0}")]
    Context(#[source] anyhow::Error),
}
