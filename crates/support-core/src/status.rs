use std::sync::Arc;

use chrono::{DateTime, Utc};
use protocol::{
    ConversationStatus, StatusTransitionRequest, StatusTransitionResponse, StatusUpdate, TriggeredBy,
    VERSION,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StatusError;
use crate::escalation::{EscalationLogEntry, EscalationLogger};
use crate::locks::KeyedLocks;
use crate::ports::{ConversationStore, EscalationQueue, StatusBroadcaster};

/// Whether the table allows moving from `from` to `to`. Same-status requests
/// are always allowed.
pub fn is_valid_transition(from: ConversationStatus, to: ConversationStatus) -> bool {
    use ConversationStatus::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (AiHandling, AwaitingHumanResponse)
            | (AiHandling, Resolved)
            | (AwaitingHumanResponse, AiHandling)
            | (AwaitingHumanResponse, Resolved)
            | (Resolved, AiHandling)
            | (Resolved, AwaitingHumanResponse)
    )
}

/// A validated request to move a conversation to a new status.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub conversation_id: String,
    pub new_status: ConversationStatus,
    pub reason: String,
    pub triggered_by: TriggeredBy,
    pub agent_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl TransitionRequest {
    pub fn new(
        conversation_id: impl Into<String>,
        new_status: ConversationStatus,
        reason: impl Into<String>,
        triggered_by: TriggeredBy,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            new_status,
            reason: reason.into(),
            triggered_by,
            agent_id: None,
            metadata: None,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl TryFrom<StatusTransitionRequest> for TransitionRequest {
    type Error = StatusError;

    fn try_from(wire: StatusTransitionRequest) -> Result<Self, Self::Error> {
        let new_status = wire
            .new_status
            .parse::<ConversationStatus>()
            .map_err(|_| StatusError::InvalidTransition { from: None, to: wire.new_status.clone() })?;
        Ok(Self {
            conversation_id: wire.conversation_id,
            new_status,
            reason: wire.reason,
            triggered_by: wire.triggered_by,
            agent_id: wire.agent_id,
            metadata: wire.metadata,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub conversation_id: String,
    pub previous_status: ConversationStatus,
    pub new_status: ConversationStatus,
    /// False for no-op requests (new status equal to current).
    pub changed: bool,
    pub updated_at: DateTime<Utc>,
}

impl TransitionOutcome {
    pub fn to_response(&self) -> StatusTransitionResponse {
        StatusTransitionResponse {
            success: true,
            previous_status: Some(self.previous_status),
            new_status: Some(self.new_status),
            updated_at: Some(self.updated_at.timestamp_millis()),
            error: None,
        }
    }
}

impl StatusError {
    pub fn to_response(&self) -> StatusTransitionResponse {
        let previous_status = match self {
            StatusError::InvalidTransition { from, .. } => *from,
            _ => None,
        };
        StatusTransitionResponse {
            success: false,
            previous_status,
            new_status: None,
            updated_at: None,
            error: Some(self.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusMachineConfig {
    /// Compare-and-set attempts before giving up with `Conflict`.
    pub max_cas_attempts: u32,
}

impl Default for StatusMachineConfig {
    fn default() -> Self {
        Self { max_cas_attempts: 3 }
    }
}

/// Validates and applies conversation-status transitions.
///
/// Each conversation is serialized by an in-process lock held across
/// read-validate-write; the write itself is a compare-and-set so that writers
/// in other processes sharing the store cannot both win from the same read.
pub struct ConversationStatusMachine {
    store: Arc<dyn ConversationStore>,
    broadcaster: Arc<dyn StatusBroadcaster>,
    logger: Arc<EscalationLogger>,
    /// Conversations leaving `AwaitingHumanResponse` are taken off this queue.
    queue: Option<Arc<dyn EscalationQueue>>,
    locks: KeyedLocks,
    config: StatusMachineConfig,
}

impl ConversationStatusMachine {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        broadcaster: Arc<dyn StatusBroadcaster>,
        logger: Arc<EscalationLogger>,
    ) -> Self {
        Self::with_config(store, broadcaster, logger, StatusMachineConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn ConversationStore>,
        broadcaster: Arc<dyn StatusBroadcaster>,
        logger: Arc<EscalationLogger>,
        config: StatusMachineConfig,
    ) -> Self {
        Self {
            store,
            broadcaster,
            logger,
            queue: None,
            locks: KeyedLocks::new(),
            config: StatusMachineConfig { max_cas_attempts: config.max_cas_attempts.max(1) },
        }
    }

    pub fn with_escalation_queue(mut self, queue: Arc<dyn EscalationQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn logger(&self) -> &Arc<EscalationLogger> {
        &self.logger
    }

    /// Entry point for wire requests; unknown statuses are rejected and logged
    /// without touching the store.
    pub async fn submit(&self, wire: StatusTransitionRequest) -> Result<TransitionOutcome, StatusError> {
        let raw = wire.clone();
        match TransitionRequest::try_from(wire) {
            Ok(request) => self.update(request).await,
            Err(err) => {
                warn!(conversation_id = %raw.conversation_id, status = %raw.new_status, "rejecting unknown status");
                self.logger
                    .log_escalation(EscalationLogEntry {
                        id: Uuid::new_v4(),
                        conversation_id: raw.conversation_id,
                        previous_status: None,
                        new_status: raw.new_status,
                        triggered_by: raw.triggered_by,
                        reason: raw.reason,
                        agent_id: raw.agent_id,
                        metadata: raw.metadata,
                        success: false,
                        error: Some(err.code().to_string()),
                        created_at: Utc::now(),
                    })
                    .await;
                Err(err)
            }
        }
    }

    pub async fn update(&self, request: TransitionRequest) -> Result<TransitionOutcome, StatusError> {
        let _guard = self.locks.lock(&request.conversation_id).await;

        let (previous, result) = self.apply(&request).await;
        self.record(&request, previous, &result).await;

        if let Ok(outcome) = &result {
            if outcome.changed {
                info!(
                    conversation_id = %outcome.conversation_id,
                    from = %outcome.previous_status,
                    to = %outcome.new_status,
                    triggered_by = %request.triggered_by,
                    "conversation status changed"
                );
                self.publish(&request, outcome).await;
                if outcome.previous_status == ConversationStatus::AwaitingHumanResponse {
                    self.dequeue(&outcome.conversation_id).await;
                }
            } else {
                debug!(conversation_id = %outcome.conversation_id, status = %outcome.new_status, "no-op transition");
            }
        }
        result
    }

    /// Returns the last observed status alongside the result so failed attempts
    /// can still be logged with it.
    async fn apply(
        &self,
        request: &TransitionRequest,
    ) -> (Option<ConversationStatus>, Result<TransitionOutcome, StatusError>) {
        let id = request.conversation_id.as_str();
        let mut observed = None;

        for attempt in 1..=self.config.max_cas_attempts {
            let current = match self.store.get_status(id).await {
                Ok(Some(record)) => record.status,
                Ok(None) => return (observed, Err(StatusError::NotFound(id.to_string()))),
                Err(e) => return (observed, Err(StatusError::Store(e))),
            };
            observed = Some(current);

            if !is_valid_transition(current, request.new_status) {
                return (
                    observed,
                    Err(StatusError::InvalidTransition {
                        from: Some(current),
                        to: request.new_status.to_string(),
                    }),
                );
            }

            if current == request.new_status {
                return (
                    observed,
                    Ok(TransitionOutcome {
                        conversation_id: id.to_string(),
                        previous_status: current,
                        new_status: current,
                        changed: false,
                        updated_at: Utc::now(),
                    }),
                );
            }

            match self
                .store
                .compare_and_set_status(id, current, request.new_status, request.agent_id.as_deref())
                .await
            {
                Ok(true) => {
                    return (
                        observed,
                        Ok(TransitionOutcome {
                            conversation_id: id.to_string(),
                            previous_status: current,
                            new_status: request.new_status,
                            changed: true,
                            updated_at: Utc::now(),
                        }),
                    )
                }
                Ok(false) => {
                    debug!(conversation_id = %id, attempt, "status changed underneath us, retrying");
                }
                Err(e) => return (observed, Err(StatusError::Store(e))),
            }
        }

        warn!(conversation_id = %id, attempts = self.config.max_cas_attempts, "giving up on contended transition");
        (
            observed,
            Err(StatusError::Conflict {
                conversation_id: id.to_string(),
                attempts: self.config.max_cas_attempts,
            }),
        )
    }

    async fn record(
        &self,
        request: &TransitionRequest,
        previous: Option<ConversationStatus>,
        result: &Result<TransitionOutcome, StatusError>,
    ) {
        let (success, error, created_at) = match result {
            Ok(outcome) => (true, None, outcome.updated_at),
            Err(e) => (false, Some(e.code().to_string()), Utc::now()),
        };
        self.logger
            .log_escalation(EscalationLogEntry {
                id: Uuid::new_v4(),
                conversation_id: request.conversation_id.clone(),
                previous_status: previous,
                new_status: request.new_status.as_str().to_string(),
                triggered_by: request.triggered_by,
                reason: request.reason.clone(),
                agent_id: request.agent_id.clone(),
                metadata: request.metadata.clone(),
                success,
                error,
                created_at,
            })
            .await;
    }

    async fn publish(&self, request: &TransitionRequest, outcome: &TransitionOutcome) {
        let update = StatusUpdate {
            v: Some(VERSION),
            conversation_id: outcome.conversation_id.clone(),
            previous_status: Some(outcome.previous_status),
            status: outcome.new_status,
            reason: Some(request.reason.clone()),
            triggered_by: request.triggered_by,
            assignee: request.agent_id.clone(),
            updated_at: outcome.updated_at.timestamp_millis(),
        };
        if let Err(e) = self.broadcaster.broadcast(&update).await {
            warn!(conversation_id = %outcome.conversation_id, "status broadcast failed: {:#}", e);
        }
    }

    async fn dequeue(&self, conversation_id: &str) {
        let Some(queue) = &self.queue else { return };
        match queue.remove(conversation_id).await {
            Ok(true) => debug!(conversation_id, "removed from escalation queue"),
            Ok(false) => {}
            Err(e) => warn!(conversation_id, "failed to remove escalation from queue: {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConversationStatus::*;

    #[test]
    fn transition_table() {
        for from in ConversationStatus::ALL {
            assert!(is_valid_transition(from, from), "no-op from {from} must pass");
        }
        assert!(is_valid_transition(AiHandling, AwaitingHumanResponse));
        assert!(is_valid_transition(AiHandling, Resolved));
        assert!(is_valid_transition(AwaitingHumanResponse, AiHandling));
        assert!(is_valid_transition(AwaitingHumanResponse, Resolved));
        assert!(is_valid_transition(Resolved, AiHandling));
        assert!(is_valid_transition(Resolved, AwaitingHumanResponse));
    }

    #[test]
    fn unknown_wire_status_is_invalid_transition() {
        let wire = StatusTransitionRequest {
            conversation_id: "c1".into(),
            new_status: "escalated".into(),
            reason: "x".into(),
            triggered_by: TriggeredBy::Agent,
            agent_id: None,
            metadata: None,
        };
        let err = TransitionRequest::try_from(wire).unwrap_err();
        assert!(matches!(err, StatusError::InvalidTransition { from: None, ref to } if to == "escalated"));
    }

    #[test]
    fn outcome_maps_to_wire_response() {
        let outcome = TransitionOutcome {
            conversation_id: "c1".into(),
            previous_status: Resolved,
            new_status: AiHandling,
            changed: true,
            updated_at: Utc::now(),
        };
        let response = outcome.to_response();
        assert!(response.success);
        assert_eq!(response.previous_status, Some(Resolved));
        assert_eq!(response.new_status, Some(AiHandling));
        assert!(response.error.is_none());
    }
}
