pub mod error;
pub mod escalation;
pub mod locks;
pub mod memory;
pub mod ports;
pub mod status;
pub mod triage;

pub use error::{StatusError, TriageError};
pub use escalation::{EscalationLogEntry, EscalationLogger, EscalationMetrics, EscalationSink, JsonlEscalationLog, TrendPoint};
pub use status::{ConversationStatusMachine, StatusMachineConfig, TransitionOutcome, TransitionRequest};
pub use triage::{RuleOutcome, TriageInput, TriageRule, TriageRuleEngine};

use std::sync::Arc;

use anyhow::Result;
use ports::ConversationStore;
use protocol::{Envelope, StatusTransitionRequest};
use tracing::{debug, warn};

/// Headless support core: consumes client envelopes, returns the envelopes to
/// send back on the same channel.
pub struct SupportCore {
    store: Arc<dyn ConversationStore>,
    machine: Arc<ConversationStatusMachine>,
    engine: Arc<TriageRuleEngine>,
}

impl SupportCore {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        machine: Arc<ConversationStatusMachine>,
        engine: Arc<TriageRuleEngine>,
    ) -> Self {
        Self { store, machine, engine }
    }

    pub fn machine(&self) -> &Arc<ConversationStatusMachine> {
        &self.machine
    }

    pub fn engine(&self) -> &Arc<TriageRuleEngine> {
        &self.engine
    }

    pub fn logger(&self) -> &Arc<EscalationLogger> {
        self.machine.logger()
    }

    /// Entry point for inbound client envelopes.
    pub async fn handle(&self, conversation_id: &str, envelope: Envelope) -> Result<Vec<Envelope>> {
        match envelope {
            Envelope::Message(msg) => {
                let text = msg.text.trim();
                if text.is_empty() {
                    return Ok(vec![Envelope::delivery_confirmation(msg.id)]);
                }
                self.store.record_message(conversation_id, msg.sentiment_score).await?;

                // Triage never blocks delivery.
                let input = TriageInput::message(conversation_id, text, msg.sentiment_score);
                match self.engine.evaluate(input).await {
                    Ok(outcomes) => {
                        if !outcomes.is_empty() {
                            debug!(conversation_id, matched = outcomes.len(), "triage rules applied");
                        }
                    }
                    Err(e) => warn!(conversation_id, "triage failed: {}", e),
                }
                Ok(vec![Envelope::delivery_confirmation(msg.id)])
            }
            Envelope::Heartbeat(_) => Ok(vec![Envelope::heartbeat()]),
            Envelope::Authenticate(_) => Ok(Vec::new()),
            Envelope::Status(_) | Envelope::DeliveryConfirmation(_) | Envelope::Error(_) => Ok(Vec::new()),
        }
    }

    /// Agent-initiated transition from the wire.
    pub async fn transition(&self, request: StatusTransitionRequest) -> Result<TransitionOutcome, StatusError> {
        self.machine.submit(request).await
    }
}
