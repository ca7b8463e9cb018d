use std::sync::Arc;

use chrono::{DateTime, Utc};
use protocol::{ConversationStatus, TriggeredBy};
use serde_json::json;
use tracing::{debug, info, warn};

use super::rule::{RuleFacts, TriageRule};
use crate::error::{StatusError, TriageError};
use crate::locks::KeyedLocks;
use crate::ports::{
    ConversationContext, ConversationStore, EscalationQueue, Notification, Notifier, QueueEntry, RuleStore,
};
use crate::status::{ConversationStatusMachine, TransitionOutcome, TransitionRequest};

/// One inbound event to triage: a message, a sentiment score, or both.
#[derive(Debug, Clone, Default)]
pub struct TriageInput {
    pub conversation_id: String,
    pub message_text: Option<String>,
    pub sentiment_score: Option<f64>,
    pub metadata: Option<serde_json::Value>,
}

impl TriageInput {
    pub fn message(conversation_id: impl Into<String>, text: impl Into<String>, sentiment: Option<f64>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message_text: Some(text.into()),
            sentiment_score: sentiment,
            metadata: None,
        }
    }

    pub fn sentiment(conversation_id: impl Into<String>, score: f64) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sentiment_score: Some(score),
            ..Default::default()
        }
    }
}

/// What applying one matched rule did.
#[derive(Debug)]
pub struct RuleOutcome {
    pub rule_id: String,
    pub rule_name: String,
    /// `None` when the rule does not escalate.
    pub transition: Option<Result<TransitionOutcome, StatusError>>,
    pub queued: bool,
    pub notified: bool,
}

impl RuleOutcome {
    pub fn escalated(&self) -> bool {
        matches!(&self.transition, Some(Ok(t)) if t.changed)
    }
}

pub struct TriageRuleEngine {
    rules: Arc<dyn RuleStore>,
    store: Arc<dyn ConversationStore>,
    machine: Arc<ConversationStatusMachine>,
    queue: Arc<dyn EscalationQueue>,
    notifier: Arc<dyn Notifier>,
    locks: KeyedLocks,
}

impl TriageRuleEngine {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        store: Arc<dyn ConversationStore>,
        machine: Arc<ConversationStatusMachine>,
        queue: Arc<dyn EscalationQueue>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self { rules, store, machine, queue, notifier, locks: KeyedLocks::new() }
    }

    pub async fn evaluate(&self, input: TriageInput) -> Result<Vec<RuleOutcome>, TriageError> {
        self.evaluate_at(input, Utc::now()).await
    }

    /// Test every active rule against the event and apply each one that matches.
    /// Events for the same conversation are evaluated one at a time.
    pub async fn evaluate_at(
        &self,
        input: TriageInput,
        now: DateTime<Utc>,
    ) -> Result<Vec<RuleOutcome>, TriageError> {
        let _guard = self.locks.lock(&input.conversation_id).await;

        let mut rules = self.rules.active_rules().await.map_err(TriageError::Rules)?;
        rules.retain(|r| r.is_active);
        if rules.is_empty() {
            return Ok(Vec::new());
        }
        // Every rule is tested; ordering only makes the run deterministic.
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        let context = self
            .store
            .load_context(&input.conversation_id)
            .await
            .map_err(TriageError::Context)?
            .ok_or_else(|| TriageError::NotFound(input.conversation_id.clone()))?;

        let facts = RuleFacts {
            message_text: input.message_text.as_deref(),
            sentiment: input.sentiment_score.or(context.last_sentiment),
            message_count: context.message_count,
            wait_time: now - context.created_at,
            now,
        };

        let mut outcomes = Vec::new();
        for rule in rules.iter().filter(|r| r.conditions.matches(&facts)) {
            debug!(conversation_id = %input.conversation_id, rule_id = %rule.id, "triage rule matched");
            outcomes.push(self.apply_rule(rule, &input, &context, &facts).await);
        }
        Ok(outcomes)
    }

    async fn apply_rule(
        &self,
        rule: &TriageRule,
        input: &TriageInput,
        context: &ConversationContext,
        facts: &RuleFacts<'_>,
    ) -> RuleOutcome {
        let mut outcome = RuleOutcome {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            transition: None,
            queued: false,
            notified: false,
        };

        if rule.actions.escalate {
            let mut metadata = json!({
                "rule_id": rule.id,
                "priority": rule.actions.priority,
                "tags": rule.actions.tags,
            });
            if let Some(extra) = &input.metadata {
                metadata["event"] = extra.clone();
            }
            let mut request = TransitionRequest::new(
                context.conversation_id.clone(),
                ConversationStatus::AwaitingHumanResponse,
                rule.name.clone(),
                TriggeredBy::Automation,
            )
            .with_metadata(metadata);
            if let Some(agent) = &rule.actions.assign_to {
                request = request.with_agent(agent.clone());
            }

            match self.machine.update(request).await {
                Ok(transition) => {
                    if transition.changed {
                        info!(conversation_id = %context.conversation_id, rule = %rule.name, "conversation escalated by rule");
                    }
                    outcome.transition = Some(Ok(transition));
                    outcome.queued = self.enqueue(rule, context, facts).await;
                }
                Err(e) => {
                    // The machine already logged the failed attempt; no automatic retry.
                    warn!(conversation_id = %context.conversation_id, rule_id = %rule.id, "escalation rejected: {}", e);
                    outcome.transition = Some(Err(e));
                    return outcome;
                }
            }
        }

        outcome.notified = self.dispatch_notification(rule, input, context).await;
        outcome
    }

    async fn enqueue(&self, rule: &TriageRule, context: &ConversationContext, facts: &RuleFacts<'_>) -> bool {
        let entry = QueueEntry {
            conversation_id: context.conversation_id.clone(),
            priority: rule.actions.priority,
            wait_seconds: facts.wait_time.num_seconds().max(0),
            tags: rule.actions.tags.clone(),
            rule_id: Some(rule.id.clone()),
            enqueued_at: facts.now,
        };
        if let Err(e) = self.queue.enqueue(entry).await {
            warn!(conversation_id = %context.conversation_id, "failed to enqueue escalation: {:#}", e);
            return false;
        }
        // An agent may have taken the conversation between the transition and
        // the enqueue; the machine only dequeues entries that already exist.
        match self.store.get_status(&context.conversation_id).await {
            Ok(Some(record)) if record.status != ConversationStatus::AwaitingHumanResponse => {
                if let Err(e) = self.queue.remove(&context.conversation_id).await {
                    warn!(conversation_id = %context.conversation_id, "failed to drop stale escalation: {:#}", e);
                }
                false
            }
            _ => true,
        }
    }

    async fn dispatch_notification(&self, rule: &TriageRule, input: &TriageInput, context: &ConversationContext) -> bool {
        if rule.actions.notify.is_empty() {
            return false;
        }
        let subject = if rule.actions.escalate {
            format!("Conversation {} needs a human: {}", context.conversation_id, rule.name)
        } else {
            format!("Conversation {} matched rule: {}", context.conversation_id, rule.name)
        };
        let mut body = format!("messages: {}", context.message_count);
        if let Some(score) = input.sentiment_score {
            body.push_str(&format!(", sentiment: {:.2}", score));
        }
        if let Some(text) = &input.message_text {
            let excerpt: String = text.chars().take(200).collect();
            body.push_str(&format!("\n> {}", excerpt));
        }
        let notification = Notification {
            conversation_id: context.conversation_id.clone(),
            subject,
            body,
            priority: rule.actions.priority,
            tags: rule.actions.tags.clone(),
        };
        match self.notifier.notify(&rule.actions.notify, &notification).await {
            Ok(()) => true,
            Err(e) => {
                warn!(conversation_id = %context.conversation_id, rule_id = %rule.id, "notification failed: {:#}", e);
                false
            }
        }
    }
}
