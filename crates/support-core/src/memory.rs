//! Process-local adapters for every port. The relay server falls back to
//! these when no external store is configured; tests use them throughout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use protocol::{ConversationStatus, StatusUpdate};
use tracing::info;

use crate::ports::{
    ConversationContext, ConversationStore, EscalationQueue, Notification, Notifier, QueueEntry, RuleStore,
    StatusBroadcaster, StatusRecord,
};
use crate::triage::TriageRule;

#[derive(Debug, Clone)]
struct ConversationRow {
    token: String,
    status: ConversationStatus,
    assignee: Option<String>,
    updated_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    message_count: u32,
    last_sentiment: Option<f64>,
}

#[derive(Default)]
pub struct MemoryConversationStore {
    rows: Mutex<HashMap<String, ConversationRow>>,
    status_writes: AtomicUsize,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a conversation directly, bypassing `create_conversation`.
    pub fn insert(&self, conversation_id: &str, status: ConversationStatus, created_at: DateTime<Utc>) {
        self.rows.lock().insert(
            conversation_id.to_string(),
            ConversationRow {
                token: String::new(),
                status,
                assignee: None,
                updated_at: created_at,
                created_at,
                message_count: 0,
                last_sentiment: None,
            },
        );
    }

    /// Number of successful status writes, for asserting that rejected
    /// transitions never reach the store.
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    pub fn assignee(&self, conversation_id: &str) -> Option<String> {
        self.rows.lock().get(conversation_id).and_then(|r| r.assignee.clone())
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create_conversation(&self, conversation_id: &str, token: &str) -> Result<ConversationContext> {
        let now = Utc::now();
        let row = ConversationRow {
            token: token.to_string(),
            status: ConversationStatus::AiHandling,
            assignee: None,
            updated_at: now,
            created_at: now,
            message_count: 0,
            last_sentiment: None,
        };
        self.rows.lock().insert(conversation_id.to_string(), row);
        Ok(ConversationContext {
            conversation_id: conversation_id.to_string(),
            status: ConversationStatus::AiHandling,
            message_count: 0,
            created_at: now,
            last_sentiment: None,
        })
    }

    async fn conversation_token(&self, conversation_id: &str) -> Result<Option<String>> {
        Ok(self.rows.lock().get(conversation_id).map(|r| r.token.clone()))
    }

    async fn get_status(&self, conversation_id: &str) -> Result<Option<StatusRecord>> {
        Ok(self.rows.lock().get(conversation_id).map(|r| StatusRecord {
            status: r.status,
            assignee: r.assignee.clone(),
            updated_at: r.updated_at,
        }))
    }

    async fn compare_and_set_status(
        &self,
        conversation_id: &str,
        expected: ConversationStatus,
        new: ConversationStatus,
        assignee: Option<&str>,
    ) -> Result<bool> {
        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(conversation_id) else { return Ok(false) };
        if row.status != expected {
            return Ok(false);
        }
        row.status = new;
        row.assignee = assignee.map(str::to_string);
        row.updated_at = Utc::now();
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn load_context(&self, conversation_id: &str) -> Result<Option<ConversationContext>> {
        Ok(self.rows.lock().get(conversation_id).map(|r| ConversationContext {
            conversation_id: conversation_id.to_string(),
            status: r.status,
            message_count: r.message_count,
            created_at: r.created_at,
            last_sentiment: r.last_sentiment,
        }))
    }

    async fn record_message(&self, conversation_id: &str, sentiment: Option<f64>) -> Result<()> {
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(conversation_id)
            .ok_or_else(|| anyhow::anyhow!("conversation {} not found", conversation_id))?;
        row.message_count += 1;
        if sentiment.is_some() {
            row.last_sentiment = sentiment;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct StaticRuleStore {
    rules: RwLock<Vec<TriageRule>>,
}

impl StaticRuleStore {
    pub fn new(rules: Vec<TriageRule>) -> Self {
        Self { rules: RwLock::new(rules) }
    }

    pub fn replace(&self, rules: Vec<TriageRule>) {
        *self.rules.write() = rules;
    }

    pub fn all(&self) -> Vec<TriageRule> {
        self.rules.read().clone()
    }
}

#[async_trait]
impl RuleStore for StaticRuleStore {
    async fn active_rules(&self) -> Result<Vec<TriageRule>> {
        Ok(self.rules.read().iter().filter(|r| r.is_active).cloned().collect())
    }
}

/// One entry per conversation; re-escalation keeps the higher priority and
/// merges tags instead of queueing the conversation twice.
#[derive(Default)]
pub struct MemoryEscalationQueue {
    entries: Mutex<Vec<QueueEntry>>,
}

impl MemoryEscalationQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_queue(entries: &mut [QueueEntry]) {
    entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(b.wait_seconds.cmp(&a.wait_seconds)));
}

#[async_trait]
impl EscalationQueue for MemoryEscalationQueue {
    async fn enqueue(&self, entry: QueueEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| e.conversation_id == entry.conversation_id) {
            Some(existing) => {
                existing.priority = existing.priority.max(entry.priority);
                existing.wait_seconds = existing.wait_seconds.max(entry.wait_seconds);
                for tag in entry.tags {
                    if !existing.tags.contains(&tag) {
                        existing.tags.push(tag);
                    }
                }
            }
            None => entries.push(entry),
        }
        Ok(())
    }

    async fn remove(&self, conversation_id: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.conversation_id != conversation_id);
        Ok(entries.len() != before)
    }

    async fn snapshot(&self) -> Result<Vec<QueueEntry>> {
        let mut entries = self.entries.lock().clone();
        sort_queue(&mut entries);
        Ok(entries)
    }
}

/// Logs every notification and keeps a copy.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Vec<String>, Notification)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Vec<String>, Notification)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, recipients: &[String], notification: &Notification) -> Result<()> {
        info!(recipients = ?recipients, conversation_id = %notification.conversation_id, "{}", notification.subject);
        self.sent.lock().push((recipients.to_vec(), notification.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingBroadcaster {
    updates: Mutex<Vec<StatusUpdate>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().clone()
    }
}

#[async_trait]
impl StatusBroadcaster for RecordingBroadcaster {
    async fn broadcast(&self, update: &StatusUpdate) -> Result<()> {
        self.updates.lock().push(update.clone());
        Ok(())
    }
}
