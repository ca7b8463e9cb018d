//! Append-only audit trail of conversation-status transition attempts.
//!
//! Every attempt is recorded, successful or not. Writing to the trail never
//! fails the operation that produced the entry: sink errors are reported
//! through `tracing` and dropped at the [`EscalationLogger`] boundary.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use protocol::{ConversationStatus, TriggeredBy};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationLogEntry {
    pub id: Uuid,
    pub conversation_id: String,
    pub previous_status: Option<ConversationStatus>,
    /// Requested status as received; may be a value outside the enum.
    pub new_status: String,
    pub triggered_by: TriggeredBy,
    pub reason: String,
    pub agent_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub success: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EscalationLogEntry {
    pub fn is_escalation(&self) -> bool {
        self.new_status == ConversationStatus::AwaitingHumanResponse.as_str()
            && self.previous_status != Some(ConversationStatus::AwaitingHumanResponse)
    }

    pub fn is_resolution(&self) -> bool {
        self.new_status == ConversationStatus::Resolved.as_str()
            && self.previous_status != Some(ConversationStatus::Resolved)
    }
}

/// Storage behind the logger. Implementations only ever append.
#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn append(&self, entry: &EscalationLogEntry) -> Result<()>;

    /// Entries created at or after `since`, oldest first.
    async fn entries_since(&self, since: DateTime<Utc>) -> Result<Vec<EscalationLogEntry>>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EscalationMetrics {
    pub total_attempts: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub escalations_to_human: u64,
    pub resolutions: u64,
    pub by_trigger: BTreeMap<TriggeredBy, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub attempts: u64,
    pub escalations: u64,
    pub failures: u64,
}

pub struct EscalationLogger {
    sink: Box<dyn EscalationSink>,
}

impl EscalationLogger {
    pub fn new(sink: impl EscalationSink + 'static) -> Self {
        Self { sink: Box::new(sink) }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryEscalationLog::default())
    }

    pub async fn log_escalation(&self, entry: EscalationLogEntry) {
        if let Err(e) = self.sink.append(&entry).await {
            error!(
                conversation_id = %entry.conversation_id,
                entry_id = %entry.id,
                "failed to record escalation log entry: {:#}",
                e
            );
        }
    }

    pub async fn entries_since(&self, since: DateTime<Utc>) -> Result<Vec<EscalationLogEntry>> {
        self.sink.entries_since(since).await
    }

    pub async fn metrics(&self, since: DateTime<Utc>) -> Result<EscalationMetrics> {
        let entries = self.sink.entries_since(since).await?;
        let mut metrics = EscalationMetrics::default();
        for entry in &entries {
            metrics.total_attempts += 1;
            if entry.success {
                metrics.successful += 1;
                if entry.is_escalation() {
                    metrics.escalations_to_human += 1;
                }
                if entry.is_resolution() {
                    metrics.resolutions += 1;
                }
            } else {
                metrics.failed += 1;
            }
            *metrics.by_trigger.entry(entry.triggered_by).or_default() += 1;
        }
        if metrics.total_attempts > 0 {
            metrics.success_rate = metrics.successful as f64 / metrics.total_attempts as f64;
        }
        Ok(metrics)
    }

    /// One bucket per calendar day (UTC) for the last `days` days, oldest first.
    pub async fn trends(&self, days: u32, now: DateTime<Utc>) -> Result<Vec<TrendPoint>> {
        let days = days.max(1);
        let first_day = now.date_naive() - Duration::days(i64::from(days) - 1);
        let since = first_day
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(now);

        let mut buckets: BTreeMap<NaiveDate, TrendPoint> = (0..days)
            .map(|offset| {
                let date = first_day + Duration::days(i64::from(offset));
                (date, TrendPoint { date, attempts: 0, escalations: 0, failures: 0 })
            })
            .collect();

        for entry in self.sink.entries_since(since).await? {
            if let Some(point) = buckets.get_mut(&entry.created_at.date_naive()) {
                point.attempts += 1;
                if !entry.success {
                    point.failures += 1;
                } else if entry.is_escalation() {
                    point.escalations += 1;
                }
            }
        }
        Ok(buckets.into_values().collect())
    }
}

/// Process-local trail, kept in insertion (time) order.
#[derive(Default)]
pub struct MemoryEscalationLog {
    entries: RwLock<Vec<EscalationLogEntry>>,
}

#[async_trait]
impl EscalationSink for MemoryEscalationLog {
    async fn append(&self, entry: &EscalationLogEntry) -> Result<()> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn entries_since(&self, since: DateTime<Utc>) -> Result<Vec<EscalationLogEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.iter().filter(|e| e.created_at >= since).cloned().collect())
    }
}

/// JSON-lines file; one entry per line, opened in append mode for every write.
pub struct JsonlEscalationLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlEscalationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }
}

#[async_trait]
impl EscalationSink for JsonlEscalationLog {
    async fn append(&self, entry: &EscalationLogEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn entries_since(&self, since: DateTime<Utc>) -> Result<Vec<EscalationLogEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<EscalationLogEntry>(line) {
                Ok(entry) if entry.created_at >= since => entries.push(entry),
                Ok(_) => {}
                Err(e) => tracing::warn!(path = %self.path.display(), "skipping unreadable log line: {}", e),
            }
        }
        Ok(entries)
    }
}
