use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::ports::EscalationPriority;

/// Declarative condition/action pair evaluated against each inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageRule {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: TriageConditions,
    #[serde(default)]
    pub actions: RuleActions,
}

fn default_true() -> bool {
    true
}

/// Conjunction of optional predicates. An unset predicate holds vacuously.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriageConditions {
    /// Matches when the sentiment score is at or below this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment_threshold: Option<f64>,
    /// Matches when the message contains any of these (case-insensitive).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    /// Matches when the conversation has been open at least this long. A value
    /// too large to represent never matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_time_minutes: Option<i64>,
    /// Matches when the conversation has at least this many messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
}

/// Hours are UTC, `start_hour` inclusive and `end_hour` exclusive. A window
/// with `start_hour > end_hour` wraps past midnight. Empty `days` means every day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    #[serde(default)]
    pub days: Vec<Weekday>,
}

impl TimeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        if !self.days.is_empty() && !self.days.contains(&at.weekday()) {
            return false;
        }
        let hour = at.hour();
        if self.start_hour == self.end_hour {
            true
        } else if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleActions {
    #[serde(default)]
    pub escalate: bool,
    #[serde(default)]
    pub priority: EscalationPriority,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Notification recipients (agent ids, team channels, addresses).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign_to: Option<String>,
}

/// Everything a rule can look at for one event.
#[derive(Debug, Clone)]
pub struct RuleFacts<'a> {
    pub message_text: Option<&'a str>,
    pub sentiment: Option<f64>,
    pub message_count: u32,
    pub wait_time: Duration,
    pub now: DateTime<Utc>,
}

impl TriageConditions {
    pub fn matches(&self, facts: &RuleFacts<'_>) -> bool {
        if let Some(threshold) = self.sentiment_threshold {
            match facts.sentiment {
                Some(score) if score <= threshold => {}
                _ => return false,
            }
        }

        if !self.keywords.is_empty() {
            let Some(text) = facts.message_text else { return false };
            let text = text.to_lowercase();
            let hit = self
                .keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .any(|k| !k.is_empty() && text.contains(&k));
            if !hit {
                return false;
            }
        }

        if let Some(minutes) = self.wait_time_minutes {
            match Duration::try_minutes(minutes) {
                Some(min_wait) if facts.wait_time >= min_wait => {}
                _ => return false,
            }
        }

        if let Some(count) = self.message_count {
            if facts.message_count < count {
                return false;
            }
        }

        if let Some(window) = &self.time_window {
            if !window.contains(facts.now) {
                return false;
            }
        }

        true
    }
}
