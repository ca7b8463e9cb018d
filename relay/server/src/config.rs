use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use support_core::TriageRule;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// In-memory store when unset.
    pub redis_url: Option<String>,
    pub public_ws_url: String,
    pub public_http_url: String,
    pub heartbeat_interval: Duration,
    /// Idle lifetime of a conversation in Redis; refreshed on every write.
    pub conversation_ttl: Duration,
    /// How long a new WebSocket may stay silent before authenticating.
    pub auth_timeout: Duration,
    pub triage_rules_path: Option<PathBuf>,
    pub escalation_log_path: Option<PathBuf>,
    pub notify_webhook_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            redis_url: None,
            public_ws_url: "ws://localhost:3001/ws".to_string(),
            public_http_url: "http://localhost:3001".to_string(),
            heartbeat_interval: Duration::from_secs(20),
            conversation_ttl: Duration::from_secs(7 * 24 * 3600),
            auth_timeout: Duration::from_secs(10),
            triage_rules_path: None,
            escalation_log_path: None,
            notify_webhook_url: None,
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "3001".to_string())
            .parse()
            .context("PORT must be a port number")?;
        let heartbeat_secs: u64 = env::var("HEARTBEAT_INTERVAL_SECS")
            .unwrap_or_else(|_| "20".to_string())
            .parse()
            .context("HEARTBEAT_INTERVAL_SECS must be a whole number of seconds")?;
        let ttl_secs: u64 = env::var("CONVERSATION_TTL_SECS")
            .unwrap_or_else(|_| (7 * 24 * 3600).to_string())
            .parse()
            .context("CONVERSATION_TTL_SECS must be a whole number of seconds")?;

        let config = Self {
            port,
            redis_url: non_empty("REDIS_URL"),
            public_ws_url: non_empty("PUBLIC_WS_URL").unwrap_or_else(|| format!("ws://localhost:{}/ws", port)),
            public_http_url: non_empty("PUBLIC_HTTP_URL").unwrap_or_else(|| format!("http://localhost:{}", port)),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            conversation_ttl: Duration::from_secs(ttl_secs),
            triage_rules_path: non_empty("TRIAGE_RULES_PATH").map(PathBuf::from),
            escalation_log_path: non_empty("ESCALATION_LOG_PATH").map(PathBuf::from),
            notify_webhook_url: non_empty("NOTIFY_WEBHOOK_URL"),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be positive");
        }
        if self.conversation_ttl.is_zero() {
            bail!("conversation ttl must be positive");
        }
        if self.auth_timeout.is_zero() {
            bail!("auth timeout must be positive");
        }
        if let Some(url) = &self.notify_webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("NOTIFY_WEBHOOK_URL must be an http(s) URL, got {}", url);
            }
        }
        Ok(())
    }
}

/// Rules file is a JSON array of rules. No path means no rules.
pub async fn load_rules(path: Option<&PathBuf>) -> Result<Vec<TriageRule>> {
    let Some(path) = path else { return Ok(Vec::new()) };
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading triage rules from {}", path.display()))?;
    let rules: Vec<TriageRule> =
        serde_json::from_str(&raw).with_context(|| format!("parsing triage rules in {}", path.display()))?;
    Ok(rules)
}
