use std::time::Duration;

use anyhow::{Context, Result};

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra added to each delay. Must not exceed
    /// `base_delay`, which keeps consecutive delays non-decreasing.
    pub jitter: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(500),
            max_attempts: 8,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.base_delay.is_zero() {
            return Err(TransportError::Config("reconnect base_delay must be positive".into()));
        }
        if self.max_delay < self.base_delay {
            return Err(TransportError::Config("reconnect max_delay must be >= base_delay".into()));
        }
        if self.jitter > self.base_delay {
            return Err(TransportError::Config("reconnect jitter must be <= base_delay".into()));
        }
        if self.max_attempts == 0 {
            return Err(TransportError::Config("reconnect max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Full-duplex endpoint, e.g. `ws://host:3001/ws`.
    pub ws_url: Option<String>,
    /// Base URL of the HTTP API used by the half-duplex fallback.
    pub http_url: Option<String>,
    pub session_id: String,
    pub token: String,
    pub conversation_id: String,
    pub heartbeat_interval: Duration,
    /// Silence longer than this on a connected link is treated as a dead link.
    pub heartbeat_timeout: Duration,
    pub delivery_timeout: Duration,
    pub connect_timeout: Duration,
    /// Try the half-duplex link before the full-duplex one.
    pub prefer_half_duplex: bool,
    pub reconnect: ReconnectConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ws_url: Some("ws://127.0.0.1:3001/ws".to_string()),
            http_url: Some("http://127.0.0.1:3001".to_string()),
            session_id: String::new(),
            token: String::new(),
            conversation_id: String::new(),
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(45),
            delivery_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            prefer_half_duplex: false,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.ws_url.is_none() && self.http_url.is_none() {
            return Err(TransportError::Config("either ws_url or http_url is required".into()));
        }
        if self.conversation_id.trim().is_empty() {
            return Err(TransportError::Config("conversation_id is required".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(TransportError::Config("heartbeat_interval must be positive".into()));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(TransportError::Config("heartbeat_timeout must exceed heartbeat_interval".into()));
        }
        if self.delivery_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(TransportError::Config("timeouts must be positive".into()));
        }
        self.reconnect.validate()
    }

    /// Layer whichever `SUPPORT_*` values `lookup` provides over `self`.
    /// Each variable applies on its own; unset or blank ones keep the current value.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = var("SUPPORT_WS_URL") {
            self.ws_url = Some(url);
        }
        if let Some(url) = var("SUPPORT_HTTP_URL") {
            self.http_url = Some(url);
        }
        if let Some(id) = var("SUPPORT_CONVERSATION_ID") {
            if self.session_id.is_empty() {
                self.session_id = id.clone();
            }
            self.conversation_id = id;
        }
        if let Some(id) = var("SUPPORT_SESSION_ID") {
            self.session_id = id;
        }
        if let Some(token) = var("SUPPORT_TOKEN") {
            self.token = token;
        }
        if let Some(raw) = var("SUPPORT_HB_SECS") {
            let secs: u64 = raw.parse().context("SUPPORT_HB_SECS must be a whole number of seconds")?;
            let secs = secs.max(1);
            self.heartbeat_interval = Duration::from_secs(secs);
            self.heartbeat_timeout = Duration::from_secs(secs * 2 + 5);
        }
        Ok(self)
    }

    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> TransportConfig {
        TransportConfig { conversation_id: "c1".into(), ..Default::default() }
    }

    #[test]
    fn default_with_conversation_is_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn heartbeat_timeout_must_exceed_interval() {
        let config = TransportConfig { heartbeat_timeout: Duration::from_secs(20), ..valid() };
        assert!(matches!(config.validate(), Err(TransportError::Config(_))));
    }

    #[test]
    fn jitter_above_base_is_rejected() {
        let mut config = valid();
        config.reconnect.jitter = Duration::from_secs(2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn needs_an_endpoint() {
        let config = TransportConfig { ws_url: None, http_url: None, ..valid() };
        assert!(config.validate().is_err());
    }

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key: &str| pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| v.to_string())
    }

    #[test]
    fn overrides_apply_without_credentials() {
        let config = TransportConfig::default().with_overrides(lookup(&[("SUPPORT_HB_SECS", "7")])).unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(7));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(19));
        assert!(config.token.is_empty());
        assert_eq!(config.ws_url, TransportConfig::default().ws_url);
    }

    #[test]
    fn unset_and_blank_overrides_keep_current_values() {
        let base = valid();
        let config = base.clone().with_overrides(lookup(&[("SUPPORT_WS_URL", "  ")])).unwrap();
        assert_eq!(config, base);
    }

    #[test]
    fn session_defaults_to_conversation() {
        let config = TransportConfig::default()
            .with_overrides(lookup(&[
                ("SUPPORT_CONVERSATION_ID", "c9"),
                ("SUPPORT_TOKEN", "t"),
                ("SUPPORT_HTTP_URL", "https://support.example.com"),
            ]))
            .unwrap();
        assert_eq!(config.session_id, "c9");
        assert_eq!(config.conversation_id, "c9");
        assert_eq!(config.http_url.as_deref(), Some("https://support.example.com"));

        let config = config.with_overrides(lookup(&[("SUPPORT_SESSION_ID", "s1")])).unwrap();
        assert_eq!(config.session_id, "s1");
    }

    #[test]
    fn malformed_heartbeat_is_an_error() {
        assert!(TransportConfig::default().with_overrides(lookup(&[("SUPPORT_HB_SECS", "soon")])).is_err());
    }
}
