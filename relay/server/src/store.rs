//! Redis-backed conversation store. One hash per conversation under
//! `conv:{id}`; every status write goes through a Lua script so the
//! read-compare-write is atomic across relay instances.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use protocol::ConversationStatus;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use support_core::ports::{ConversationContext, ConversationStore, StatusRecord};
use tracing::debug;

/// KEYS[1] = hash; ARGV = expected, new, assignee ('' clears), now_ms, ttl_secs.
/// Returns -1 when the conversation is missing, 0 on mismatch, 1 when written.
const COMPARE_AND_SET: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then return -1 end
if current ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'updated_at', ARGV[4])
if ARGV[3] == '' then
  redis.call('HDEL', KEYS[1], 'assignee')
else
  redis.call('HSET', KEYS[1], 'assignee', ARGV[3])
end
redis.call('EXPIRE', KEYS[1], ARGV[5])
return 1
"#;

/// KEYS[1] = hash; ARGV = sentiment ('' keeps the previous one), ttl_secs.
const RECORD_MESSAGE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
local count = redis.call('HINCRBY', KEYS[1], 'message_count', 1)
if ARGV[1] ~= '' then redis.call('HSET', KEYS[1], 'last_sentiment', ARGV[1]) end
redis.call('EXPIRE', KEYS[1], ARGV[2])
return count
"#;

pub fn conversation_key(conversation_id: &str) -> String {
    format!("conv:{}", conversation_id)
}

fn millis_to_utc(raw: Option<&String>) -> DateTime<Utc> {
    raw.and_then(|s| s.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_default()
}

fn parse_status(data: &HashMap<String, String>) -> Result<ConversationStatus> {
    let raw = data.get("status").ok_or_else(|| anyhow!("conversation hash has no status"))?;
    raw.parse().map_err(|e| anyhow!("{}", e))
}

/// `None` for an empty hash, which is how Redis reports a missing key.
pub fn context_from_hash(conversation_id: &str, data: &HashMap<String, String>) -> Result<Option<ConversationContext>> {
    if data.is_empty() {
        return Ok(None);
    }
    Ok(Some(ConversationContext {
        conversation_id: conversation_id.to_string(),
        status: parse_status(data)?,
        message_count: data.get("message_count").and_then(|s| s.parse().ok()).unwrap_or(0),
        created_at: millis_to_utc(data.get("created_at")),
        last_sentiment: data.get("last_sentiment").and_then(|s| s.parse().ok()),
    }))
}

pub fn status_from_hash(data: &HashMap<String, String>) -> Result<Option<StatusRecord>> {
    if data.is_empty() {
        return Ok(None);
    }
    Ok(Some(StatusRecord {
        status: parse_status(data)?,
        assignee: data.get("assignee").cloned().filter(|a| !a.is_empty()),
        updated_at: millis_to_utc(data.get("updated_at")),
    }))
}

#[derive(Clone)]
pub struct RedisConversationStore {
    redis: ConnectionManager,
    ttl: Duration,
}

impl RedisConversationStore {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis, ttl })
    }

    fn ttl_secs(&self) -> i64 {
        self.ttl.as_secs().max(1) as i64
    }
}

#[async_trait]
impl ConversationStore for RedisConversationStore {
    async fn create_conversation(&self, conversation_id: &str, token: &str) -> Result<ConversationContext> {
        let mut conn = self.redis.clone();
        let key = conversation_key(conversation_id);
        let now = Utc::now();
        let now_ms = now.timestamp_millis().to_string();

        conn.hset_multiple::<_, _, _, ()>(
            &key,
            &[
                ("token", token),
                ("status", ConversationStatus::AiHandling.as_str()),
                ("message_count", "0"),
                ("created_at", now_ms.as_str()),
                ("updated_at", now_ms.as_str()),
            ],
        )
        .await?;
        conn.expire::<_, ()>(&key, self.ttl_secs()).await?;
        debug!(conversation_id, "conversation created");

        Ok(ConversationContext {
            conversation_id: conversation_id.to_string(),
            status: ConversationStatus::AiHandling,
            message_count: 0,
            created_at: now,
            last_sentiment: None,
        })
    }

    async fn conversation_token(&self, conversation_id: &str) -> Result<Option<String>> {
        let mut conn = self.redis.clone();
        let token: Option<String> = conn.hget(conversation_key(conversation_id), "token").await?;
        Ok(token)
    }

    async fn get_status(&self, conversation_id: &str) -> Result<Option<StatusRecord>> {
        let mut conn = self.redis.clone();
        let data: HashMap<String, String> = conn.hgetall(conversation_key(conversation_id)).await?;
        status_from_hash(&data)
    }

    async fn compare_and_set_status(
        &self,
        conversation_id: &str,
        expected: ConversationStatus,
        new: ConversationStatus,
        assignee: Option<&str>,
    ) -> Result<bool> {
        let mut conn = self.redis.clone();
        let written: i64 = Script::new(COMPARE_AND_SET)
            .key(conversation_key(conversation_id))
            .arg(expected.as_str())
            .arg(new.as_str())
            .arg(assignee.unwrap_or(""))
            .arg(Utc::now().timestamp_millis())
            .arg(self.ttl_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn load_context(&self, conversation_id: &str) -> Result<Option<ConversationContext>> {
        let mut conn = self.redis.clone();
        let data: HashMap<String, String> = conn.hgetall(conversation_key(conversation_id)).await?;
        context_from_hash(conversation_id, &data)
    }

    async fn record_message(&self, conversation_id: &str, sentiment: Option<f64>) -> Result<()> {
        let mut conn = self.redis.clone();
        let count: i64 = Script::new(RECORD_MESSAGE)
            .key(conversation_key(conversation_id))
            .arg(sentiment.map(|s| s.to_string()).unwrap_or_default())
            .arg(self.ttl_secs())
            .invoke_async(&mut conn)
            .await?;
        if count < 0 {
            return Err(anyhow!("conversation {} not found", conversation_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn empty_hash_means_missing() {
        assert!(context_from_hash("c1", &HashMap::new()).unwrap().is_none());
        assert!(status_from_hash(&HashMap::new()).unwrap().is_none());
    }

    #[test]
    fn parses_context_fields() {
        let data = hash(&[
            ("token", "t"),
            ("status", "awaiting_human_response"),
            ("message_count", "4"),
            ("created_at", "1700000000000"),
            ("last_sentiment", "-0.75"),
        ]);
        let ctx = context_from_hash("c1", &data).unwrap().unwrap();
        assert_eq!(ctx.status, ConversationStatus::AwaitingHumanResponse);
        assert_eq!(ctx.message_count, 4);
        assert_eq!(ctx.last_sentiment, Some(-0.75));
        assert_eq!(ctx.created_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn empty_assignee_is_none() {
        let data = hash(&[("status", "resolved"), ("assignee", ""), ("updated_at", "5")]);
        let record = status_from_hash(&data).unwrap().unwrap();
        assert_eq!(record.status, ConversationStatus::Resolved);
        assert_eq!(record.assignee, None);
    }

    #[test]
    fn corrupt_status_is_an_error() {
        let data = hash(&[("status", "escalated")]);
        assert!(status_from_hash(&data).is_err());
    }
}
