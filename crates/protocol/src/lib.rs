use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Protocol version (bumped when breaking changes are introduced)
pub const VERSION: u8 = 1;

/// Envelope `type` values understood by this version of the protocol.
pub const KNOWN_TYPES: [&str; 6] = [
    "authenticate",
    "message",
    "status",
    "delivery_confirmation",
    "heartbeat",
    "error",
];

/// Error code sent before the server closes a session it will not accept.
pub const ERROR_UNAUTHORIZED: &str = "unauthorized";

/// Top-level realtime envelope. Serialized as `{"type": "...", ...payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Authenticate(Authenticate),
    Message(ChatMessage),
    Status(StatusUpdate),
    DeliveryConfirmation(DeliveryConfirmation),
    Heartbeat(Heartbeat),
    Error(ErrorNotice),
}

/// Result of decoding a raw text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Known(Envelope),
    /// Well-formed frame whose `type` this version does not know.
    Unknown(String),
}

/// Credentials sent by a client right after the channel opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct Authenticate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<u8>,
    pub session_id: String,
    pub token: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    #[default]
    Customer,
    Agent,
    Ai,
    System,
}

/// Chat content travelling in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<u8>,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub sender: SenderRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<i64>,
}

/// Broadcast whenever a conversation's status changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<u8>,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<ConversationStatus>,
    pub status: ConversationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub triggered_by: TriggeredBy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfirmation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<u8>,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct Heartbeat {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<u8>,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct ErrorNotice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<u8>,
    pub code: String,
    pub message: String,
}

/// Ownership state of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[serde(alias = "AI_HANDLING")]
    AiHandling,
    #[serde(alias = "AWAITING_HUMAN_RESPONSE")]
    AwaitingHumanResponse,
    #[serde(alias = "RESOLVED")]
    Resolved,
}

impl ConversationStatus {
    pub const ALL: [ConversationStatus; 3] = [
        ConversationStatus::AiHandling,
        ConversationStatus::AwaitingHumanResponse,
        ConversationStatus::Resolved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::AiHandling => "ai_handling",
            ConversationStatus::AwaitingHumanResponse => "awaiting_human_response",
            ConversationStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown conversation status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for ConversationStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ai_handling" => Ok(ConversationStatus::AiHandling),
            "awaiting_human_response" => Ok(ConversationStatus::AwaitingHumanResponse),
            "resolved" => Ok(ConversationStatus::Resolved),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// Who asked for a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Automation,
    Agent,
    System,
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggeredBy::Automation => write!(f, "automation"),
            TriggeredBy::Agent => write!(f, "agent"),
            TriggeredBy::System => write!(f, "system"),
        }
    }
}

/// Server-facing transition request. `new_status` stays a raw string so an
/// unknown value can be rejected by the state machine rather than by serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct StatusTransitionRequest {
    pub conversation_id: String,
    pub new_status: String,
    pub reason: String,
    pub triggered_by: TriggeredBy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct StatusTransitionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<ConversationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_status: Option<ConversationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Decode a text frame, separating unknown envelope types from malformed input.
    pub fn decode(text: &str) -> Result<Inbound, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let msg_type = match value.get("type").and_then(|t| t.as_str()) {
            Some(t) => t.to_string(),
            None => {
                return Err(<serde_json::Error as serde::de::Error>::custom(
                    "envelope is missing a string `type` field",
                ))
            }
        };
        if !KNOWN_TYPES.contains(&msg_type.as_str()) {
            return Ok(Inbound::Unknown(msg_type));
        }
        serde_json::from_value(value).map(Inbound::Known)
    }

    pub fn encode(&self) -> String {
        // Every variant is a plain struct of strings/numbers; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn authenticate(
        session_id: impl Into<String>,
        token: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Envelope::Authenticate(Authenticate {
            v: Some(VERSION),
            session_id: session_id.into(),
            token: token.into(),
            conversation_id: conversation_id.into(),
        })
    }

    pub fn chat(id: impl Into<String>, text: impl Into<String>, sentiment_score: Option<f64>) -> Self {
        Envelope::Message(ChatMessage {
            v: Some(VERSION),
            id: id.into(),
            conversation_id: None,
            text: text.into(),
            sender: SenderRole::Customer,
            sentiment_score,
            sent_at: Some(now_millis()),
        })
    }

    pub fn delivery_confirmation(message_id: impl Into<String>) -> Self {
        Envelope::DeliveryConfirmation(DeliveryConfirmation {
            v: Some(VERSION),
            message_id: message_id.into(),
            received_at: Some(now_millis()),
        })
    }

    pub fn heartbeat() -> Self {
        Envelope::Heartbeat(Heartbeat { v: Some(VERSION), at: now_millis() })
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Envelope::Error(ErrorNotice { v: Some(VERSION), code: code.into(), message: message.into() })
    }
}

/// Milliseconds since the unix epoch, the timestamp unit used on the wire.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
