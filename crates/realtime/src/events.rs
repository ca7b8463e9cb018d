use std::fmt;
use std::time::Duration;

use protocol::{ChatMessage, StatusUpdate};

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal; only reached through an explicit disconnect.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// One bidirectional socket.
    FullDuplex,
    /// Server-sent events down, HTTP requests up.
    HalfDuplex,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::FullDuplex => write!(f, "websocket"),
            TransportKind::HalfDuplex => write!(f, "event-stream"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed(TransportError),
}

/// Everything the transport reports. Published on a broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    Connected { kind: TransportKind },
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect budget used up; the transport stays disconnected until
    /// `connect` is called again.
    ConnectionExhausted { attempts: u32 },
    Message(ChatMessage),
    ConversationStatus(StatusUpdate),
    Delivery { message_id: String, status: DeliveryStatus },
    Error(TransportError),
}
