//! Bridges transport events to whatever renders them.

use std::sync::Arc;

use protocol::{ChatMessage, StatusUpdate};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::events::{ConnectionState, DeliveryStatus, TransportEvent};

/// What the user sees for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionIndicator {
    Connecting,
    Online,
    /// Stays up until reconnection succeeds or the budget runs out.
    Reconnecting { attempt: u32 },
    /// Hard failure after the reconnect budget is spent.
    Offline,
    Closed,
}

impl ConnectionIndicator {
    pub fn from_event(event: &TransportEvent) -> Option<Self> {
        match event {
            TransportEvent::StateChanged(ConnectionState::Connecting) => Some(Self::Connecting),
            TransportEvent::StateChanged(ConnectionState::Closed) => Some(Self::Closed),
            TransportEvent::Connected { .. } => Some(Self::Online),
            TransportEvent::Reconnecting { attempt, .. } => Some(Self::Reconnecting { attempt: *attempt }),
            TransportEvent::ConnectionExhausted { .. } => Some(Self::Offline),
            _ => None,
        }
    }
}

pub trait PresentationPort: Send + Sync {
    fn add_message(&self, message: &ChatMessage);
    fn update_connection_status(&self, indicator: ConnectionIndicator);
    fn update_conversation_status(&self, update: &StatusUpdate);
    fn update_delivery_status(&self, message_id: &str, status: &DeliveryStatus);
    fn show_error(&self, message: &str);
}

/// Forward every event to `port` until the transport goes away.
pub fn spawn_presentation(
    mut events: broadcast::Receiver<TransportEvent>,
    port: Arc<dyn PresentationPort>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "presentation fell behind transport events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            render(port.as_ref(), &event);
        }
    })
}

pub fn render(port: &dyn PresentationPort, event: &TransportEvent) {
    if let Some(indicator) = ConnectionIndicator::from_event(event) {
        port.update_connection_status(indicator);
    }
    match event {
        TransportEvent::Message(msg) => port.add_message(msg),
        TransportEvent::ConversationStatus(update) => port.update_conversation_status(update),
        TransportEvent::Delivery { message_id, status } => port.update_delivery_status(message_id, status),
        TransportEvent::Error(e) => port.show_error(&e.to_string()),
        _ => {}
    }
}
