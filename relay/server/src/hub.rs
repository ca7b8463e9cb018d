//! In-process fan-out of envelopes to every live client of a conversation.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use protocol::{Envelope, StatusUpdate};
use support_core::ports::StatusBroadcaster;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

type Channels = Arc<Mutex<HashMap<String, broadcast::Sender<HubFrame>>>>;

/// An envelope plus the tag of the client that produced it, so that client
/// can skip its own frame.
#[derive(Debug, Clone)]
pub struct HubFrame {
    pub origin: Option<String>,
    pub envelope: Envelope,
}

impl HubFrame {
    pub fn is_from(&self, tag: &str) -> bool {
        self.origin.as_deref() == Some(tag)
    }
}

#[derive(Default)]
pub struct ConversationHub {
    channels: Channels,
}

/// One client's feed of a conversation. Dropping the last subscription of a
/// conversation removes its channel.
pub struct Subscription {
    conversation_id: String,
    frames: broadcast::Receiver<HubFrame>,
    channels: Channels,
}

impl Subscription {
    pub async fn recv(&mut self) -> Result<HubFrame, RecvError> {
        self.frames.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Subscribing takes the same lock, so a count of one is our own receiver.
        let mut channels = self.channels.lock();
        if channels.get(&self.conversation_id).is_some_and(|tx| tx.receiver_count() <= 1) {
            channels.remove(&self.conversation_id);
            debug!(conversation_id = %self.conversation_id, "last subscriber left");
        }
    }
}

impl ConversationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, conversation_id: &str) -> Subscription {
        let frames = self
            .channels
            .lock()
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        Subscription { conversation_id: conversation_id.to_string(), frames, channels: self.channels.clone() }
    }

    /// Returns how many subscribers received the frame.
    pub fn publish(&self, conversation_id: &str, origin: Option<&str>, envelope: Envelope) -> usize {
        let channels = self.channels.lock();
        let Some(tx) = channels.get(conversation_id) else { return 0 };
        let frame = HubFrame { origin: origin.map(str::to_string), envelope };
        tx.send(frame).unwrap_or(0)
    }
}

#[async_trait]
impl StatusBroadcaster for ConversationHub {
    async fn broadcast(&self, update: &StatusUpdate) -> Result<()> {
        let delivered = self.publish(&update.conversation_id, None, Envelope::Status(update.clone()));
        debug!(conversation_id = %update.conversation_id, status = %update.status, delivered, "status broadcast");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{ConversationStatus, TriggeredBy};
    use std::time::Duration;

    #[tokio::test]
    async fn frames_reach_only_their_conversation() {
        let hub = ConversationHub::new();
        let mut a = hub.subscribe("a");
        let mut b = hub.subscribe("b");

        assert_eq!(hub.publish("a", Some("conn-1"), Envelope::chat("m1", "hi", None)), 1);
        let frame = a.recv().await.unwrap();
        assert!(frame.is_from("conn-1"));
        assert!(tokio::time::timeout(Duration::from_millis(20), b.recv()).await.is_err());
    }

    #[tokio::test]
    async fn status_updates_are_broadcast_without_origin() {
        let hub = ConversationHub::new();
        let mut rx = hub.subscribe("c1");
        let update = StatusUpdate {
            v: Some(protocol::VERSION),
            conversation_id: "c1".into(),
            previous_status: Some(ConversationStatus::AiHandling),
            status: ConversationStatus::AwaitingHumanResponse,
            reason: Some("angry".into()),
            triggered_by: TriggeredBy::Automation,
            assignee: None,
            updated_at: 1,
        };
        hub.broadcast(&update).await.unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.origin, None);
        assert_eq!(frame.envelope, Envelope::Status(update));
    }

    #[test]
    fn closed_subscriptions_leave_no_channels_behind() {
        let hub = ConversationHub::new();
        for i in 0..1000 {
            drop(hub.subscribe(&format!("c{}", i % 10)));
        }
        assert!(hub.channels.lock().is_empty());
        assert_eq!(hub.publish("c1", None, Envelope::heartbeat()), 0);
    }

    #[tokio::test]
    async fn channel_lives_while_any_subscriber_remains() {
        let hub = ConversationHub::new();
        let first = hub.subscribe("c1");
        let mut second = hub.subscribe("c1");

        drop(first);
        assert_eq!(hub.publish("c1", None, Envelope::chat("m1", "still here?", None)), 1);
        assert!(matches!(second.recv().await.unwrap().envelope, Envelope::Message(_)));

        drop(second);
        assert!(hub.channels.lock().is_empty());
    }
}
