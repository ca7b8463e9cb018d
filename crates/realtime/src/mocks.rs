//! Scriptable in-process connector for exercising the transport without a
//! network.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use protocol::Envelope;
use tokio::sync::mpsc;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::events::TransportKind;
use crate::link::{Connector, Link, LinkEvent};

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Accept,
    Fail(String),
    /// Wait, then accept.
    Delay(Duration),
}

/// The far end of a link opened by [`ScriptedConnector`].
pub struct MockPeer {
    pub inbound: mpsc::Sender<LinkEvent>,
    pub outbound: mpsc::Receiver<Envelope>,
}

impl MockPeer {
    pub async fn push(&self, envelope: Envelope) {
        let _ = self.inbound.send(LinkEvent::Frame(envelope)).await;
    }

    pub async fn close(&self) {
        let _ = self.inbound.send(LinkEvent::Closed(None)).await;
    }

    /// Close the way a server refusing the credentials does.
    pub async fn reject(&self, reason: &str) {
        let _ = self.inbound.send(LinkEvent::Rejected(reason.to_string())).await;
    }

    /// Next envelope the transport wrote, skipping heartbeats.
    pub async fn next_sent(&mut self) -> Option<Envelope> {
        while let Some(envelope) = self.outbound.recv().await {
            if !matches!(envelope, Envelope::Heartbeat(_)) {
                return Some(envelope);
            }
        }
        None
    }
}

pub struct ScriptedConnector {
    kind: TransportKind,
    supported: bool,
    script: Mutex<VecDeque<ScriptStep>>,
    opened: Mutex<u32>,
    peers: mpsc::UnboundedSender<MockPeer>,
}

impl ScriptedConnector {
    /// Returns the connector and a receiver yielding the peer of every link it opens.
    pub fn new(kind: TransportKind, script: Vec<ScriptStep>) -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            kind,
            supported: true,
            script: Mutex::new(script.into()),
            opened: Mutex::new(0),
            peers: tx,
        };
        (connector, rx)
    }

    pub fn unsupported(kind: TransportKind) -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self { kind, supported: false, script: Mutex::new(VecDeque::new()), opened: Mutex::new(0), peers: tx }
    }

    /// Number of `open` calls so far.
    pub fn attempts(&self) -> u32 {
        *self.opened.lock()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn is_supported(&self, _config: &TransportConfig) -> bool {
        self.supported
    }

    async fn open(&self, _config: &TransportConfig) -> Result<Link, TransportError> {
        *self.opened.lock() += 1;
        let step = self.script.lock().pop_front();
        match step {
            Some(ScriptStep::Accept) => {}
            Some(ScriptStep::Delay(d)) => tokio::time::sleep(d).await,
            Some(ScriptStep::Fail(reason)) => return Err(TransportError::Connect(reason)),
            None => return Err(TransportError::Connect("script exhausted".into())),
        }
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let _ = self.peers.send(MockPeer { inbound: in_tx, outbound: out_rx });
        Ok(Link::new(self.kind, out_tx, in_rx))
    }
}
