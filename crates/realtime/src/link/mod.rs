//! Concrete channels underneath the transport. A [`Connector`] opens a
//! [`Link`]; the link's background tasks own the socket and exchange
//! envelopes with the transport over channels.

pub mod event_stream;
pub mod websocket;

pub use event_stream::EventStreamConnector;
pub use websocket::WebSocketConnector;

use std::sync::Arc;

use async_trait::async_trait;
use protocol::Envelope;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::events::TransportKind;

pub(crate) const OUTBOUND_CAPACITY: usize = 64;
pub(crate) const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Frame(Envelope),
    /// Remote side closed the channel.
    Closed(Option<String>),
    /// Remote side refused the credentials; reconnecting will not help.
    Rejected(String),
    Failed(String),
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether this connector can be used with `config` at all.
    fn is_supported(&self, config: &TransportConfig) -> bool;

    async fn open(&self, config: &TransportConfig) -> Result<Link, TransportError>;
}

/// An open channel. Dropping it stops its I/O tasks.
pub struct Link {
    kind: TransportKind,
    outbound: mpsc::Sender<Envelope>,
    inbound: mpsc::Receiver<LinkEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    pub fn new(kind: TransportKind, outbound: mpsc::Sender<Envelope>, inbound: mpsc::Receiver<LinkEvent>) -> Self {
        Self { kind, outbound, inbound, tasks: Vec::new() }
    }

    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Never waits; a full queue is reported as a send failure.
    pub fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.outbound.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Send("outbound queue full".into()),
            mpsc::error::TrySendError::Closed(_) => TransportError::Send("link closed".into()),
        })
    }

    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.inbound.recv().await
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Full-duplex first, half-duplex as fallback (or the reverse when
/// `prefer_half_duplex` is set).
pub fn default_connectors(config: &TransportConfig) -> Vec<Arc<dyn Connector>> {
    let ws: Arc<dyn Connector> = Arc::new(WebSocketConnector::new());
    let sse: Arc<dyn Connector> = Arc::new(EventStreamConnector::new());
    if config.prefer_half_duplex {
        vec![sse, ws]
    } else {
        vec![ws, sse]
    }
}
