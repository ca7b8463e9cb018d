use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use protocol::{Envelope, Inbound};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::frame::coding::CloseCode, Message},
};
use tracing::{debug, warn};

use super::{Connector, Link, LinkEvent, INBOUND_CAPACITY, OUTBOUND_CAPACITY};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::events::TransportKind;

#[derive(Debug, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::FullDuplex
    }

    fn is_supported(&self, config: &TransportConfig) -> bool {
        config
            .ws_url
            .as_deref()
            .is_some_and(|u| u.starts_with("ws://") || u.starts_with("wss://"))
    }

    async fn open(&self, config: &TransportConfig) -> Result<Link, TransportError> {
        let url = config.ws_url.as_deref().ok_or(TransportError::Unsupported)?;
        let (ws_stream, _) = tokio::time::timeout(config.connect_timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::Connect(format!("timed out after {:?}", config.connect_timeout)))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url, "websocket connected");

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(OUTBOUND_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<LinkEvent>(INBOUND_CAPACITY);

        let in_tx_writer = in_tx.clone();
        let send_task = tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(envelope.encode())).await {
                    let _ = in_tx_writer.send(LinkEvent::Failed(format!("write failed: {}", e))).await;
                    return;
                }
            }
            let _ = write.close().await;
        });

        let recv_task = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Envelope::decode(&text) {
                        Ok(Inbound::Known(envelope)) => {
                            if in_tx.send(LinkEvent::Frame(envelope)).await.is_err() {
                                return;
                            }
                        }
                        Ok(Inbound::Unknown(kind)) => warn!(kind = %kind, "dropping unknown envelope type"),
                        Err(e) => warn!("dropping malformed frame: {}", e),
                    },
                    Ok(Message::Close(Some(frame))) if frame.code == CloseCode::Policy => {
                        let _ = in_tx.send(LinkEvent::Rejected(frame.reason.to_string())).await;
                        return;
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                        let _ = in_tx.send(LinkEvent::Closed(reason)).await;
                        return;
                    }
                    Ok(Message::Binary(b)) => debug!(len = b.len(), "ignoring binary frame"),
                    Ok(_) => {}
                    Err(e) => {
                        let _ = in_tx.send(LinkEvent::Failed(format!("ws error: {}", e))).await;
                        return;
                    }
                }
            }
            let _ = in_tx.send(LinkEvent::Closed(None)).await;
        });

        Ok(Link::new(TransportKind::FullDuplex, out_tx, in_rx)
            .with_task(send_task)
            .with_task(recv_task))
    }
}
