use async_trait::async_trait;
use futures_util::StreamExt;
use protocol::{Envelope, Inbound};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Connector, Link, LinkEvent, INBOUND_CAPACITY, OUTBOUND_CAPACITY};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::events::TransportKind;
use crate::streaming::LineBuffer;

/// Half-duplex link: server-sent events for the receive path, one HTTP POST
/// per outgoing envelope. Credentials travel as a bearer token on every
/// request, so the `authenticate` envelope is not forwarded.
#[derive(Debug, Clone, Default)]
pub struct EventStreamConnector {
    http: reqwest::Client,
}

impl EventStreamConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn base_url(config: &TransportConfig) -> Option<String> {
    config.http_url.as_deref().map(|u| u.trim_end_matches('/').to_string())
}

/// Bad token or unknown conversation.
fn is_rejection(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::NOT_FOUND
}

#[async_trait]
impl Connector for EventStreamConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::HalfDuplex
    }

    fn is_supported(&self, config: &TransportConfig) -> bool {
        config
            .http_url
            .as_deref()
            .is_some_and(|u| u.starts_with("http://") || u.starts_with("https://"))
    }

    async fn open(&self, config: &TransportConfig) -> Result<Link, TransportError> {
        let base = base_url(config).ok_or(TransportError::Unsupported)?;
        let events_url = format!("{}/api/conversations/{}/events", base, config.conversation_id);
        let messages_url = format!("{}/api/conversations/{}/messages", base, config.conversation_id);

        let request = self
            .http
            .get(&events_url)
            .bearer_auth(&config.token)
            .header(ACCEPT, "text/event-stream")
            .send();
        let response = tokio::time::timeout(config.connect_timeout, request)
            .await
            .map_err(|_| TransportError::Connect(format!("timed out after {:?}", config.connect_timeout)))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if is_rejection(response.status()) {
            return Err(TransportError::Rejected(format!("event stream refused with {}", response.status())));
        }
        let response = response.error_for_status().map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url = %events_url, "event stream opened");

        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(OUTBOUND_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<LinkEvent>(INBOUND_CAPACITY);

        let mut body = Box::pin(response.bytes_stream());
        let in_tx_reader = in_tx.clone();
        let recv_task = tokio::spawn(async move {
            let mut lines = LineBuffer::new();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = in_tx_reader.send(LinkEvent::Failed(format!("event stream error: {}", e))).await;
                        return;
                    }
                };
                for line in lines.push(&chunk) {
                    let Some(payload) = line.strip_prefix("data:") else { continue };
                    match Envelope::decode(payload.trim_start()) {
                        Ok(Inbound::Known(envelope)) => {
                            if in_tx_reader.send(LinkEvent::Frame(envelope)).await.is_err() {
                                return;
                            }
                        }
                        Ok(Inbound::Unknown(kind)) => warn!(kind = %kind, "dropping unknown envelope type"),
                        Err(e) => warn!("dropping malformed event: {}", e),
                    }
                }
            }
            let _ = in_tx_reader.send(LinkEvent::Closed(None)).await;
        });

        let http = self.http.clone();
        let token = config.token.clone();
        let send_task = tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                if matches!(envelope, Envelope::Authenticate(_)) {
                    continue;
                }
                let result = http.post(&messages_url).bearer_auth(&token).json(&envelope).send().await;
                if let Ok(r) = &result {
                    if is_rejection(r.status()) {
                        let _ = in_tx.send(LinkEvent::Rejected(format!("post refused with {}", r.status()))).await;
                        return;
                    }
                }
                let response = match result.and_then(|r| r.error_for_status()) {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = in_tx.send(LinkEvent::Failed(format!("post failed: {}", e))).await;
                        return;
                    }
                };
                // The reply to a POST (e.g. a delivery confirmation) comes back in its body.
                match response.text().await {
                    Ok(text) if !text.trim().is_empty() => match Envelope::decode(&text) {
                        Ok(Inbound::Known(reply)) => {
                            if in_tx.send(LinkEvent::Frame(reply)).await.is_err() {
                                return;
                            }
                        }
                        Ok(Inbound::Unknown(kind)) => warn!(kind = %kind, "dropping unknown reply type"),
                        Err(e) => warn!("dropping malformed reply: {}", e),
                    },
                    Ok(_) => {}
                    Err(e) => warn!("failed to read reply body: {}", e),
                }
            }
        });

        Ok(Link::new(TransportKind::HalfDuplex, out_tx, in_rx)
            .with_task(recv_task)
            .with_task(send_task))
    }
}
