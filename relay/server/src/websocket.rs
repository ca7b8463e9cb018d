use anyhow::{bail, Result};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Extension,
    },
    response::IntoResponse,
};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use protocol::{Envelope, Inbound, ERROR_UNAUTHORIZED};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{dispatch, AppState};

const OUTGOING_CAPACITY: usize = 256;

#[derive(Debug)]
pub enum Outgoing {
    Envelope(Envelope),
    Close(Option<CloseFrame<'static>>),
}

pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    Extension(state): Extension<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket_handler(socket, state))
}

/// The first frame must be a valid `authenticate`; returns its conversation id.
async fn authenticate(state: &AppState, receiver: &mut SplitStream<WebSocket>) -> Result<String> {
    let first = match tokio::time::timeout(state.config.auth_timeout, receiver.next()).await {
        Err(_) => bail!("no authenticate frame within {:?}", state.config.auth_timeout),
        Ok(None) => bail!("socket closed before authenticating"),
        Ok(Some(msg)) => msg?,
    };
    let Message::Text(text) = first else { bail!("first frame must be authenticate") };
    let Ok(Inbound::Known(Envelope::Authenticate(auth))) = Envelope::decode(&text) else {
        bail!("first frame must be authenticate");
    };
    match state.store.conversation_token(&auth.conversation_id).await? {
        Some(token) if token == auth.token => Ok(auth.conversation_id),
        _ => bail!("invalid conversation or token"),
    }
}

async fn websocket_handler(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outgoing>(OUTGOING_CAPACITY);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                Outgoing::Envelope(envelope) => {
                    if ws_sender.send(Message::Text(envelope.encode())).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close(frame) => {
                    let _ = ws_sender.send(Message::Close(frame)).await;
                    break;
                }
            }
        }
    });

    let conversation_id = match authenticate(&state, &mut ws_receiver).await {
        Ok(id) => id,
        Err(e) => {
            warn!(%conn_id, "rejecting websocket: {:#}", e);
            let _ = tx.send(Outgoing::Envelope(Envelope::error(ERROR_UNAUTHORIZED, e.to_string()))).await;
            let frame = CloseFrame { code: close_code::POLICY, reason: ERROR_UNAUTHORIZED.into() };
            let _ = tx.send(Outgoing::Close(Some(frame))).await;
            drop(tx);
            let _ = send_task.await;
            return;
        }
    };
    info!(%conversation_id, %conn_id, "client connected");

    let mut frames = state.hub.subscribe(&conversation_id);
    let tx_hub = tx.clone();
    let tag = conn_id.clone();
    let hub_task = tokio::spawn(async move {
        loop {
            match frames.recv().await {
                Ok(frame) if frame.is_from(&tag) => continue,
                Ok(frame) => {
                    if tx_hub.send(Outgoing::Envelope(frame.envelope)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "client fell behind conversation frames"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let tx_hb = tx.clone();
    let period = state.config.heartbeat_interval;
    // The first tick fires immediately and tells the client it was accepted.
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            if tx_hb.send(Outgoing::Envelope(Envelope::heartbeat())).await.is_err() {
                break;
            }
        }
    });

    'frames: while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(%conn_id, "websocket error: {}", e);
                break;
            }
        };
        let envelope = match Envelope::decode(&text) {
            Ok(Inbound::Known(envelope)) => envelope,
            Ok(Inbound::Unknown(kind)) => {
                warn!(kind = %kind, "ignoring unknown envelope type");
                continue;
            }
            Err(e) => {
                warn!("ignoring malformed frame: {}", e);
                continue;
            }
        };
        for reply in dispatch(&state, &conversation_id, Some(&conn_id), envelope).await {
            if tx.send(Outgoing::Envelope(reply)).await.is_err() {
                break 'frames;
            }
        }
    }

    hub_task.abort();
    heartbeat_task.abort();
    send_task.abort();
    info!(%conversation_id, %conn_id, "client disconnected");
}
