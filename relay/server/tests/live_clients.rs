//! Real clients against a relay bound to an ephemeral port.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{extract::Json, routing::post, Router};
use futures_util::{SinkExt, StreamExt};
use protocol::{ConversationStatus, Envelope, Inbound};
use realtime::{
    ConnectionState, DeliveryStatus, RealtimeTransport, TransportConfig, TransportError, TransportEvent, TransportKind,
};
use serde_json::{json, Value};
use support_core::ports::{EscalationPriority, Notification, Notifier};
use support_relay::{notify::WebhookNotifier, router, AppState, ServerConfig};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(5);

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn relay_with_conversation() -> (SocketAddr, AppState) {
    let state = AppState::in_memory(ServerConfig::default(), Vec::new());
    state.store.create_conversation("c1", "secret").await.unwrap();
    let addr = serve(router(state.clone())).await;
    (addr, state)
}

fn client_config(ws_url: Option<String>, http_url: Option<String>) -> TransportConfig {
    TransportConfig {
        ws_url,
        http_url,
        session_id: "s1".into(),
        token: "secret".into(),
        conversation_id: "c1".into(),
        ..TransportConfig::default()
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<TransportEvent>,
    pred: impl Fn(&TransportEvent) -> bool,
) -> TransportEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("transport went away"),
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}

#[tokio::test]
async fn websocket_client_gets_confirmations_and_status_updates() {
    let (addr, _state) = relay_with_conversation().await;
    let transport = RealtimeTransport::new(client_config(Some(format!("ws://{}/ws", addr)), None)).unwrap();
    let mut events = transport.subscribe();

    transport.connect();
    wait_for(&mut events, |e| matches!(e, TransportEvent::Connected { kind: TransportKind::FullDuplex })).await;

    let id = transport.send_text("hello there", Some(0.2));
    wait_for(&mut events, |e| {
        matches!(e, TransportEvent::Delivery { message_id, status: DeliveryStatus::Delivered } if *message_id == id)
    })
    .await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/api/conversations/c1/status", addr))
        .json(&json!({
            "conversationId": "c1",
            "newStatus": "awaiting_human_response",
            "reason": "handoff",
            "triggeredBy": "agent",
            "agentId": "agent-1",
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let event = wait_for(&mut events, |e| matches!(e, TransportEvent::ConversationStatus(_))).await;
    match event {
        TransportEvent::ConversationStatus(update) => {
            assert_eq!(update.status, ConversationStatus::AwaitingHumanResponse);
            assert_eq!(update.previous_status, Some(ConversationStatus::AiHandling));
            assert_eq!(update.assignee.as_deref(), Some("agent-1"));
        }
        other => panic!("unexpected {:?}", other),
    }

    transport.dispose().await;
}

#[tokio::test]
async fn half_duplex_client_works_without_websocket() {
    let (addr, _state) = relay_with_conversation().await;
    let transport = RealtimeTransport::new(client_config(None, Some(format!("http://{}", addr)))).unwrap();
    let mut events = transport.subscribe();

    transport.connect();
    wait_for(&mut events, |e| matches!(e, TransportEvent::Connected { kind: TransportKind::HalfDuplex })).await;

    let id = transport.send_text("over plain http", None);
    wait_for(&mut events, |e| {
        matches!(e, TransportEvent::Delivery { message_id, status: DeliveryStatus::Delivered } if *message_id == id)
    })
    .await;

    transport.dispose().await;
}

#[tokio::test]
async fn messages_fan_out_to_other_clients_of_the_conversation() {
    let (addr, _state) = relay_with_conversation().await;
    let ws_client = RealtimeTransport::new(client_config(Some(format!("ws://{}/ws", addr)), None)).unwrap();
    let sse_client = RealtimeTransport::new(client_config(None, Some(format!("http://{}", addr)))).unwrap();
    let mut ws_events = ws_client.subscribe();
    let mut sse_events = sse_client.subscribe();

    ws_client.connect();
    sse_client.connect();
    wait_for(&mut ws_events, |e| matches!(e, TransportEvent::Connected { .. })).await;
    wait_for(&mut sse_events, |e| matches!(e, TransportEvent::Connected { .. })).await;

    ws_client.send_text("anyone there?", None);
    let event = wait_for(&mut sse_events, |e| matches!(e, TransportEvent::Message(_))).await;
    match event {
        TransportEvent::Message(msg) => {
            assert_eq!(msg.text, "anyone there?");
            assert_eq!(msg.conversation_id.as_deref(), Some("c1"));
        }
        other => panic!("unexpected {:?}", other),
    }

    ws_client.dispose().await;
    sse_client.dispose().await;
}

async fn assert_rejected_without_retry(transport: RealtimeTransport) {
    let mut events = transport.subscribe();
    transport.connect();
    let error = wait_for(&mut events, |e| matches!(e, TransportEvent::Error(TransportError::Rejected(_)))).await;
    assert!(matches!(error, TransportEvent::Error(TransportError::Rejected(_))));
    wait_for(&mut events, |e| *e == TransportEvent::StateChanged(ConnectionState::Disconnected)).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(transport.state(), ConnectionState::Disconnected);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, TransportEvent::Reconnecting { .. }), "unexpected {:?}", event);
    }
    transport.dispose().await;
}

#[tokio::test]
async fn websocket_client_with_wrong_token_gives_up() {
    let (addr, _state) = relay_with_conversation().await;
    let config = TransportConfig { token: "wrong".into(), ..client_config(Some(format!("ws://{}/ws", addr)), None) };
    assert_rejected_without_retry(RealtimeTransport::new(config).unwrap()).await;
}

#[tokio::test]
async fn half_duplex_client_with_wrong_token_gives_up() {
    let (addr, _state) = relay_with_conversation().await;
    let config = TransportConfig { token: "wrong".into(), ..client_config(None, Some(format!("http://{}", addr))) };
    assert_rejected_without_retry(RealtimeTransport::new(config).unwrap()).await;
}

#[tokio::test]
async fn websocket_with_bad_token_is_closed() {
    let (addr, _state) = relay_with_conversation().await;
    let (mut socket, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

    socket
        .send(Message::Text(Envelope::authenticate("s1", "wrong", "c1").encode()))
        .await
        .unwrap();

    let first = tokio::time::timeout(WAIT, socket.next()).await.unwrap().unwrap().unwrap();
    let Message::Text(text) = first else { panic!("expected an error frame, got {:?}", first) };
    match Envelope::decode(&text).unwrap() {
        Inbound::Known(Envelope::Error(notice)) => assert_eq!(notice.code, "unauthorized"),
        other => panic!("unexpected {:?}", other),
    }

    let closed = tokio::time::timeout(WAIT, socket.next()).await.unwrap();
    assert!(matches!(closed, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
}

#[tokio::test]
async fn websocket_must_authenticate_first() {
    let (addr, _state) = relay_with_conversation().await;
    let (mut socket, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

    socket.send(Message::Text(Envelope::chat("m1", "hi", None).encode())).await.unwrap();

    let first = tokio::time::timeout(WAIT, socket.next()).await.unwrap().unwrap().unwrap();
    let Message::Text(text) = first else { panic!("expected an error frame, got {:?}", first) };
    assert!(matches!(Envelope::decode(&text).unwrap(), Inbound::Known(Envelope::Error(_))));
}

#[tokio::test]
async fn webhook_notifier_posts_recipients_and_notification() {
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let hook = Router::new().route(
        "/hook",
        post(move |Json(body): Json<Value>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(body);
            }
        }),
    );
    let addr = serve(hook).await;

    let notifier = WebhookNotifier::new(format!("http://{}/hook", addr));
    let notification = Notification {
        conversation_id: "c1".into(),
        subject: "Conversation escalated".into(),
        body: "Angry customer".into(),
        priority: EscalationPriority::Urgent,
        tags: vec!["billing".into()],
    };
    notifier.notify(&["team-billing".to_string()], &notification).await.unwrap();

    let body = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(body["recipients"], json!(["team-billing"]));
    assert_eq!(body["notification"]["priority"], "urgent");
    assert_eq!(body["notification"]["conversation_id"], "c1");
}

#[tokio::test]
async fn webhook_failure_is_an_error() {
    let notifier = WebhookNotifier::new("http://127.0.0.1:9/unreachable");
    let notification = Notification {
        conversation_id: "c1".into(),
        subject: "s".into(),
        body: "b".into(),
        priority: EscalationPriority::Low,
        tags: Vec::new(),
    };
    assert!(notifier.notify(&[], &notification).await.is_err());
}
