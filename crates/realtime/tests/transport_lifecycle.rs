use std::sync::Arc;
use std::time::Duration;

use protocol::{ConversationStatus, Envelope, StatusUpdate, TriggeredBy, ERROR_UNAUTHORIZED};
use realtime::link::Connector;
use realtime::mocks::{MockPeer, ScriptStep, ScriptedConnector};
use realtime::{
    ConnectionState, DeliveryStatus, RealtimeTransport, ReconnectConfig, TransportConfig, TransportError,
    TransportEvent, TransportKind,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

fn config() -> TransportConfig {
    TransportConfig {
        session_id: "s1".into(),
        token: "tok".into(),
        conversation_id: "c1".into(),
        heartbeat_interval: Duration::from_secs(10),
        heartbeat_timeout: Duration::from_secs(25),
        delivery_timeout: Duration::from_secs(5),
        reconnect: ReconnectConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            jitter: Duration::from_millis(250),
            max_attempts: 3,
        },
        ..Default::default()
    }
}

fn start(script: Vec<ScriptStep>) -> (RealtimeTransport, broadcast::Receiver<TransportEvent>, mpsc::UnboundedReceiver<MockPeer>) {
    let (connector, peers) = ScriptedConnector::new(TransportKind::FullDuplex, script);
    let transport = RealtimeTransport::spawn(config(), vec![Arc::new(connector) as Arc<dyn Connector>]).unwrap();
    let events = transport.subscribe();
    (transport, events, peers)
}

async fn wait_for(
    events: &mut broadcast::Receiver<TransportEvent>,
    pred: impl Fn(&TransportEvent) -> bool,
) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

async fn connected(events: &mut broadcast::Receiver<TransportEvent>) -> TransportKind {
    match wait_for(events, |e| matches!(e, TransportEvent::Connected { .. })).await {
        TransportEvent::Connected { kind } => kind,
        _ => unreachable!(),
    }
}

#[tokio::test(start_paused = true)]
async fn connect_sends_authenticate() {
    let (transport, mut events, mut peers) = start(vec![ScriptStep::Accept]);
    transport.connect();

    assert_eq!(
        events.recv().await.unwrap(),
        TransportEvent::StateChanged(ConnectionState::Connecting)
    );
    assert_eq!(connected(&mut events).await, TransportKind::FullDuplex);
    assert_eq!(transport.state(), ConnectionState::Connected);

    let mut peer = peers.recv().await.unwrap();
    match peer.next_sent().await.unwrap() {
        Envelope::Authenticate(auth) => {
            assert_eq!(auth.session_id, "s1");
            assert_eq!(auth.token, "tok");
            assert_eq!(auth.conversation_id, "c1");
        }
        other => panic!("expected authenticate, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn heartbeat_silence_moves_to_reconnecting() {
    let (transport, mut events, mut peers) = start(vec![ScriptStep::Accept, ScriptStep::Accept]);
    transport.connect();
    connected(&mut events).await;
    let _peer = peers.recv().await.unwrap();
    let since = Instant::now();

    wait_for(&mut events, |e| *e == TransportEvent::StateChanged(ConnectionState::Reconnecting)).await;
    assert!(Instant::now() - since >= Duration::from_secs(25));

    match wait_for(&mut events, |e| matches!(e, TransportEvent::Reconnecting { .. })).await {
        TransportEvent::Reconnecting { attempt, .. } => assert_eq!(attempt, 1),
        _ => unreachable!(),
    }
    connected(&mut events).await;
}

#[tokio::test(start_paused = true)]
async fn server_heartbeats_keep_the_link_alive() {
    let (transport, mut events, mut peers) = start(vec![ScriptStep::Accept]);
    transport.connect();
    connected(&mut events).await;
    let mut peer = peers.recv().await.unwrap();

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(10)).await;
        peer.push(Envelope::heartbeat()).await;
    }
    assert_eq!(transport.state(), ConnectionState::Connected);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, TransportEvent::Reconnecting { .. }), "unexpected {:?}", event);
    }

    // Full-duplex links also emit their own heartbeats.
    let mut saw_heartbeat = false;
    while let Ok(envelope) = peer.outbound.try_recv() {
        saw_heartbeat |= matches!(envelope, Envelope::Heartbeat(_));
    }
    assert!(saw_heartbeat);
}

#[tokio::test(start_paused = true)]
async fn confirmed_message_is_delivered_once() {
    let (transport, mut events, mut peers) = start(vec![ScriptStep::Accept]);
    transport.connect();
    connected(&mut events).await;
    let mut peer = peers.recv().await.unwrap();
    peer.next_sent().await.unwrap();

    let id = transport.send_text("hello", Some(0.2));
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, TransportEvent::Delivery { .. })).await,
        TransportEvent::Delivery { message_id: id.clone(), status: DeliveryStatus::Pending }
    );
    match peer.next_sent().await.unwrap() {
        Envelope::Message(msg) => {
            assert_eq!(msg.id, id);
            assert_eq!(msg.text, "hello");
        }
        other => panic!("expected message, got {:?}", other),
    }

    peer.push(Envelope::delivery_confirmation(id.clone())).await;
    peer.push(Envelope::delivery_confirmation(id.clone())).await;
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, TransportEvent::Delivery { .. })).await,
        TransportEvent::Delivery { message_id: id.clone(), status: DeliveryStatus::Delivered }
    );

    // A later timeout must not fail an already delivered message.
    tokio::time::sleep(Duration::from_secs(6)).await;
    peer.push(Envelope::error("marker", "end of test")).await;
    let next = wait_for(&mut events, |e| {
        matches!(e, TransportEvent::Delivery { .. } | TransportEvent::Error(TransportError::Server { .. }))
    })
    .await;
    assert!(matches!(next, TransportEvent::Error(TransportError::Server { .. })), "got {:?}", next);
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_message_times_out_and_late_confirmation_is_ignored() {
    let (transport, mut events, mut peers) = start(vec![ScriptStep::Accept]);
    transport.connect();
    connected(&mut events).await;
    let peer = peers.recv().await.unwrap();

    let id = transport.send_text("anyone there?", None);
    wait_for(&mut events, |e| matches!(e, TransportEvent::Delivery { status: DeliveryStatus::Pending, .. })).await;

    match wait_for(&mut events, |e| matches!(e, TransportEvent::Delivery { .. })).await {
        TransportEvent::Delivery { message_id, status: DeliveryStatus::Failed(TransportError::DeliveryTimeout { timeout, .. }) } => {
            assert_eq!(message_id, id);
            assert_eq!(timeout, Duration::from_secs(5));
        }
        other => panic!("expected timeout, got {:?}", other),
    }

    peer.push(Envelope::delivery_confirmation(id)).await;
    peer.push(Envelope::error("marker", "end of test")).await;
    let next = wait_for(&mut events, |e| {
        matches!(e, TransportEvent::Delivery { .. } | TransportEvent::Error(TransportError::Server { .. }))
    })
    .await;
    assert!(matches!(next, TransportEvent::Error(TransportError::Server { .. })), "got {:?}", next);
}

#[tokio::test(start_paused = true)]
async fn send_before_connect_fails_the_message() {
    let (transport, mut events, _peers) = start(vec![]);
    let id = transport.send_text("too early", None);

    assert_eq!(
        events.recv().await.unwrap(),
        TransportEvent::Delivery { message_id: id, status: DeliveryStatus::Failed(TransportError::NotConnected) }
    );
    assert_eq!(events.recv().await.unwrap(), TransportEvent::Error(TransportError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn falls_back_to_half_duplex() {
    let (ws, _ws_peers) = ScriptedConnector::new(TransportKind::FullDuplex, vec![ScriptStep::Fail("refused".into())]);
    let ws = Arc::new(ws);
    let (sse, mut sse_peers) = ScriptedConnector::new(TransportKind::HalfDuplex, vec![ScriptStep::Accept]);
    let transport = RealtimeTransport::spawn(config(), vec![ws.clone() as Arc<dyn Connector>, Arc::new(sse)]).unwrap();
    let mut events = transport.subscribe();

    transport.connect();
    assert_eq!(connected(&mut events).await, TransportKind::HalfDuplex);
    assert_eq!(ws.attempts(), 1);

    let mut peer = sse_peers.recv().await.unwrap();
    assert!(matches!(peer.outbound.recv().await.unwrap(), Envelope::Authenticate(_)));

    // Half-duplex links never emit client heartbeats.
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(peer.outbound.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn unsupported_connector_is_skipped() {
    let ws = ScriptedConnector::unsupported(TransportKind::FullDuplex);
    let (sse, _sse_peers) = ScriptedConnector::new(TransportKind::HalfDuplex, vec![ScriptStep::Accept]);
    let ws = Arc::new(ws);
    let transport = RealtimeTransport::spawn(config(), vec![ws.clone() as Arc<dyn Connector>, Arc::new(sse)]).unwrap();
    let mut events = transport.subscribe();

    transport.connect();
    assert_eq!(connected(&mut events).await, TransportKind::HalfDuplex);
    assert_eq!(ws.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn reconnect_budget_is_exhausted_then_restored_by_connect() {
    let script = vec![
        ScriptStep::Fail("down".into()),
        ScriptStep::Fail("down".into()),
        ScriptStep::Fail("down".into()),
        ScriptStep::Fail("down".into()),
        ScriptStep::Accept,
    ];
    let (transport, mut events, _peers) = start(script);
    transport.connect();

    let mut delays = Vec::new();
    let attempts = loop {
        match wait_for(&mut events, |e| {
            matches!(e, TransportEvent::Reconnecting { .. } | TransportEvent::ConnectionExhausted { .. })
        })
        .await
        {
            TransportEvent::Reconnecting { attempt, delay } => {
                assert_eq!(attempt as usize, delays.len() + 1);
                delays.push(delay);
            }
            TransportEvent::ConnectionExhausted { attempts } => break attempts,
            _ => unreachable!(),
        }
    };

    assert_eq!(attempts, 3);
    assert_eq!(delays.len(), 3);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{:?}", delays);
    assert!(delays.iter().all(|d| *d <= Duration::from_secs(8)));
    wait_for(&mut events, |e| *e == TransportEvent::StateChanged(ConnectionState::Disconnected)).await;
    assert_eq!(transport.state(), ConnectionState::Disconnected);

    transport.connect();
    assert_eq!(connected(&mut events).await, TransportKind::FullDuplex);
}

#[tokio::test(start_paused = true)]
async fn peer_close_reconnects_and_resets_attempts() {
    let (transport, mut events, mut peers) =
        start(vec![ScriptStep::Accept, ScriptStep::Accept, ScriptStep::Accept]);
    transport.connect();
    connected(&mut events).await;

    for _ in 0..2 {
        let peer = peers.recv().await.unwrap();
        peer.push(Envelope::heartbeat()).await;
        peer.close().await;
        match wait_for(&mut events, |e| matches!(e, TransportEvent::Reconnecting { .. })).await {
            TransportEvent::Reconnecting { attempt, .. } => assert_eq!(attempt, 1),
            _ => unreachable!(),
        }
        connected(&mut events).await;
    }
}

#[tokio::test(start_paused = true)]
async fn links_dropped_before_any_server_frame_use_up_the_budget() {
    let (transport, mut events, mut peers) = start(vec![ScriptStep::Accept; 10]);
    let closer = tokio::spawn(async move {
        while let Some(peer) = peers.recv().await {
            peer.close().await;
        }
    });
    transport.connect();

    let mut attempts_seen = Vec::new();
    let exhausted = loop {
        match wait_for(&mut events, |e| {
            matches!(e, TransportEvent::Reconnecting { .. } | TransportEvent::ConnectionExhausted { .. })
        })
        .await
        {
            TransportEvent::Reconnecting { attempt, .. } => attempts_seen.push(attempt),
            TransportEvent::ConnectionExhausted { attempts } => break attempts,
            _ => unreachable!(),
        }
    };
    assert_eq!(attempts_seen, vec![1, 2, 3]);
    assert_eq!(exhausted, 3);
    wait_for(&mut events, |e| *e == TransportEvent::StateChanged(ConnectionState::Disconnected)).await;
    closer.abort();
}

async fn assert_stays_disconnected(
    transport: &RealtimeTransport,
    events: &mut broadcast::Receiver<TransportEvent>,
    peers: &mut mpsc::UnboundedReceiver<MockPeer>,
) {
    wait_for(events, |e| *e == TransportEvent::StateChanged(ConnectionState::Disconnected)).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.state(), ConnectionState::Disconnected);
    assert!(peers.try_recv().is_err(), "transport reconnected after rejection");
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, TransportEvent::Reconnecting { .. } | TransportEvent::Connected { .. }),
            "unexpected {:?}",
            event
        );
    }
}

#[tokio::test(start_paused = true)]
async fn unauthorized_error_stops_reconnecting() {
    let (transport, mut events, mut peers) = start(vec![ScriptStep::Accept; 20]);
    transport.connect();
    connected(&mut events).await;

    let peer = peers.recv().await.unwrap();
    peer.push(Envelope::error(ERROR_UNAUTHORIZED, "invalid conversation or token")).await;
    peer.close().await;

    assert_eq!(
        wait_for(&mut events, |e| matches!(e, TransportEvent::Error(_))).await,
        TransportEvent::Error(TransportError::Rejected("invalid conversation or token".into()))
    );
    assert_stays_disconnected(&transport, &mut events, &mut peers).await;

    // An explicit connect tries again.
    transport.connect();
    connected(&mut events).await;
}

#[tokio::test(start_paused = true)]
async fn policy_close_stops_reconnecting() {
    let (transport, mut events, mut peers) = start(vec![ScriptStep::Accept; 20]);
    transport.connect();
    connected(&mut events).await;

    peers.recv().await.unwrap().reject("unauthorized").await;
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, TransportEvent::Error(_))).await,
        TransportEvent::Error(TransportError::Rejected("unauthorized".into()))
    );
    assert_stays_disconnected(&transport, &mut events, &mut peers).await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_abandons_in_flight_connect() {
    let (transport, mut events, mut peers) = start(vec![ScriptStep::Delay(Duration::from_secs(5))]);
    transport.connect();
    wait_for(&mut events, |e| *e == TransportEvent::StateChanged(ConnectionState::Connecting)).await;

    transport.disconnect();
    wait_for(&mut events, |e| *e == TransportEvent::StateChanged(ConnectionState::Closed)).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.state(), ConnectionState::Closed);
    assert!(peers.try_recv().is_err());
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, TransportEvent::Connected { .. }), "late connect leaked: {:?}", event);
    }

    transport.connect();
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, TransportEvent::Error(_))).await,
        TransportEvent::Error(TransportError::Closed)
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_fails_pending_deliveries() {
    let (transport, mut events, mut peers) = start(vec![ScriptStep::Accept]);
    transport.connect();
    connected(&mut events).await;
    let _peer = peers.recv().await.unwrap();

    let id = transport.send_text("bye", None);
    wait_for(&mut events, |e| matches!(e, TransportEvent::Delivery { status: DeliveryStatus::Pending, .. })).await;

    transport.disconnect();
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, TransportEvent::Delivery { .. })).await,
        TransportEvent::Delivery { message_id: id, status: DeliveryStatus::Failed(TransportError::Closed) }
    );
    wait_for(&mut events, |e| *e == TransportEvent::StateChanged(ConnectionState::Closed)).await;
}

#[tokio::test(start_paused = true)]
async fn inbound_envelopes_become_events() {
    let (transport, mut events, mut peers) = start(vec![ScriptStep::Accept]);
    transport.connect();
    connected(&mut events).await;
    let peer = peers.recv().await.unwrap();

    let update = StatusUpdate {
        v: Some(protocol::VERSION),
        conversation_id: "c1".into(),
        previous_status: Some(ConversationStatus::AiHandling),
        status: ConversationStatus::AwaitingHumanResponse,
        reason: Some("angry customer".into()),
        triggered_by: TriggeredBy::Automation,
        assignee: None,
        updated_at: 1,
    };
    peer.push(Envelope::Status(update.clone())).await;
    peer.push(Envelope::chat("a1", "An agent will be with you shortly", None)).await;

    assert_eq!(
        wait_for(&mut events, |e| matches!(e, TransportEvent::ConversationStatus(_))).await,
        TransportEvent::ConversationStatus(update)
    );
    match wait_for(&mut events, |e| matches!(e, TransportEvent::Message(_))).await {
        TransportEvent::Message(msg) => assert_eq!(msg.id, "a1"),
        _ => unreachable!(),
    }
}

#[tokio::test(start_paused = true)]
async fn dispose_closes_and_stops_the_actor() {
    let (transport, mut events, mut peers) = start(vec![ScriptStep::Accept]);
    transport.connect();
    connected(&mut events).await;
    let mut peer = peers.recv().await.unwrap();
    let mut state = transport.watch_state();

    transport.dispose().await;
    assert_eq!(*state.borrow_and_update(), ConnectionState::Closed);
    // The link is dropped with the actor.
    while peer.outbound.recv().await.is_some() {}
}

#[test]
fn invalid_config_is_rejected() {
    let bad = TransportConfig { conversation_id: String::new(), ..config() };
    let (connector, _) = ScriptedConnector::new(TransportKind::FullDuplex, vec![]);
    let result = RealtimeTransport::spawn(bad, vec![Arc::new(connector) as Arc<dyn Connector>]);
    assert!(matches!(result, Err(TransportError::Config(_))));
}
