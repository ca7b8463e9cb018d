use std::future::pending;
use std::sync::Arc;

use protocol::{Envelope, ERROR_UNAUTHORIZED};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::delivery::DeliveryTracker;
use crate::error::TransportError;
use crate::events::{ConnectionState, DeliveryStatus, TransportEvent, TransportKind};
use crate::heartbeat::HeartbeatMonitor;
use crate::link::{default_connectors, Connector, Link, LinkEvent};
use crate::reconnect::ReconnectPolicy;

const EVENT_CAPACITY: usize = 256;

enum Command {
    Connect,
    Send(Envelope),
    Disconnect,
    Shutdown,
}

type Attempt = JoinHandle<(u64, Result<Link, TransportError>)>;

/// Handle to a transport actor. All methods enqueue and return immediately;
/// outcomes are reported on the event stream.
pub struct RealtimeTransport {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<TransportEvent>,
    state: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

impl RealtimeTransport {
    /// Start a transport using the WebSocket and event-stream connectors.
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let connectors = default_connectors(&config);
        Self::spawn(config, connectors)
    }

    /// Start a transport over `connectors`, tried in order on every attempt.
    pub fn spawn(config: TransportConfig, connectors: Vec<Arc<dyn Connector>>) -> Result<Self, TransportError> {
        config.validate()?;
        if connectors.is_empty() {
            return Err(TransportError::Unsupported);
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = Actor {
            heartbeat: HeartbeatMonitor::new(config.heartbeat_interval, config.heartbeat_timeout),
            delivery: DeliveryTracker::new(config.delivery_timeout),
            reconnect: ReconnectPolicy::new(config.reconnect.clone()),
            config,
            connectors,
            events: events.clone(),
            state_tx,
            state: ConnectionState::Disconnected,
            link: None,
            accepted: false,
            attempt: None,
            generation: 0,
            outbound_tick: None,
            retry_at: None,
        };
        let task = tokio::spawn(actor.run(cmd_rx));

        Ok(Self { commands: cmd_tx, events, state: state_rx, task: Some(task) })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    pub fn send(&self, envelope: Envelope) {
        self.command(Command::Send(envelope));
    }

    /// Send a customer chat message; returns its id for delivery tracking.
    pub fn send_text(&self, text: impl Into<String>, sentiment_score: Option<f64>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.send(Envelope::chat(id.clone(), text, sentiment_score));
        id
    }

    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Close the transport and wait for the actor to release everything.
    pub async fn dispose(mut self) {
        self.command(Command::Shutdown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn command(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            debug!("transport actor already stopped");
        }
    }
}

impl Drop for RealtimeTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Owns every piece of mutable transport state. Timers are arms of one
/// `select!`, so no two callbacks ever run concurrently.
struct Actor {
    config: TransportConfig,
    connectors: Vec<Arc<dyn Connector>>,
    events: broadcast::Sender<TransportEvent>,
    state_tx: watch::Sender<ConnectionState>,
    state: ConnectionState,
    link: Option<Link>,
    /// Set by the first non-error frame on the current link. Until then the
    /// link counts as another reconnect attempt.
    accepted: bool,
    attempt: Option<Attempt>,
    /// Bumped whenever an in-flight attempt is abandoned.
    generation: u64,
    heartbeat: HeartbeatMonitor,
    outbound_tick: Option<Interval>,
    delivery: DeliveryTracker,
    reconnect: ReconnectPolicy,
    retry_at: Option<Instant>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Connect) => self.connect(),
                    Some(Command::Send(envelope)) => self.send(envelope),
                    Some(Command::Disconnect) => self.close(),
                    Some(Command::Shutdown) | None => {
                        self.close();
                        break;
                    }
                },
                joined = join_attempt(&mut self.attempt) => {
                    self.attempt = None;
                    self.on_attempt(joined);
                }
                event = recv_link(&mut self.link) => self.on_link_event(event),
                _ = sleep_until_opt(self.heartbeat.deadline()) => self.on_heartbeat_timeout(),
                _ = sleep_until_opt(self.delivery.next_deadline()) => self.expire_deliveries(),
                _ = sleep_until_opt(self.retry_at) => {
                    self.retry_at = None;
                    self.start_attempt();
                }
                _ = tick_opt(&mut self.outbound_tick) => self.send_heartbeat(),
            }
        }
        debug!("transport actor stopped");
    }

    fn emit(&self, event: TransportEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "transport state");
        self.state = state;
        let _ = self.state_tx.send(state);
        self.emit(TransportEvent::StateChanged(state));
    }

    fn connect(&mut self) {
        match self.state {
            ConnectionState::Closed => {
                self.emit(TransportEvent::Error(TransportError::Closed));
            }
            ConnectionState::Connected | ConnectionState::Connecting => {
                debug!(state = %self.state, "connect ignored");
            }
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                self.reconnect.reset();
                self.retry_at = None;
                self.set_state(ConnectionState::Connecting);
                self.start_attempt();
            }
        }
    }

    fn start_attempt(&mut self) {
        self.abandon_attempt();
        let generation = self.generation;
        let connectors = self.connectors.clone();
        let config = self.config.clone();
        self.attempt = Some(tokio::spawn(async move { (generation, open_first(&connectors, &config).await) }));
    }

    fn abandon_attempt(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(task) = self.attempt.take() {
            task.abort();
        }
    }

    fn on_attempt(&mut self, joined: Result<(u64, Result<Link, TransportError>), JoinError>) {
        let (generation, result) = match joined {
            Ok(output) => output,
            Err(e) => {
                warn!("connect task failed: {}", e);
                (self.generation, Err(TransportError::Connect(e.to_string())))
            }
        };
        if generation != self.generation || self.state == ConnectionState::Closed {
            debug!(generation, "dropping stale connect result");
            return;
        }

        match result {
            Ok(link) => self.on_connected(link),
            Err(TransportError::Rejected(reason)) => self.on_rejected(reason),
            Err(e) => {
                warn!("connect attempt failed: {}", e);
                self.emit(TransportEvent::Error(e));
                self.schedule_reconnect();
            }
        }
    }

    fn on_connected(&mut self, link: Link) {
        let kind = link.kind();
        let now = Instant::now();
        info!(%kind, conversation_id = %self.config.conversation_id, "transport connected");

        self.link = Some(link);
        self.accepted = false;
        self.heartbeat.start(now);
        self.outbound_tick = match kind {
            TransportKind::FullDuplex => {
                let period = self.heartbeat.interval();
                let mut tick = interval_at(now + period, period);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Some(tick)
            }
            TransportKind::HalfDuplex => None,
        };
        self.set_state(ConnectionState::Connected);
        self.emit(TransportEvent::Connected { kind });

        let auth = Envelope::authenticate(
            self.config.session_id.clone(),
            self.config.token.clone(),
            self.config.conversation_id.clone(),
        );
        if let Err(e) = self.write(auth) {
            warn!("failed to send authenticate: {}", e);
            self.emit(TransportEvent::Error(e));
            self.schedule_reconnect();
        }
    }

    fn drop_link(&mut self) {
        self.link = None;
        self.accepted = false;
        self.heartbeat.stop();
        self.outbound_tick = None;
    }

    /// The server will not take these credentials; stop until `connect`.
    fn on_rejected(&mut self, reason: String) {
        warn!(conversation_id = %self.config.conversation_id, %reason, "session rejected, not reconnecting");
        self.retry_at = None;
        self.drop_link();
        self.emit(TransportEvent::Error(TransportError::Rejected(reason)));
        if self.state != ConnectionState::Closed {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn schedule_reconnect(&mut self) {
        self.drop_link();
        if self.state == ConnectionState::Closed {
            return;
        }
        match self.reconnect.next_delay() {
            Some(delay) => {
                let attempt = self.reconnect.attempt();
                info!(attempt, ?delay, "reconnecting");
                self.set_state(ConnectionState::Reconnecting);
                self.emit(TransportEvent::Reconnecting { attempt, delay });
                self.retry_at = Some(Instant::now() + delay);
            }
            None => {
                let attempts = self.reconnect.attempt();
                warn!(attempts, "giving up on reconnect");
                self.retry_at = None;
                self.emit(TransportEvent::ConnectionExhausted { attempts });
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    fn on_link_event(&mut self, event: Option<LinkEvent>) {
        match event {
            Some(LinkEvent::Frame(envelope)) => self.dispatch(envelope),
            Some(LinkEvent::Closed(reason)) => {
                info!(reason = reason.as_deref().unwrap_or(""), "link closed by peer");
                self.schedule_reconnect();
            }
            Some(LinkEvent::Rejected(reason)) => self.on_rejected(reason),
            Some(LinkEvent::Failed(e)) => {
                warn!("link failed: {}", e);
                self.emit(TransportEvent::Error(TransportError::Connect(e)));
                self.schedule_reconnect();
            }
            None => {
                info!("link ended");
                self.schedule_reconnect();
            }
        }
    }

    fn dispatch(&mut self, envelope: Envelope) {
        if !self.accepted && !matches!(envelope, Envelope::Error(_)) {
            debug!("server accepted the session");
            self.accepted = true;
            self.reconnect.reset();
        }
        match envelope {
            Envelope::Heartbeat(_) => self.heartbeat.beat(Instant::now()),
            Envelope::Message(msg) => self.emit(TransportEvent::Message(msg)),
            Envelope::Status(update) => self.emit(TransportEvent::ConversationStatus(update)),
            Envelope::DeliveryConfirmation(dc) => match self.delivery.confirm(&dc.message_id) {
                Some(_) => self.emit(TransportEvent::Delivery {
                    message_id: dc.message_id,
                    status: DeliveryStatus::Delivered,
                }),
                None => debug!(message_id = %dc.message_id, "ignoring confirmation for unknown message"),
            },
            Envelope::Error(notice) if notice.code == ERROR_UNAUTHORIZED => self.on_rejected(notice.message),
            Envelope::Error(notice) => {
                warn!(code = %notice.code, "server error: {}", notice.message);
                self.emit(TransportEvent::Error(TransportError::Server { code: notice.code, message: notice.message }));
            }
            Envelope::Authenticate(_) => {}
        }
    }

    fn on_heartbeat_timeout(&mut self) {
        warn!(timeout = ?self.config.heartbeat_timeout, "no heartbeat from server, treating link as dead");
        self.schedule_reconnect();
    }

    fn send_heartbeat(&mut self) {
        if let Err(e) = self.write(Envelope::heartbeat()) {
            debug!("heartbeat not sent: {}", e);
        }
    }

    fn write(&self, envelope: Envelope) -> Result<(), TransportError> {
        match (&self.link, self.state) {
            (Some(link), ConnectionState::Connected) => link.send(envelope),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn send(&mut self, envelope: Envelope) {
        let message_id = match &envelope {
            Envelope::Message(msg) => Some(msg.id.clone()),
            _ => None,
        };
        match self.write(envelope) {
            Ok(()) => {
                if let Some(id) = message_id {
                    if self.delivery.track(&id, Instant::now()) {
                        self.emit(TransportEvent::Delivery { message_id: id, status: DeliveryStatus::Pending });
                    }
                }
            }
            Err(e) => {
                debug!("send rejected: {}", e);
                if let Some(id) = message_id {
                    self.emit(TransportEvent::Delivery { message_id: id, status: DeliveryStatus::Failed(e.clone()) });
                }
                self.emit(TransportEvent::Error(e));
            }
        }
    }

    fn expire_deliveries(&mut self) {
        let timeout = self.delivery.timeout();
        for pending in self.delivery.expire(Instant::now()) {
            warn!(message_id = %pending.message_id, "delivery not confirmed in time");
            self.emit(TransportEvent::Delivery {
                status: DeliveryStatus::Failed(TransportError::DeliveryTimeout {
                    message_id: pending.message_id.clone(),
                    timeout,
                }),
                message_id: pending.message_id,
            });
        }
    }

    /// Explicit disconnect: abandons any attempt, fails pending deliveries,
    /// and moves to `Closed`.
    fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.abandon_attempt();
        self.retry_at = None;
        self.drop_link();
        for pending in self.delivery.fail_all() {
            self.emit(TransportEvent::Delivery {
                message_id: pending.message_id,
                status: DeliveryStatus::Failed(TransportError::Closed),
            });
        }
        info!(conversation_id = %self.config.conversation_id, "transport closed");
        self.set_state(ConnectionState::Closed);
    }
}

async fn open_first(connectors: &[Arc<dyn Connector>], config: &TransportConfig) -> Result<Link, TransportError> {
    let mut last = TransportError::Unsupported;
    for connector in connectors {
        if !connector.is_supported(config) {
            debug!(kind = %connector.kind(), "connector not supported, skipping");
            continue;
        }
        match connector.open(config).await {
            Ok(link) => return Ok(link),
            Err(e) => {
                warn!(kind = %connector.kind(), "connect failed: {}", e);
                last = e;
            }
        }
    }
    Err(last)
}

async fn join_attempt(attempt: &mut Option<Attempt>) -> Result<(u64, Result<Link, TransportError>), JoinError> {
    match attempt {
        Some(task) => task.await,
        None => pending().await,
    }
}

async fn recv_link(link: &mut Option<Link>) -> Option<LinkEvent> {
    match link {
        Some(link) => link.recv().await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn tick_opt(tick: &mut Option<Interval>) {
    match tick {
        Some(tick) => {
            tick.tick().await;
        }
        None => pending().await,
    }
}
