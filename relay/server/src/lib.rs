pub mod api;
pub mod config;
pub mod events;
pub mod hub;
pub mod notify;
pub mod store;
pub mod websocket;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::Extension,
    routing::{get, post},
    Router,
};
use protocol::Envelope;
use support_core::memory::{MemoryConversationStore, MemoryEscalationQueue, StaticRuleStore};
use support_core::ports::{ConversationStore, EscalationQueue, Notifier};
use support_core::{
    ConversationStatusMachine, EscalationLogger, JsonlEscalationLog, SupportCore, TriageRule, TriageRuleEngine,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

pub use config::ServerConfig;
pub use hub::ConversationHub;

use notify::{LogNotifier, WebhookNotifier};
use store::RedisConversationStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Arc<dyn ConversationStore>,
    pub core: Arc<SupportCore>,
    pub hub: Arc<ConversationHub>,
    pub queue: Arc<dyn EscalationQueue>,
    pub rules: Arc<StaticRuleStore>,
}

impl AppState {
    /// Wire the core around the given adapters.
    pub fn assemble(
        config: ServerConfig,
        store: Arc<dyn ConversationStore>,
        logger: EscalationLogger,
        notifier: Arc<dyn Notifier>,
        rules: Vec<TriageRule>,
    ) -> Self {
        let hub = Arc::new(ConversationHub::new());
        let queue: Arc<dyn EscalationQueue> = Arc::new(MemoryEscalationQueue::new());
        let rules = Arc::new(StaticRuleStore::new(rules));
        let machine = Arc::new(
            ConversationStatusMachine::new(store.clone(), hub.clone(), Arc::new(logger))
                .with_escalation_queue(queue.clone()),
        );
        let engine = Arc::new(TriageRuleEngine::new(
            rules.clone(),
            store.clone(),
            machine.clone(),
            queue.clone(),
            notifier,
        ));
        let core = Arc::new(SupportCore::new(store.clone(), machine, engine));
        Self { config: Arc::new(config), store, core, hub, queue, rules }
    }

    /// Everything in process memory; nothing survives a restart.
    pub fn in_memory(config: ServerConfig, rules: Vec<TriageRule>) -> Self {
        Self::assemble(
            config,
            Arc::new(MemoryConversationStore::new()),
            EscalationLogger::in_memory(),
            Arc::new(LogNotifier),
            rules,
        )
    }

    /// Pick adapters from the configuration.
    pub async fn from_config(config: ServerConfig) -> Result<Self> {
        let store: Arc<dyn ConversationStore> = match &config.redis_url {
            Some(url) => {
                info!("Using Redis conversation store");
                Arc::new(RedisConversationStore::connect(url, config.conversation_ttl).await?)
            }
            None => {
                warn!("REDIS_URL not set; conversations are kept in memory");
                Arc::new(MemoryConversationStore::new())
            }
        };
        let logger = match &config.escalation_log_path {
            Some(path) => EscalationLogger::new(JsonlEscalationLog::new(path.clone())),
            None => EscalationLogger::in_memory(),
        };
        let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
            None => Arc::new(LogNotifier),
        };
        let rules = config::load_rules(config.triage_rules_path.as_ref()).await?;
        info!(rules = rules.len(), "triage rules loaded");
        Ok(Self::assemble(config, store, logger, notifier, rules))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/conversations", post(api::create_conversation))
        .route("/api/conversations/:id", get(api::conversation_status))
        .route("/api/conversations/:id/status", post(api::transition_status))
        .route("/api/conversations/:id/events", get(events::event_stream))
        .route("/api/conversations/:id/messages", post(events::post_message))
        .route("/api/escalations/metrics", get(api::metrics))
        .route("/api/escalations/trends", get(api::trends))
        .route("/api/queue", get(api::queue))
        .route("/api/rules", get(api::rules))
        .route("/health", get(api::health))
        .route("/ws", get(websocket::handle_websocket))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(Extension(state))
}

/// Run one client envelope through the core. Chat messages are also fanned
/// out to the conversation's other clients, tagged with `origin`.
pub(crate) async fn dispatch(
    state: &AppState,
    conversation_id: &str,
    origin: Option<&str>,
    envelope: Envelope,
) -> Vec<Envelope> {
    let envelope = match envelope {
        Envelope::Message(mut msg) => {
            msg.conversation_id = Some(conversation_id.to_string());
            Envelope::Message(msg)
        }
        other => other,
    };
    let fan_out = match &envelope {
        Envelope::Message(msg) if !msg.text.trim().is_empty() => Some(envelope.clone()),
        _ => None,
    };

    match state.core.handle(conversation_id, envelope).await {
        Ok(replies) => {
            if let Some(message) = fan_out {
                state.hub.publish(conversation_id, origin, message);
            }
            replies
        }
        Err(e) => {
            warn!(conversation_id, "failed to handle client envelope: {:#}", e);
            vec![Envelope::error("message_failed", e.to_string())]
        }
    }
}
