use axum::{
    extract::{Extension, Json, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{Duration, Utc};
use protocol::{StatusTransitionRequest, StatusTransitionResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;
use support_core::StatusError;
use tracing::{error, info};
use uuid::Uuid;

use crate::AppState;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into() }
    }

    pub fn not_found(conversation_id: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", format!("conversation {} not found", conversation_id))
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid token")
    }

    pub fn internal(err: anyhow::Error) -> Self {
        error!("request failed: {:#}", err);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.code, "message": self.message }))).into_response()
    }
}

/// Check a client's bearer token against the conversation's.
pub async fn authorize(state: &AppState, conversation_id: &str, token: Option<&str>) -> Result<(), ApiError> {
    let expected = state
        .store
        .conversation_token(conversation_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(conversation_id))?;
    match token {
        Some(token) if token == expected => Ok(()),
        _ => Err(ApiError::unauthorized()),
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string().replace('-', "")
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedConversation {
    pub conversation_id: String,
    pub session_id: String,
    pub token: String,
    pub status: protocol::ConversationStatus,
    pub ws: String,
    pub http: String,
    pub events: String,
}

pub async fn create_conversation(Extension(state): Extension<AppState>) -> Result<Json<CreatedConversation>, ApiError> {
    let conversation_id = new_id();
    let token = new_id();
    let context = state
        .store
        .create_conversation(&conversation_id, &token)
        .await
        .map_err(ApiError::internal)?;
    info!(%conversation_id, "conversation created");

    let http = state.config.public_http_url.trim_end_matches('/').to_string();
    Ok(Json(CreatedConversation {
        events: format!("{}/api/conversations/{}/events", http, conversation_id),
        conversation_id,
        session_id: new_id(),
        token,
        status: context.status,
        ws: state.config.public_ws_url.clone(),
        http,
    }))
}

pub async fn conversation_status(
    Path(id): Path<String>,
    Extension(state): Extension<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .store
        .get_status(&id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(&id))?;
    Ok(Json(json!({
        "conversationId": id,
        "status": record.status,
        "assignee": record.assignee,
        "updatedAt": record.updated_at.timestamp_millis(),
    })))
}

fn status_code_for(err: &StatusError) -> StatusCode {
    match err {
        StatusError::NotFound(_) => StatusCode::NOT_FOUND,
        StatusError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        StatusError::Conflict { .. } => StatusCode::CONFLICT,
        StatusError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Agent-initiated transition. The path id wins over the body's.
pub async fn transition_status(
    Path(id): Path<String>,
    Extension(state): Extension<AppState>,
    Json(mut request): Json<StatusTransitionRequest>,
) -> (StatusCode, Json<StatusTransitionResponse>) {
    request.conversation_id = id;
    match state.core.transition(request).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome.to_response())),
        Err(err) => (status_code_for(&err), Json(err.to_response())),
    }
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub hours: Option<i64>,
}

pub async fn metrics(
    Query(query): Query<MetricsQuery>,
    Extension(state): Extension<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let hours = query.hours.unwrap_or(24).clamp(1, 24 * 90);
    let since = Utc::now() - Duration::hours(hours);
    let metrics = state.core.logger().metrics(since).await.map_err(ApiError::internal)?;
    Ok(Json(metrics))
}

#[derive(Debug, Deserialize)]
pub struct TrendsQuery {
    pub days: Option<u32>,
}

pub async fn trends(
    Query(query): Query<TrendsQuery>,
    Extension(state): Extension<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let days = query.days.unwrap_or(7).clamp(1, 90);
    let trends = state.core.logger().trends(days, Utc::now()).await.map_err(ApiError::internal)?;
    Ok(Json(trends))
}

pub async fn queue(Extension(state): Extension<AppState>) -> Result<impl IntoResponse, ApiError> {
    let entries = state.queue.snapshot().await.map_err(ApiError::internal)?;
    Ok(Json(entries))
}

pub async fn rules(Extension(state): Extension<AppState>) -> impl IntoResponse {
    Json(state.rules.all())
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}
