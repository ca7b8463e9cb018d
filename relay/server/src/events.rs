//! Half-duplex path: server-sent events down, one POST per envelope up.

use std::convert::Infallible;

use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use futures::stream::{self, Stream};
use protocol::Envelope;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Interval;
use tracing::{info, warn};

use crate::api::{authorize, ApiError};
use crate::hub::Subscription;
use crate::{dispatch, AppState};

type BearerHeader = Option<TypedHeader<Authorization<Bearer>>>;

fn bearer_token(header: &BearerHeader) -> Option<&str> {
    header.as_ref().map(|TypedHeader(auth)| auth.token())
}

/// Frames posted by half-duplex clients are tagged with their token.
fn origin_tag(token: &str) -> String {
    format!("http:{}", token)
}

struct Feed {
    frames: Subscription,
    ticker: Interval,
    tag: String,
}

fn sse_event(envelope: &Envelope) -> Result<Event, Infallible> {
    Ok(Event::default().data(envelope.encode()))
}

pub async fn event_stream(
    Path(id): Path<String>,
    Extension(state): Extension<AppState>,
    bearer: BearerHeader,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let token = bearer_token(&bearer);
    authorize(&state, &id, token).await?;
    let tag = origin_tag(token.unwrap_or_default());
    info!(conversation_id = %id, "event stream opened");

    // The first tick fires immediately, so clients see a heartbeat on open.
    let feed = Feed {
        frames: state.hub.subscribe(&id),
        ticker: tokio::time::interval(state.config.heartbeat_interval),
        tag,
    };
    let events = stream::unfold(feed, |mut feed| async move {
        loop {
            tokio::select! {
                _ = feed.ticker.tick() => {
                    return Some((sse_event(&Envelope::heartbeat()), feed));
                }
                frame = feed.frames.recv() => match frame {
                    Ok(frame) if frame.is_from(&feed.tag) => continue,
                    Ok(frame) => return Some((sse_event(&frame.envelope), feed)),
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "event stream fell behind"),
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    });
    Ok(Sse::new(events))
}

/// The reply (usually a delivery confirmation) is the response body.
pub async fn post_message(
    Path(id): Path<String>,
    Extension(state): Extension<AppState>,
    bearer: BearerHeader,
    Json(envelope): Json<Envelope>,
) -> Result<Response, ApiError> {
    let token = bearer_token(&bearer);
    authorize(&state, &id, token).await?;
    let tag = origin_tag(token.unwrap_or_default());

    let replies = dispatch(&state, &id, Some(&tag), envelope).await;
    Ok(match replies.into_iter().next() {
        Some(reply) => Json(reply).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}
