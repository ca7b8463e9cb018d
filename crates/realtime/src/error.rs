use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid transport config: {0}")]
    Config(String),

    #[error("no supported transport available")]
    Unsupported,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("transport closed")]
    Closed,

    #[error("no confirmation for message {message_id} within {timeout:?}")]
    DeliveryTimeout { message_id: String, timeout: Duration },

    /// Error notice sent by the server.
    #[error("server error {code}: {message}")]
    Server { code: String, message: String },

    /// The server refused the session's credentials. Not retried.
    #[error("session rejected: {0}")]
    Rejected(String),
}

/// Terminal failure of a streaming reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("no data for {0:?}")]
    Timeout(Duration),

    #[error("stream error: {0}")]
    Server(String),

    #[error("http error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for StreamError {
    fn from(e: reqwest::Error) -> Self {
        StreamError::Http(e.to_string())
    }
}
