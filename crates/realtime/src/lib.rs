pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod link;
pub mod mocks;
pub mod presentation;
pub mod reconnect;
pub mod streaming;
pub mod transport;

pub use config::{ReconnectConfig, TransportConfig};
pub use error::{StreamError, TransportError};
pub use events::{ConnectionState, DeliveryStatus, TransportEvent, TransportKind};
pub use presentation::{spawn_presentation, ConnectionIndicator, PresentationPort};
pub use streaming::{open_reply_stream, spawn_decoder, StreamEvent, StreamingDecoder, StreamingSession};
pub use transport::RealtimeTransport;
