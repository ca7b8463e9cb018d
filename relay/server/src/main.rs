use std::{env, net::SocketAddr};

use anyhow::Result;
use dotenvy::dotenv;
use support_relay::{router, AppState, ServerConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "support_relay=info,support_core=info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    let port = config.port;
    let public_ws_url = config.public_ws_url.clone();
    let heartbeat = config.heartbeat_interval;

    let state = AppState::from_config(config).await?;
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server listening on {}", addr);
    info!("Public WebSocket URL: {}", public_ws_url);
    info!("Heartbeat interval: {:?}", heartbeat);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
