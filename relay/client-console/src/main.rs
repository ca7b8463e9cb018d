mod input;
mod terminal;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use input::{parse_input, Input};
use realtime::{spawn_presentation, RealtimeTransport, TransportConfig};
use serde::Deserialize;
use terminal::TerminalPresenter;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[clap(name = "support-console")]
#[clap(about = "Terminal customer client for the support relay", long_about = None)]
struct Args {
    #[clap(default_value = "http://localhost:3001")]
    server_url: String,

    /// Join an existing conversation instead of creating one.
    #[clap(long, requires = "token")]
    conversation: Option<String>,

    #[clap(long)]
    token: Option<String>,

    /// Use only the event-stream link.
    #[clap(long)]
    half_duplex: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Registration {
    conversation_id: String,
    session_id: String,
    token: String,
    ws: String,
    http: String,
}

async fn register(server_url: &str) -> Result<Registration> {
    let response = reqwest::Client::new()
        .post(format!("{}/api/conversations", server_url))
        .send()
        .await
        .context("registering conversation")?;
    if !response.status().is_success() {
        bail!("server refused registration: {}", response.status());
    }
    Ok(response.json().await?)
}

fn ws_url_for(server_url: &str) -> String {
    let base = server_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!("{}/ws", base)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let server_url = args.server_url.trim_end_matches('/').to_string();

    let registration = match (args.conversation, args.token) {
        (Some(conversation_id), Some(token)) => Registration {
            session_id: conversation_id.clone(),
            conversation_id,
            token,
            ws: ws_url_for(&server_url),
            http: server_url.clone(),
        },
        _ => {
            info!("Registering conversation with server: {}", server_url);
            register(&server_url).await?
        }
    };

    println!("\n=== Conversation {} ===", registration.conversation_id);
    println!("Token: {}", registration.token);
    println!("Commands: /sentiment <score> <text>, /state, /reconnect, /quit\n");

    let base = TransportConfig::default().with_env_overrides()?;
    let config = TransportConfig {
        ws_url: if args.half_duplex { None } else { Some(registration.ws) },
        http_url: Some(registration.http),
        session_id: registration.session_id,
        token: registration.token,
        conversation_id: registration.conversation_id,
        ..base
    };

    let transport = RealtimeTransport::new(config)?;
    let presenter = spawn_presentation(transport.subscribe(), Arc::new(TerminalPresenter));
    transport.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_input(&line) {
                    Input::Empty => {}
                    Input::Quit => break,
                    Input::Reconnect => transport.connect(),
                    Input::State => println!("[System] {}", transport.state()),
                    Input::Message { text, sentiment } => {
                        let id = transport.send_text(text, sentiment);
                        debug!(message_id = %id, "message queued");
                    }
                    Input::Invalid(reason) => eprintln!("[Error] {}", reason),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    transport.dispose().await;
    let _ = presenter.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_follows_scheme() {
        assert_eq!(ws_url_for("http://localhost:3001"), "ws://localhost:3001/ws");
        assert_eq!(ws_url_for("https://support.example.com"), "wss://support.example.com/ws");
    }

    #[test]
    fn args_require_token_with_conversation() {
        assert!(Args::try_parse_from(["support-console", "--conversation", "c1"]).is_err());
        let args = Args::try_parse_from(["support-console", "--conversation", "c1", "--token", "t", "--half-duplex"])
            .unwrap();
        assert!(args.half_duplex);
        assert_eq!(args.server_url, "http://localhost:3001");
    }
}
