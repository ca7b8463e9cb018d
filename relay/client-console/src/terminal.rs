use std::io::{self, Write};

use protocol::{ChatMessage, SenderRole, StatusUpdate};
use realtime::{ConnectionIndicator, DeliveryStatus, PresentationPort};

/// Prints transport events as plain lines on stdout.
#[derive(Debug, Default)]
pub struct TerminalPresenter;

impl TerminalPresenter {
    fn line(&self, text: String) {
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{}", text);
        let _ = out.flush();
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

pub fn format_message(message: &ChatMessage) -> String {
    let who = match message.sender {
        SenderRole::Customer => "Customer",
        SenderRole::Agent => "Agent",
        SenderRole::Ai => "Assistant",
        SenderRole::System => "System",
    };
    format!("[{}] {}", who, message.text)
}

pub fn format_indicator(indicator: ConnectionIndicator) -> String {
    match indicator {
        ConnectionIndicator::Connecting => "[System] Connecting...".to_string(),
        ConnectionIndicator::Online => "[System] Online".to_string(),
        ConnectionIndicator::Reconnecting { attempt } => format!("[System] Connection lost, reconnecting (attempt {})", attempt),
        ConnectionIndicator::Offline => "[System] Offline. Type /reconnect to try again".to_string(),
        ConnectionIndicator::Closed => "[System] Disconnected".to_string(),
    }
}

pub fn format_status(update: &StatusUpdate) -> String {
    let mut line = format!("[Status] {}", update.status);
    if let Some(assignee) = &update.assignee {
        line.push_str(&format!(" (assigned to {})", assignee));
    }
    if let Some(reason) = &update.reason {
        line.push_str(&format!(": {}", reason));
    }
    line
}

impl PresentationPort for TerminalPresenter {
    fn add_message(&self, message: &ChatMessage) {
        self.line(format_message(message));
    }

    fn update_connection_status(&self, indicator: ConnectionIndicator) {
        self.line(format_indicator(indicator));
    }

    fn update_conversation_status(&self, update: &StatusUpdate) {
        self.line(format_status(update));
    }

    fn update_delivery_status(&self, message_id: &str, status: &DeliveryStatus) {
        match status {
            DeliveryStatus::Pending => {}
            DeliveryStatus::Delivered => self.line(format!("  delivered {}", short_id(message_id))),
            DeliveryStatus::Failed(e) => self.line(format!("  NOT delivered {}: {}", short_id(message_id), e)),
        }
    }

    fn show_error(&self, message: &str) {
        let _ = writeln!(io::stderr(), "[Error] {}", message);
    }
}
