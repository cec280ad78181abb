//! Interactive console sharing the webhook pipeline's engine.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::chatbot::engine::ChatbotEngine;
use crate::chatbot::message::{IncomingEvent, Text};

/// Session key of the console user.
pub const CONSOLE_USER: &str = "console";

/// Event for one console line. The sender nick is the console user's
/// current display name.
pub fn console_event(engine: &ChatbotEngine, line: &str) -> IncomingEvent {
    IncomingEvent {
        chatbot_user_id: CONSOLE_USER.to_string(),
        sender_staff_id: CONSOLE_USER.to_string(),
        sender_nick: engine.sessions().display_name(CONSOLE_USER),
        conversation_type: "1".to_string(),
        text: Text { content: line.to_string() },
        ..Default::default()
    }
}

/// Reads stdin line by line until EOF.
pub async fn run(engine: Arc<ChatbotEngine>) {
    info!("⌨️ Console ready, type a message and press enter");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let event = console_event(&engine, &line);
                if let Err(e) = engine.handle_console(event).await {
                    warn!("Console message not answered: {}", e);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read console input: {}", e);
                break;
            }
        }
    }
    info!("⌨️ Console closed");
}
