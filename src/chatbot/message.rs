//! Inbound DingTalk callback payload and outbound reply payload.

use serde::{Deserialize, Serialize};

/// Conversation kind as sent by DingTalk (`"1"` direct, `"2"` group).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn code(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "1",
            ConversationKind::Group => "2",
        }
    }
}

/// Message body format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    #[default]
    Text,
    Markdown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Text {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtUser {
    #[serde(rename = "dingtalkId", default)]
    pub dingtalk_id: String,
}

/// One inbound chat message. Lives for the duration of a single request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IncomingEvent {
    pub conversation_id: String,
    pub at_users: Vec<AtUser>,
    pub chatbot_user_id: String,
    pub msg_id: String,
    pub sender_nick: String,
    pub is_admin: bool,
    pub sender_staff_id: String,
    pub session_webhook_expired_time: i64,
    pub create_at: i64,
    pub conversation_type: String,
    pub sender_id: String,
    pub conversation_title: String,
    pub is_in_at_list: bool,
    pub session_webhook: String,
    pub text: Text,
    pub robot_code: String,
    pub msgtype: MsgType,
}

impl IncomingEvent {
    /// Anything other than `"2"` is treated as a direct conversation.
    pub fn kind(&self) -> ConversationKind {
        if self.conversation_type == "2" {
            ConversationKind::Group
        } else {
            ConversationKind::Direct
        }
    }

    /// Staff id, falling back to the nickname for outgoing robots.
    pub fn sender_identifier(&self) -> &str {
        if self.sender_staff_id.is_empty() {
            &self.sender_nick
        } else {
            &self.sender_staff_id
        }
    }

    /// Group name, or `<nick>_私聊` for direct conversations.
    pub fn chat_title(&self) -> String {
        if self.conversation_title.is_empty() {
            format!("{}_私聊", self.sender_nick)
        } else {
            self.conversation_title.clone()
        }
    }

    /// Whether an at-mention must be spelled out in the reply body.
    pub fn sender_is_ambiguous(&self) -> bool {
        self.sender_staff_id.is_empty()
    }

    pub fn content(&self) -> &str {
        &self.text.content
    }

    /// Trims surrounding whitespace in place.
    pub fn normalize(&mut self) {
        let trimmed = self.text.content.trim();
        if trimmed.len() != self.text.content.len() {
            self.text.content = trimmed.to_string();
        }
    }
}

/// A reply produced by the pipeline, before addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPayload {
    pub msg_type: MsgType,
    pub body: String,
}

impl ReplyPayload {
    pub fn text(body: impl Into<String>) -> Self {
        Self { msg_type: MsgType::Text, body: body.into() }
    }

    pub fn markdown(body: impl Into<String>) -> Self {
        Self { msg_type: MsgType::Markdown, body: body.into() }
    }
}
