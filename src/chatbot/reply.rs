//! Outbound replies: DingTalk session webhook, or stdout for the console.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::chatbot::message::{IncomingEvent, MsgType, ReplyPayload};

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("DingTalk rejected the reply: {0}")]
    Api(String),
    #[error("session webhook is not a DingTalk endpoint: {0}")]
    UntrustedWebhook(String),
}

/// Hosts DingTalk hands out session webhooks on.
const DINGTALK_WEBHOOK_PREFIXES: &[&str] = &["https://oapi.dingtalk.com/", "https://api.dingtalk.com/"];

#[async_trait]
pub trait ReplyChannel: Send + Sync {
    async fn send(&self, event: &IncomingEvent, reply: ReplyPayload) -> Result<(), ReplyError>;
}

#[derive(Serialize)]
struct At {
    #[serde(rename = "atUserIds")]
    at_user_ids: Vec<String>,
    #[serde(rename = "isAtAll")]
    is_at_all: bool,
}

#[derive(Serialize)]
struct TextBody<'a> {
    content: &'a str,
}

#[derive(Serialize)]
struct MarkdownBody<'a> {
    title: &'a str,
    text: &'a str,
}

#[derive(Serialize)]
struct OutgoingMessage<'a> {
    msgtype: MsgType,
    at: At,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<TextBody<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    markdown: Option<MarkdownBody<'a>>,
}

/// Body with the at-mention spelled out when DingTalk cannot address the
/// sender by staff id.
pub fn addressed_body(event: &IncomingEvent, body: &str) -> String {
    if event.sender_is_ambiguous() && !event.sender_nick.is_empty() {
        format!("{}\n\n@{}", body, event.sender_nick)
    } else {
        body.to_string()
    }
}

/// First line of the body, capped, for the markdown card title.
fn card_title(body: &str) -> String {
    let line = body.lines().find(|l| !l.trim().is_empty()).unwrap_or("🤖");
    line.trim_start_matches(['#', '*', ' '])
        .trim_end_matches(['*', ' '])
        .chars()
        .take(20)
        .collect()
}

pub struct DingTalkReplier {
    http: reqwest::Client,
    webhook_prefixes: Vec<String>,
}

impl DingTalkReplier {
    pub fn new(timeout: Duration) -> Result<Self, ReplyError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReplyError::Http(e.to_string()))?;
        Ok(Self {
            http,
            webhook_prefixes: DINGTALK_WEBHOOK_PREFIXES.iter().map(|p| p.to_string()).collect(),
        })
    }

    /// Replace the accepted webhook URL prefixes.
    pub fn with_webhook_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.webhook_prefixes = prefixes;
        self
    }

    fn is_trusted_webhook(&self, url: &str) -> bool {
        self.webhook_prefixes.iter().any(|prefix| url.starts_with(prefix.as_str()))
    }
}

#[async_trait]
impl ReplyChannel for DingTalkReplier {
    async fn send(&self, event: &IncomingEvent, reply: ReplyPayload) -> Result<(), ReplyError> {
        let body = addressed_body(event, &reply.body);

        if event.session_webhook.is_empty() {
            println!("\n响应内容:\n{}\n", body);
            return Ok(());
        }
        if !self.is_trusted_webhook(&event.session_webhook) {
            warn!("Dropping reply to {}: untrusted webhook {:?}", event.sender_nick, event.session_webhook);
            return Err(ReplyError::UntrustedWebhook(event.session_webhook.clone()));
        }

        let at = At {
            at_user_ids: if event.sender_staff_id.is_empty() {
                Vec::new()
            } else {
                vec![event.sender_staff_id.clone()]
            },
            is_at_all: false,
        };
        let title = card_title(&body);
        let message = match reply.msg_type {
            MsgType::Text => OutgoingMessage {
                msgtype: MsgType::Text,
                at,
                text: Some(TextBody { content: &body }),
                markdown: None,
            },
            MsgType::Markdown => OutgoingMessage {
                msgtype: MsgType::Markdown,
                at,
                text: None,
                markdown: Some(MarkdownBody { title: &title, text: &body }),
            },
        };

        let response = self
            .http
            .post(&event.session_webhook)
            .json(&message)
            .send()
            .await
            .map_err(|e| ReplyError::Http(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            warn!("Reply to {} failed: {} {}", event.sender_nick, status, text);
            return Err(ReplyError::Api(format!("{status}: {text}")));
        }
        // DingTalk reports logical failures in a 200 body.
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            if let Some(code) = value.get("errcode").and_then(|c| c.as_i64()) {
                if code != 0 {
                    let msg = value.get("errmsg").and_then(|m| m.as_str()).unwrap_or_default();
                    return Err(ReplyError::Api(format!("errcode {code}: {msg}")));
                }
            }
        }
        debug!("Reply delivered to {}", event.sender_nick);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mention_appended_without_staff_id() {
        let event = IncomingEvent { sender_nick: "Bob".into(), ..Default::default() };
        assert_eq!(addressed_body(&event, "hi"), "hi\n\n@Bob");
    }

    #[test]
    fn test_no_mention_with_staff_id() {
        let event = IncomingEvent {
            sender_nick: "Bob".into(),
            sender_staff_id: "s1".into(),
            ..Default::default()
        };
        assert_eq!(addressed_body(&event, "hi"), "hi");
    }

    #[test]
    fn test_card_title() {
        assert_eq!(card_title("**🤷 抱歉**\nmore"), "🤷 抱歉");
        assert_eq!(card_title("\n\n## 标题"), "标题");
        assert_eq!(card_title(""), "🤖");
    }

    fn replier(timeout: Duration) -> DingTalkReplier {
        DingTalkReplier::new(timeout).unwrap()
    }

    #[test]
    fn test_only_dingtalk_webhooks_are_trusted() {
        let replier = replier(Duration::from_secs(5));
        assert!(replier.is_trusted_webhook("https://oapi.dingtalk.com/robot/sendBySession?session=x"));
        assert!(replier.is_trusted_webhook("https://api.dingtalk.com/v1.0/robot/oToMessages"));
        assert!(!replier.is_trusted_webhook("http://oapi.dingtalk.com/robot/send"));
        assert!(!replier.is_trusted_webhook("https://oapi.dingtalk.com.evil.net/robot"));
        assert!(!replier.is_trusted_webhook("http://169.254.169.254/latest/meta-data"));
        assert!(!replier.is_trusted_webhook("http://127.0.0.1:6379/"));
    }

    #[tokio::test]
    async fn test_untrusted_webhook_is_dropped() {
        let event = IncomingEvent {
            sender_nick: "n".into(),
            session_webhook: "http://127.0.0.1:6379/".into(),
            ..Default::default()
        };
        let result = replier(Duration::from_secs(5)).send(&event, ReplyPayload::text("hi")).await;
        assert!(matches!(result, Err(ReplyError::UntrustedWebhook(_))));
    }

    #[tokio::test]
    async fn test_slow_webhook_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and never answer.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let base = format!("http://{addr}/");
        let replier = replier(Duration::from_millis(200)).with_webhook_prefixes(vec![base.clone()]);
        let event = IncomingEvent {
            sender_staff_id: "s1".into(),
            session_webhook: format!("{base}robot/send"),
            ..Default::default()
        };

        let started = std::time::Instant::now();
        let result = replier.send(&event, ReplyPayload::text("hi")).await;
        assert!(matches!(result, Err(ReplyError::Http(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_markdown_message_shape() {
        let message = OutgoingMessage {
            msgtype: MsgType::Markdown,
            at: At { at_user_ids: vec!["s1".into()], is_at_all: false },
            text: None,
            markdown: Some(MarkdownBody { title: "t", text: "body" }),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["msgtype"], "markdown");
        assert_eq!(json["at"]["atUserIds"][0], "s1");
        assert_eq!(json["markdown"]["text"], "body");
        assert!(json.get("text").is_none());
    }
}
