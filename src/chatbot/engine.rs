//! Chatbot engine: webhook and console entry points and per-intent handlers.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::chatbot::backend::{BackendError, CompletionBackend};
use crate::chatbot::bridge::{ConversationBridge, Turn, UPSTREAM_FAILURE_MESSAGE};
use crate::chatbot::lookup::{DomainLookup, LookupError};
use crate::chatbot::message::{IncomingEvent, ReplyPayload};
use crate::chatbot::reply::ReplyChannel;
use crate::chatbot::router::{self, Entry, Intent};
use crate::chatbot::session::{DEFAULT_DISPLAY_NAME, SessionStore};
use crate::chatbot::transcript::{ChatFilter, TranscriptStore};
use crate::config::{AccessPolicy, ChatSettings, Config};
use crate::error::{PipelineError, Result};
use crate::gate::{Admission, AuthScope, RejectReason, RequestGate, SignatureHeaders};

pub const USER_NOT_FOUND_MESSAGE: &str = "用户名错误，这个用户不存在，请核实之后再进行查询";
const ADMIN_ONLY_MESSAGE: &str = "**🤷 抱歉，只有管理员才能清除对话记录。**";
const LOOKUP_FAILURE_MESSAGE: &str = "**🤷 抱歉，查询失败了，请稍后重试。**";
const IMAGE_SAVE_FAILURE_MESSAGE: &str = "**🤷 抱歉，图片保存失败了，请稍后重试。**";
const TRANSCRIPT_FAILURE_MESSAGE: &str = "**🤷 抱歉，对话记录暂时无法访问，请稍后重试。**";
const MARKDOWN_PREVIEW_HINT: &str = "[Markdown Preview Plus](https://chrome.google.com/webstore/detail/markdown-preview-plus/febilkbfcbhebfnokafefeacimjdckgl)";

/// Settings the engine reads per request.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub help: String,
    /// Base URL without trailing slash.
    pub service_url: String,
    pub images_dir: PathBuf,
    pub app_secret: String,
    pub policy: AccessPolicy,
    pub chat: ChatSettings,
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            help: config.help.clone(),
            service_url: config.service_url.clone(),
            images_dir: config.images_dir(),
            app_secret: config.app_secret.clone(),
            policy: config.policy.clone(),
            chat: config.chat.clone(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            help: "帮助".to_string(),
            service_url: "http://localhost:8090".to_string(),
            images_dir: PathBuf::from("./data/images"),
            app_secret: String::new(),
            policy: AccessPolicy::default(),
            chat: ChatSettings::default(),
        }
    }
}

/// Shared collaborators, built once at startup.
pub struct EngineParts {
    pub sessions: SessionStore,
    pub transcripts: Arc<TranscriptStore>,
    pub backend: Arc<dyn CompletionBackend>,
    pub replier: Arc<dyn ReplyChannel>,
    pub lookup: Arc<dyn DomainLookup>,
}

pub struct ChatbotEngine {
    config: EngineConfig,
    gate: RequestGate,
    sessions: SessionStore,
    transcripts: Arc<TranscriptStore>,
    backend: Arc<dyn CompletionBackend>,
    replier: Arc<dyn ReplyChannel>,
    lookup: Arc<dyn DomainLookup>,
    bridge: ConversationBridge,
}

impl ChatbotEngine {
    pub fn new(config: EngineConfig, parts: EngineParts) -> Self {
        let gate = RequestGate::new(config.policy.clone(), config.app_secret.clone());
        let bridge = ConversationBridge::new(
            parts.sessions.clone(),
            parts.transcripts.clone(),
            parts.backend.clone(),
            config.chat.clone(),
        );
        Self {
            config,
            gate,
            sessions: parts.sessions,
            transcripts: parts.transcripts,
            backend: parts.backend,
            replier: parts.replier,
            lookup: parts.lookup,
            bridge,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn transcripts(&self) -> &Arc<TranscriptStore> {
        &self.transcripts
    }

    pub fn images_dir(&self) -> &PathBuf {
        &self.config.images_dir
    }

    /// Entry point for DingTalk callbacks.
    pub async fn handle_webhook(&self, mut event: IncomingEvent, headers: &SignatureHeaders) -> Result<()> {
        if let Admission::Reject(reason) = self.gate.admit(&event, headers) {
            if let Some(message) = reason.user_message() {
                // Best effort; the rejection is what gets reported.
                if let Err(e) = self.replier.send(&event, ReplyPayload::markdown(message)).await {
                    warn!("Failed to deliver rejection notice: {}", e);
                }
            }
            return Err(PipelineError::Rejected(reason));
        }

        event.normalize();
        self.dispatch(Entry::Webhook, &event).await
    }

    /// Entry point for the interactive console. No admission checks.
    pub async fn handle_console(&self, mut event: IncomingEvent) -> Result<()> {
        event.normalize();
        self.dispatch(Entry::Console, &event).await
    }

    async fn dispatch(&self, entry: Entry, event: &IncomingEvent) -> Result<()> {
        let intent = router::classify(entry, event.content(), event.kind());
        if intent != Intent::Help {
            info!("🙋 {} asked: {:?}", event.sender_nick, event.content());
        }

        match intent {
            Intent::Help => self.reply(event, ReplyPayload::markdown(self.config.help.clone())).await,
            Intent::HistoryQuery => self.handle_history(event).await,
            Intent::SetDisplayName => self.handle_set_display_name(event).await,
            Intent::ImageGeneration => self.handle_image(event).await,
            Intent::DomainLookup => self.handle_lookup(event, router::DOMAIN_PREFIX).await,
            Intent::CertificateLookup => self.handle_lookup(event, router::CERT_PREFIX).await,
            Intent::ClearHistory => self.handle_clear_history(event).await,
            Intent::GroupIdQuery => {
                let robot = if event.robot_code == "normal" { "outgoing robot" } else { "enterprise robot" };
                info!(
                    "🙋 {} in group 『{}』 has conversation id {:?}",
                    robot, event.conversation_title, event.conversation_id
                );
                Ok(())
            }
            Intent::DefaultChat => self.handle_chat(event).await,
        }
    }

    async fn reply(&self, event: &IncomingEvent, payload: ReplyPayload) -> Result<()> {
        self.replier.send(event, payload).await.map_err(|e| {
            warn!("Failed to send reply to {}: {}", event.sender_nick, e);
            PipelineError::from(e)
        })
    }

    /// Reply with a fixed explanation, then surface `err`.
    async fn reply_then_fail(&self, event: &IncomingEvent, payload: ReplyPayload, err: PipelineError) -> Result<()> {
        self.reply(event, payload).await?;
        Err(err)
    }

    /// `<prefix>:<arg>` with a non-empty argument, or a usage reply.
    async fn required_argument<'a>(&self, event: &'a IncomingEvent, prefix: &str) -> Result<&'a str> {
        match router::colon_argument(event.content(), prefix) {
            Some(arg) if !arg.is_empty() => Ok(arg),
            _ => {
                let usage = format!("命令格式错误，请使用 {prefix}:用户名");
                self.reply(event, ReplyPayload::text(usage.clone())).await?;
                Err(PipelineError::Validation(usage))
            }
        }
    }

    /// Whether `name` has records; a store failure is answered before it surfaces.
    async fn transcript_exists(&self, event: &IncomingEvent, name: &str) -> Result<bool> {
        match self.transcripts.exists(&ChatFilter::username(name)) {
            Ok(found) => Ok(found),
            Err(e) => {
                error!("Failed to read transcript of {}: {}", name, e);
                self.reply_then_fail(event, ReplyPayload::markdown(TRANSCRIPT_FAILURE_MESSAGE), e.into())
                    .await
                    .map(|()| false)
            }
        }
    }

    async fn handle_history(&self, event: &IncomingEvent) -> Result<()> {
        let name = self.required_argument(event, router::HISTORY_PREFIX).await?;

        if !self.transcript_exists(event, name).await? {
            return self
                .reply_then_fail(
                    event,
                    ReplyPayload::text(USER_NOT_FOUND_MESSAGE),
                    PipelineError::NotFound(name.to_string()),
                )
                .await;
        }

        let encoded = urlencoding::encode(name);
        let reply = format!(
            "- 在线查看: [点我]({base}/history/{encoded}.md)\n- 下载文件: [点我]({base}/download/{encoded}.md)\n- 在线预览请安装插件:{MARKDOWN_PREVIEW_HINT}",
            base = self.config.service_url,
        );
        self.reply(event, ReplyPayload::markdown(reply)).await
    }

    async fn handle_set_display_name(&self, event: &IncomingEvent) -> Result<()> {
        let Some(name) = router::colon_argument(event.content(), router::TITLE_PREFIX) else {
            let usage = format!("命令格式错误，请使用 {}:昵称", router::TITLE_PREFIX);
            return self
                .reply_then_fail(event, ReplyPayload::text(usage.clone()), PipelineError::Validation(usage))
                .await;
        };
        let name = if name.is_empty() { DEFAULT_DISPLAY_NAME } else { name };

        self.sessions.set_display_name(event.sender_identifier(), name);
        info!("🏷️ {} set display name to {}", event.sender_identifier(), name);
        self.reply(event, ReplyPayload::text(format!("用户名设置成功，对话昵称为：{name}")))
            .await
    }

    async fn handle_image(&self, event: &IncomingEvent) -> Result<()> {
        let prompt = router::loose_argument(event.content(), router::IMAGE_PREFIX);
        if prompt.is_empty() {
            let usage = format!("请在 {} 之后输入图片描述", router::IMAGE_PREFIX);
            return self
                .reply_then_fail(event, ReplyPayload::text(usage.clone()), PipelineError::Validation(usage))
                .await;
        }

        let limit = self.config.chat.backend_timeout;
        let generated = match tokio::time::timeout(limit, self.backend.generate_image(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(limit.as_secs())),
        };
        let bytes = match generated {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Image generation failed: {}", e);
                return self
                    .reply_then_fail(event, ReplyPayload::markdown(UPSTREAM_FAILURE_MESSAGE), e.into())
                    .await;
            }
        };

        let filename = format!("{}.png", uuid::Uuid::new_v4());
        if let Err(e) = self.save_image(&filename, &bytes).await {
            error!("Failed to save image {}: {}", filename, e);
            return self
                .reply_then_fail(event, ReplyPayload::markdown(IMAGE_SAVE_FAILURE_MESSAGE), e.into())
                .await;
        }
        info!("🎨 Saved image {} ({} bytes)", filename, bytes.len());

        let url = format!("{}/images/{}", self.config.service_url, filename);
        self.reply(event, ReplyPayload::markdown(format!("![{prompt}]({url})\n\n[🖼️ 点击查看原图]({url})")))
            .await
    }

    async fn save_image(&self, filename: &str, bytes: &[u8]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.config.images_dir).await?;
        tokio::fs::write(self.config.images_dir.join(filename), bytes).await
    }

    async fn handle_lookup(&self, event: &IncomingEvent, prefix: &str) -> Result<()> {
        let domain = router::loose_argument(event.content(), prefix);
        let result = if prefix == router::CERT_PREFIX {
            self.lookup.certificate_info(domain).await
        } else {
            self.lookup.domain_info(domain).await
        };

        match result {
            Ok(summary) => self.reply(event, ReplyPayload::markdown(summary)).await,
            Err(LookupError::InvalidDomain(d)) => {
                let message = format!("域名格式不正确：{d:?}，请输入形如 example.com 的域名");
                self.reply_then_fail(event, ReplyPayload::text(message), PipelineError::Validation(d))
                    .await
            }
            Err(e) => {
                warn!("Lookup for {:?} failed: {}", domain, e);
                self.reply_then_fail(event, ReplyPayload::markdown(LOOKUP_FAILURE_MESSAGE), e.into())
                    .await
            }
        }
    }

    async fn handle_clear_history(&self, event: &IncomingEvent) -> Result<()> {
        if !self.config.policy.is_admin(&event.sender_staff_id) {
            info!("🙅 {} tried to clear history without admin rights", event.sender_nick);
            return self
                .reply_then_fail(
                    event,
                    ReplyPayload::markdown(ADMIN_ONLY_MESSAGE),
                    PipelineError::Rejected(RejectReason::Unauthorized(AuthScope::User)),
                )
                .await;
        }

        let name = self.required_argument(event, router::CLEAR_HISTORY_PREFIX).await?;
        if !self.transcript_exists(event, name).await? {
            return self
                .reply_then_fail(
                    event,
                    ReplyPayload::text(USER_NOT_FOUND_MESSAGE),
                    PipelineError::NotFound(name.to_string()),
                )
                .await;
        }

        if let Err(e) = self.transcripts.delete_all(name) {
            error!("Failed to clear transcript of {}: {}", name, e);
            return self
                .reply_then_fail(event, ReplyPayload::markdown(TRANSCRIPT_FAILURE_MESSAGE), e.into())
                .await;
        }
        self.reply(event, ReplyPayload::markdown(format!("用户：{name}对话清理成功🔜🗑️！")))
            .await
    }

    async fn handle_chat(&self, event: &IncomingEvent) -> Result<()> {
        let chat_title = event.chat_title();
        let username = if event.sender_nick.is_empty() {
            event.sender_identifier()
        } else {
            event.sender_nick.as_str()
        };
        let turn = Turn {
            user_id: event.sender_identifier(),
            username,
            chat_type: &chat_title,
            text: event.content(),
        };

        match self.bridge.respond(turn).await {
            Ok(payload) => self.reply(event, payload).await,
            Err(e) => {
                error!("🤖 No answer for {}: {}", username, e);
                self.reply_then_fail(event, ReplyPayload::markdown(UPSTREAM_FAILURE_MESSAGE), e.into())
                    .await
            }
        }
    }
}
