//! Conversation bridge: session context in, backend call, session context out.
//!
//! The read-modify-write of a user's session spans the backend call and is
//! not serialized per user. Two concurrent messages from the same user can
//! both read the same context and the later write wins; the lost exchange
//! is still in the transcript.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::chatbot::backend::{BackendError, Completion, CompletionBackend, CompletionRequest};
use crate::chatbot::message::ReplyPayload;
use crate::chatbot::persona::{ChatMode, find_persona, match_persona};
use crate::chatbot::session::SessionStore;
use crate::chatbot::transcript::{ChatType, TranscriptStore};
use crate::config::ChatSettings;

pub const UPSTREAM_FAILURE_MESSAGE: &str = "**🤷 抱歉，请求 AI 服务失败了，请稍后重试。**";
const CLEARED_MESSAGE: &str = "=====已重置对话上下文，开始新的对话=====";
const SINGLE_MODE_MESSAGE: &str = "=====现在进入单聊模式，每条消息都是一次新的对话=====";
const THREAD_MODE_MESSAGE: &str = "=====现在进入串聊模式，对话会携带上下文=====";

/// One default-chat message after routing.
#[derive(Debug, Clone, Copy)]
pub struct Turn<'a> {
    /// Session key.
    pub user_id: &'a str,
    /// Name the transcript is stored under.
    pub username: &'a str,
    /// Thread kind for the answer id, the chat title.
    pub chat_type: &'a str,
    pub text: &'a str,
}

pub struct ConversationBridge {
    sessions: SessionStore,
    transcripts: Arc<TranscriptStore>,
    backend: Arc<dyn CompletionBackend>,
    settings: ChatSettings,
}

impl ConversationBridge {
    pub fn new(
        sessions: SessionStore,
        transcripts: Arc<TranscriptStore>,
        backend: Arc<dyn CompletionBackend>,
        settings: ChatSettings,
    ) -> Self {
        Self { sessions, transcripts, backend, settings }
    }

    /// Reply for one message. `Err` means the backend failed; the session
    /// is untouched and the caller owes the user [`UPSTREAM_FAILURE_MESSAGE`].
    pub async fn respond(&self, turn: Turn<'_>) -> Result<ReplyPayload, BackendError> {
        let user_id = turn.user_id;

        if turn.text.contains(self.settings.clear_token.as_str()) {
            self.sessions.clear_context(user_id);
            self.sessions.clear_answer_id(user_id, turn.chat_type);
            info!("🧹 {} reset their conversation", turn.username);
            return Ok(ReplyPayload::text(CLEARED_MESSAGE));
        }

        if let Some(mode) = ChatMode::from_command(turn.text) {
            self.sessions.set_mode(user_id, &mode.as_stored());
            self.sessions.clear_context(user_id);
            self.sessions.clear_answer_id(user_id, turn.chat_type);
            let message = match mode {
                ChatMode::Single => SINGLE_MODE_MESSAGE,
                _ => THREAD_MODE_MESSAGE,
            };
            return Ok(ReplyPayload::text(message));
        }

        let prompt = match match_persona(&self.settings.personas, turn.text) {
            Some(matched) => {
                let mode = ChatMode::Persona(matched.persona.title.clone());
                // Switching persona starts a fresh thread.
                if self.sessions.mode(user_id) != mode.as_stored() {
                    self.sessions.set_mode(user_id, &mode.as_stored());
                    self.sessions.clear_context(user_id);
                    self.sessions.clear_answer_id(user_id, turn.chat_type);
                }
                if matched.rest.is_empty() {
                    return Ok(ReplyPayload::text(matched.persona.prefix.clone()));
                }
                matched.rest
            }
            None => turn.text.to_string(),
        };
        let prompt = prompt.as_str();

        let mode = ChatMode::resolve(&self.sessions.mode(user_id), &self.settings.default_mode);
        let system = match &mode {
            ChatMode::Persona(title) => find_persona(&self.settings.personas, title).map(|p| p.prefix.clone()),
            _ => None,
        };

        let count = self.sessions.request_count(user_id);
        if self.settings.max_requests > 0 && count >= self.settings.max_requests {
            info!("🙅 {} reached the request limit ({})", turn.username, count);
            return Ok(ReplyPayload::markdown(format!(
                "**🤷 抱歉，您的提问次数已达上限（{}次），请稍后再试。**",
                self.settings.max_requests
            )));
        }

        let (context, thread_id) = if mode.keeps_context() {
            (self.sessions.context(user_id), self.sessions.answer_id(user_id, turn.chat_type))
        } else {
            (String::new(), 0)
        };

        let request = CompletionRequest {
            system,
            context: context.clone(),
            prompt: prompt.to_string(),
            thread_id,
        };
        let completion = self.call_backend(request).await?;

        if mode.keeps_context() {
            let updated = format!("{context}\nQ: {prompt}\nA: {}", completion.text);
            self.sessions
                .set_context(user_id, &bound_context(updated.trim_start(), self.settings.max_context_chars));
        }
        self.sessions.set_request_count(user_id, count.saturating_add(1));

        // The answer is delivered even when the transcript write fails.
        if let Err(e) = self.transcripts.append(turn.username, ChatType::Question, prompt) {
            error!("Failed to record question from {}: {}", turn.username, e);
        }
        let answer_row = match self.transcripts.append(turn.username, ChatType::Answer, &completion.text) {
            Ok(id) => Some(id as u64),
            Err(e) => {
                error!("Failed to record answer for {}: {}", turn.username, e);
                None
            }
        };
        if let Some(id) = completion.thread_id.or(answer_row) {
            self.sessions.set_answer_id(user_id, turn.chat_type, id);
        }

        Ok(ReplyPayload::markdown(completion.text))
    }

    async fn call_backend(&self, request: CompletionRequest) -> Result<Completion, BackendError> {
        let limit = self.settings.backend_timeout;
        match tokio::time::timeout(limit, self.backend.complete(request)).await {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(e)) => {
                warn!("Backend call failed: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!("Backend call timed out after {:?}", limit);
                Err(BackendError::Timeout(limit.as_secs()))
            }
        }
    }
}

/// Keep the newest `max_chars` characters. Zero means unbounded.
pub fn bound_context(context: &str, max_chars: usize) -> String {
    let count = context.chars().count();
    if max_chars == 0 || count <= max_chars {
        return context.to_string();
    }
    context.chars().skip(count - max_chars).collect()
}
