use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config file '{}': {source}", .path.display())]
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    #[error("failed to parse config file '{}': {source}", .path.display())]
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    #[error("config validation error: {0}")]
    Validation(String),
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default = "default_port")]
    port: u16,
    /// Public base URL used to build history/download/image links.
    #[serde(default)]
    service_url: Option<String>,
    /// DingTalk app secret used to verify callback signatures.
    #[serde(default)]
    app_secret: String,
    /// "0" = any conversation, "1" = direct only, "2" = group only.
    #[serde(default = "default_chat_type")]
    chat_type: String,
    #[serde(default = "default_help")]
    help: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    /// Directory for the transcript database, images and logs.
    data_dir: Option<String>,
    /// Run the interactive console loop next to the HTTP server.
    #[serde(default)]
    console: bool,

    #[serde(default)]
    allow_groups: Vec<String>,
    #[serde(default)]
    allow_outgoing_groups: Vec<String>,
    #[serde(default)]
    allow_users: Vec<String>,
    #[serde(default)]
    deny_users: Vec<String>,
    #[serde(default)]
    admin_users: Vec<String>,
    #[serde(default)]
    sensitive_words: Vec<String>,

    #[serde(default)]
    session_ttl: SessionTtlFile,
    #[serde(default = "default_cleanup_minutes")]
    session_cleanup_minutes: u64,
    #[serde(default = "default_clear_token")]
    session_clear_token: String,
    #[serde(default = "default_mode")]
    default_mode: String,
    #[serde(default = "default_max_context_chars")]
    max_context_chars: usize,
    #[serde(default)]
    max_requests: u32,

    #[serde(default)]
    backend: BackendFile,
    #[serde(default)]
    prompts: Vec<Persona>,
}

#[derive(Deserialize)]
#[serde(default)]
struct SessionTtlFile {
    mode_minutes: u64,
    context_minutes: u64,
    answer_id_minutes: u64,
    request_count_minutes: u64,
    display_name_minutes: u64,
}

impl Default for SessionTtlFile {
    fn default() -> Self {
        Self {
            mode_minutes: 120,
            context_minutes: 120,
            answer_id_minutes: 24 * 60,
            request_count_minutes: 24 * 60,
            display_name_minutes: 10 * 24 * 60,
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct BackendFile {
    base_url: String,
    api_key: String,
    model: String,
    image_model: String,
    timeout_secs: u64,
    max_tokens: Option<u32>,
}

impl Default for BackendFile {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-3.5-turbo".to_string(),
            image_model: "dall-e-3".to_string(),
            timeout_secs: 60,
            max_tokens: None,
        }
    }
}

fn default_port() -> u16 {
    8090
}

fn default_chat_type() -> String {
    "0".to_string()
}

fn default_help() -> String {
    "### 发送信息\n\n若您想给机器人发送信息，有如下两种方式：\n\n1. **群聊：** 在机器人所在群里 **@机器人** 后边跟着要提问的内容。\n2. **私聊：** 点击机器人的 **头像** 后，再点击 **发消息。**\n\n### 系统指令\n\n系统指令是一些特殊的词语，当您向机器人发送这些词语时，会触发对应的功能：\n\n**单聊**：每次对话都是一次新的对话，没有聊天上下文。\n\n**串聊**：带上下文聊天，默认开启。\n\n**清空上下文**：清空当前会话的上下文。\n\n**#图片**：根据提示词生成图片。\n\n**#域名**：查询域名注册信息。\n\n**#证书**：查询域名证书信息。\n\n**#查对话:用户名**：获取指定用户的对话历史。".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cleanup_minutes() -> u64 {
    300
}

fn default_clear_token() -> String {
    "清空上下文".to_string()
}

fn default_mode() -> String {
    "串聊".to_string()
}

fn default_max_context_chars() -> usize {
    4000
}

/// A persona preset addressed by `#<title>`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Persona {
    pub title: String,
    /// Instruction sent to the backend while the persona is active. Also the
    /// text shown when the shorthand is sent on its own.
    pub prefix: String,
}

/// Allow/deny/admin membership sets. Read-only to the pipeline.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    pub allow_groups: HashSet<String>,
    pub allow_outgoing_groups: HashSet<String>,
    pub allow_users: HashSet<String>,
    pub deny_users: HashSet<String>,
    pub admin_users: HashSet<String>,
    pub sensitive_words: Vec<String>,
    /// `None` means every conversation kind is allowed.
    pub chat_type: Option<String>,
}

impl AccessPolicy {
    /// Empty allow-list admits every group.
    pub fn is_group_allowed(&self, conversation_id: &str) -> bool {
        self.allow_groups.is_empty() || self.allow_groups.contains(conversation_id)
    }

    /// Origin check for outgoing (no staff id) robots.
    pub fn is_outgoing_group_allowed(&self, conversation_id: &str) -> bool {
        self.allow_outgoing_groups.is_empty() || self.allow_outgoing_groups.contains(conversation_id)
    }

    /// Deny-list wins; an empty allow-list admits everyone else.
    pub fn is_user_allowed(&self, staff_id: &str) -> bool {
        if self.deny_users.contains(staff_id) {
            return false;
        }
        self.allow_users.is_empty() || self.allow_users.contains(staff_id)
    }

    pub fn is_admin(&self, staff_id: &str) -> bool {
        !staff_id.is_empty() && self.admin_users.contains(staff_id)
    }

    /// Returns the first sensitive word found in `text`.
    pub fn sensitive_match(&self, text: &str) -> Option<&str> {
        self.sensitive_words
            .iter()
            .map(String::as_str)
            .find(|word| !word.is_empty() && text.contains(word))
    }
}

/// Independent lifetimes of the session fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTtls {
    pub mode: Duration,
    pub context: Duration,
    pub answer_id: Duration,
    pub request_count: Duration,
    pub display_name: Duration,
}

impl Default for SessionTtls {
    fn default() -> Self {
        SessionTtlFile::default().into_ttls()
    }
}

/// Longest accepted session lifetime, one year.
const MAX_TTL_MINUTES: u64 = 365 * 24 * 60;

/// Minutes to seconds, refusing values past [`MAX_TTL_MINUTES`].
fn checked_minutes(key: &str, minutes: u64) -> Result<u64, ConfigError> {
    minutes
        .checked_mul(60)
        .filter(|_| minutes <= MAX_TTL_MINUTES)
        .ok_or_else(|| ConfigError::Validation(format!("{key} must be at most {MAX_TTL_MINUTES}, got {minutes}")))
}

impl SessionTtlFile {
    fn validate(&self) -> Result<(), ConfigError> {
        checked_minutes("mode_minutes", self.mode_minutes)?;
        checked_minutes("context_minutes", self.context_minutes)?;
        checked_minutes("answer_id_minutes", self.answer_id_minutes)?;
        checked_minutes("request_count_minutes", self.request_count_minutes)?;
        checked_minutes("display_name_minutes", self.display_name_minutes)?;
        Ok(())
    }

    fn into_ttls(self) -> SessionTtls {
        let minutes = |m: u64| Duration::from_secs(m * 60);
        SessionTtls {
            mode: minutes(self.mode_minutes),
            context: minutes(self.context_minutes),
            answer_id: minutes(self.answer_id_minutes),
            request_count: minutes(self.request_count_minutes),
            display_name: minutes(self.display_name_minutes),
        }
    }
}

/// Settings for the OpenAI-compatible completion backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub image_model: String,
    pub timeout: Duration,
    pub max_tokens: Option<u32>,
}

impl BackendFile {
    fn into_config(self) -> BackendConfig {
        BackendConfig {
            base_url: self.base_url.trim_end_matches('/').to_string(),
            api_key: self.api_key,
            model: self.model,
            image_model: self.image_model,
            timeout: Duration::from_secs(self.timeout_secs),
            max_tokens: self.max_tokens,
        }
    }
}

/// Knobs the conversation bridge reads on every request.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub clear_token: String,
    pub default_mode: String,
    pub max_context_chars: usize,
    pub max_requests: u32,
    pub backend_timeout: Duration,
    pub personas: Vec<Persona>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            clear_token: default_clear_token(),
            default_mode: default_mode(),
            max_context_chars: default_max_context_chars(),
            max_requests: 0,
            backend_timeout: Duration::from_secs(60),
            personas: Vec::new(),
        }
    }
}

pub struct Config {
    pub port: u16,
    /// Base URL without trailing slash.
    pub service_url: String,
    pub app_secret: String,
    pub help: String,
    pub log_level: String,
    pub data_dir: PathBuf,
    pub console: bool,
    pub policy: AccessPolicy,
    pub session_ttls: SessionTtls,
    pub session_cleanup: Duration,
    pub chat: ChatSettings,
    pub backend: BackendConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.port == 0 {
            return Err(ConfigError::Validation("port must be non-zero".into()));
        }
        if !matches!(file.chat_type.as_str(), "0" | "1" | "2") {
            return Err(ConfigError::Validation(format!(
                "chat_type must be \"0\", \"1\" or \"2\", got {:?}",
                file.chat_type
            )));
        }
        if !matches!(file.default_mode.as_str(), "单聊" | "串聊") {
            return Err(ConfigError::Validation(format!(
                "default_mode must be 单聊 or 串聊, got {:?}",
                file.default_mode
            )));
        }
        if file.session_clear_token.trim().is_empty() {
            return Err(ConfigError::Validation("session_clear_token must not be empty".into()));
        }
        let service_url = file
            .service_url
            .unwrap_or_else(|| format!("http://localhost:{}", file.port));
        if !service_url.starts_with("http") {
            return Err(ConfigError::Validation(
                "service_url appears invalid (expected http:// or https://)".into(),
            ));
        }
        file.session_ttl.validate()?;
        let session_cleanup = checked_minutes("session_cleanup_minutes", file.session_cleanup_minutes.max(1))?;
        if file.prompts.iter().any(|p| p.title.trim().is_empty()) {
            return Err(ConfigError::Validation("prompt titles must not be empty".into()));
        }

        let policy = AccessPolicy {
            allow_groups: file.allow_groups.into_iter().collect(),
            allow_outgoing_groups: file.allow_outgoing_groups.into_iter().collect(),
            allow_users: file.allow_users.into_iter().collect(),
            deny_users: file.deny_users.into_iter().collect(),
            admin_users: file.admin_users.into_iter().collect(),
            sensitive_words: file.sensitive_words,
            chat_type: (file.chat_type != "0").then_some(file.chat_type),
        };

        let backend = file.backend.into_config();
        let chat = ChatSettings {
            clear_token: file.session_clear_token,
            default_mode: file.default_mode,
            max_context_chars: file.max_context_chars,
            max_requests: file.max_requests,
            backend_timeout: backend.timeout,
            personas: file.prompts,
        };

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        Ok(Self {
            port: file.port,
            service_url: service_url.trim_end_matches('/').to_string(),
            app_secret: file.app_secret,
            help: file.help,
            log_level: file.log_level,
            data_dir,
            console: file.console,
            policy,
            session_ttls: file.session_ttl.into_ttls(),
            session_cleanup: Duration::from_secs(session_cleanup),
            chat,
            backend,
        })
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("chat_history.db")
    }
}
