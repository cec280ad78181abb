//! Chat modes and persona shorthands.

use crate::config::Persona;

const SINGLE: &str = "单聊";
const THREAD: &str = "串聊";
const PERSONA_PREFIX: &str = "persona:";

/// How a user's prompts are built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatMode {
    /// Every message is a fresh conversation.
    Single,
    /// Context is carried between messages.
    Thread,
    /// Threaded, with the persona prefix sent as the system instruction.
    Persona(String),
}

impl ChatMode {
    /// Parse a stored mode string. Unknown or empty values yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            SINGLE => Some(ChatMode::Single),
            THREAD => Some(ChatMode::Thread),
            _ => s
                .strip_prefix(PERSONA_PREFIX)
                .filter(|title| !title.is_empty())
                .map(|title| ChatMode::Persona(title.to_string())),
        }
    }

    /// Stored mode, falling back to `default` and then to threaded.
    pub fn resolve(stored: &str, default: &str) -> Self {
        Self::parse(stored)
            .or_else(|| Self::parse(default))
            .unwrap_or(ChatMode::Thread)
    }

    pub fn as_stored(&self) -> String {
        match self {
            ChatMode::Single => SINGLE.to_string(),
            ChatMode::Thread => THREAD.to_string(),
            ChatMode::Persona(title) => format!("{PERSONA_PREFIX}{title}"),
        }
    }

    pub fn keeps_context(&self) -> bool {
        !matches!(self, ChatMode::Single)
    }

    /// Exact-text mode switch commands.
    pub fn from_command(text: &str) -> Option<Self> {
        match text {
            SINGLE => Some(ChatMode::Single),
            THREAD => Some(ChatMode::Thread),
            _ => None,
        }
    }
}

/// Result of matching a persona shorthand at the start of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaMatch<'a> {
    pub persona: &'a Persona,
    /// Text after the shorthand, trimmed. Empty means "preview only".
    pub rest: String,
}

/// Match `#<title>` at the start of `text`. Longest title wins so that
/// `#周报总结` is not taken for `#周报`.
pub fn match_persona<'a>(personas: &'a [Persona], text: &str) -> Option<PersonaMatch<'a>> {
    let body = text.strip_prefix('#')?;
    personas
        .iter()
        .filter(|p| body.starts_with(p.title.as_str()))
        .max_by_key(|p| p.title.len())
        .map(|persona| PersonaMatch {
            persona,
            rest: body[persona.title.len()..].trim().to_string(),
        })
}

pub fn find_persona<'a>(personas: &'a [Persona], title: &str) -> Option<&'a Persona> {
    personas.iter().find(|p| p.title == title)
}
