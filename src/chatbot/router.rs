//! Command classification.
//!
//! Routing is an ordered table of (predicate, intent) rules per entry point.
//! The first matching rule wins; no match means default chat.

use crate::chatbot::message::ConversationKind;

pub const HELP_KEYWORD: &str = "帮助";
pub const HISTORY_PREFIX: &str = "#查对话";
pub const TITLE_PREFIX: &str = "#标题设置";
pub const IMAGE_PREFIX: &str = "#图片";
pub const DOMAIN_PREFIX: &str = "#域名";
pub const CERT_PREFIX: &str = "#证书";
pub const CLEAR_HISTORY_PREFIX: &str = "#清除对话";
pub const GROUP_ID_KEYWORD: &str = "群ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Help,
    HistoryQuery,
    SetDisplayName,
    ImageGeneration,
    DomainLookup,
    CertificateLookup,
    ClearHistory,
    GroupIdQuery,
    DefaultChat,
}

/// Which front door a message came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Console,
    Webhook,
}

struct Rule {
    intent: Intent,
    matches: fn(&str, ConversationKind) -> bool,
}

const WEBHOOK_RULES: &[Rule] = &[
    Rule { intent: Intent::ImageGeneration, matches: |t, _| t.starts_with(IMAGE_PREFIX) },
    Rule { intent: Intent::HistoryQuery, matches: |t, _| t.starts_with(HISTORY_PREFIX) },
    Rule { intent: Intent::SetDisplayName, matches: |t, _| t.starts_with(TITLE_PREFIX) },
    Rule { intent: Intent::DomainLookup, matches: |t, _| t.starts_with(DOMAIN_PREFIX) },
    Rule { intent: Intent::CertificateLookup, matches: |t, _| t.starts_with(CERT_PREFIX) },
    Rule { intent: Intent::ClearHistory, matches: |t, _| t.starts_with(CLEAR_HISTORY_PREFIX) },
    Rule {
        intent: Intent::GroupIdQuery,
        matches: |t, kind| kind == ConversationKind::Group && t == GROUP_ID_KEYWORD,
    },
];

const CONSOLE_RULES: &[Rule] = &[
    Rule { intent: Intent::HistoryQuery, matches: |t, _| t.starts_with(HISTORY_PREFIX) },
    Rule { intent: Intent::SetDisplayName, matches: |t, _| t.starts_with(TITLE_PREFIX) },
];

/// Empty input, a single character, or the help keyword.
pub fn is_help(text: &str) -> bool {
    text.is_empty() || text.chars().count() == 1 || text == HELP_KEYWORD
}

/// Classify already-trimmed text.
pub fn classify(entry: Entry, text: &str, kind: ConversationKind) -> Intent {
    if is_help(text) {
        return Intent::Help;
    }
    let rules = match entry {
        Entry::Console => CONSOLE_RULES,
        Entry::Webhook => WEBHOOK_RULES,
    };
    rules
        .iter()
        .find(|rule| (rule.matches)(text, kind))
        .map(|rule| rule.intent)
        .unwrap_or(Intent::DefaultChat)
}

/// Argument after `prefix`, separated by an ASCII or full-width colon.
/// `None` when the separator is missing.
pub fn colon_argument<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(prefix)?.trim_start();
    rest.strip_prefix(':')
        .or_else(|| rest.strip_prefix('：'))
        .map(str::trim)
}

/// Argument after `prefix`, with an optional colon separator.
pub fn loose_argument<'a>(text: &'a str, prefix: &str) -> &'a str {
    let rest = text.strip_prefix(prefix).unwrap_or(text).trim_start();
    rest.strip_prefix(':')
        .or_else(|| rest.strip_prefix('：'))
        .unwrap_or(rest)
        .trim()
}
