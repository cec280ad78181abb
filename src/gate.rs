//! Admission checks run before any command handling.
//!
//! Checks run in a fixed order and stop at the first failure. The gate only
//! decides; sending the owed reply is the caller's job.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::chatbot::message::{ConversationKind, IncomingEvent};
use crate::config::AccessPolicy;

type HmacSha256 = Hmac<Sha256>;

/// Maximum clock skew accepted on a signed callback.
const SIGNATURE_WINDOW_MS: i64 = 60 * 60 * 1000;

pub const EMPTY_PAYLOAD_MESSAGE: &str =
    "从钉钉回调过来的内容为空，根据过往的经验，或许重新创建一下机器人，能解决这个问题";
const SENSITIVE_MESSAGE: &str = "**🤷 抱歉，您提问的问题中包含敏感词汇，请审核自己的对话内容之后再进行！**";
const CHAT_TYPE_MESSAGE: &str = "**🤷 抱歉，管理员禁用了这种聊天方式，请选择其他聊天方式与机器人对话！**";
const GROUP_UNAUTHORIZED_MESSAGE: &str =
    "**🤷 抱歉，该群组未被认证通过，无法使用机器人对话功能。**\n>如需继续使用，请联系管理员申请访问权限。";
const USER_UNAUTHORIZED_MESSAGE: &str =
    "**🤷 抱歉，您的身份信息未被认证通过，无法使用机器人对话功能。**\n>如需继续使用，请联系管理员申请访问权限。";

/// Which allow-list turned the sender away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScope {
    Group,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidSignature,
    UnauthorizedOrigin,
    EmptyPayload,
    SensitiveContent,
    DisallowedChatType,
    Unauthorized(AuthScope),
}

impl RejectReason {
    /// Fixed reply owed to the sender, if any. Auth failures get none.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            RejectReason::InvalidSignature | RejectReason::UnauthorizedOrigin => None,
            RejectReason::EmptyPayload => Some(EMPTY_PAYLOAD_MESSAGE),
            RejectReason::SensitiveContent => Some(SENSITIVE_MESSAGE),
            RejectReason::DisallowedChatType => Some(CHAT_TYPE_MESSAGE),
            RejectReason::Unauthorized(AuthScope::Group) => Some(GROUP_UNAUTHORIZED_MESSAGE),
            RejectReason::Unauthorized(AuthScope::User) => Some(USER_UNAUTHORIZED_MESSAGE),
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::InvalidSignature => "invalid signature",
            RejectReason::UnauthorizedOrigin => "unauthorized origin",
            RejectReason::EmptyPayload => "empty payload",
            RejectReason::SensitiveContent => "sensitive content",
            RejectReason::DisallowedChatType => "disallowed chat type",
            RejectReason::Unauthorized(AuthScope::Group) => "group not authorized",
            RejectReason::Unauthorized(AuthScope::User) => "user not authorized",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Reject(RejectReason),
}

/// The `timestamp` and `sign` request headers.
#[derive(Debug, Clone, Default)]
pub struct SignatureHeaders {
    pub timestamp: String,
    pub sign: String,
}

/// DingTalk callback signature: `base64(HMAC-SHA256(secret, "<ts>\n<secret>"))`
/// with the millisecond timestamp within an hour of `now_ms`.
///
/// An empty secret disables the check.
pub fn verify_signature(timestamp: &str, sign: &str, secret: &str, now_ms: i64) -> bool {
    if secret.is_empty() {
        return true;
    }
    let Ok(ts) = timestamp.trim().parse::<i64>() else {
        return false;
    };
    if (now_ms - ts).abs() > SIGNATURE_WINDOW_MS {
        return false;
    }
    let Ok(provided) = base64::engine::general_purpose::STANDARD.decode(sign.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("{ts}\n{secret}").as_bytes());
    mac.verify_slice(&provided).is_ok()
}

/// Produce a signature the way DingTalk does. Used by tests and local tools.
pub fn sign(timestamp: i64, secret: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(format!("{timestamp}\n{secret}").as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

pub struct RequestGate {
    policy: AccessPolicy,
    app_secret: String,
}

impl RequestGate {
    pub fn new(policy: AccessPolicy, app_secret: String) -> Self {
        Self { policy, app_secret }
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn admit(&self, event: &IncomingEvent, headers: &SignatureHeaders) -> Admission {
        self.admit_at(event, headers, chrono::Utc::now().timestamp_millis())
    }

    /// `admit` against a fixed clock.
    pub fn admit_at(&self, event: &IncomingEvent, headers: &SignatureHeaders, now_ms: i64) -> Admission {
        let staff_id = event.sender_staff_id.as_str();

        // Outgoing robots carry no staff id and are not signed; their origin
        // group stands in for the signature.
        if !staff_id.is_empty() {
            if !verify_signature(&headers.timestamp, &headers.sign, &self.app_secret, now_ms) {
                warn!("🚫 Rejected callback with invalid signature (msg {})", event.msg_id);
                return Admission::Reject(RejectReason::InvalidSignature);
            }
        } else if !self.policy.is_outgoing_group_allowed(&event.conversation_id) {
            warn!("🚫 Rejected outgoing robot from unknown group {:?}", event.conversation_id);
            return Admission::Reject(RejectReason::UnauthorizedOrigin);
        }

        if event.content().is_empty() || event.chatbot_user_id.is_empty() {
            warn!("{}", EMPTY_PAYLOAD_MESSAGE);
            return Admission::Reject(RejectReason::EmptyPayload);
        }

        let text = event.content().trim();
        if let Some(word) = self.policy.sensitive_match(text) {
            info!("🙋 {} sent a message containing sensitive word {:?}", event.sender_nick, word);
            return Admission::Reject(RejectReason::SensitiveContent);
        }

        if let Some(ref allowed) = self.policy.chat_type {
            if allowed != event.kind().code() {
                info!("🙋 {} used a disabled chat type", event.sender_nick);
                return Admission::Reject(RejectReason::DisallowedChatType);
            }
        }

        if staff_id.is_empty() || self.policy.is_admin(staff_id) {
            debug!("Authorization skipped for {:?}", event.sender_identifier());
            return Admission::Allow;
        }

        if event.kind() == ConversationKind::Group && !self.policy.is_group_allowed(&event.conversation_id) {
            info!(
                "🙋 Group 『{}』 not authorized, id: {:?}, user: {:?}",
                event.conversation_title, event.conversation_id, staff_id
            );
            return Admission::Reject(RejectReason::Unauthorized(AuthScope::Group));
        }
        if !self.policy.is_user_allowed(staff_id) {
            info!("🙋 {} not authorized, user: {:?}", event.sender_nick, staff_id);
            return Admission::Reject(RejectReason::Unauthorized(AuthScope::User));
        }

        Admission::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatbot::message::Text;

    const SECRET: &str = "SECtest";
    const NOW: i64 = 1_700_000_000_000;

    fn event(staff_id: &str, kind: &str, text: &str) -> IncomingEvent {
        IncomingEvent {
            conversation_id: "cid-1".into(),
            chatbot_user_id: "bot".into(),
            sender_nick: "Ada".into(),
            sender_staff_id: staff_id.into(),
            conversation_type: kind.into(),
            conversation_title: "研发群".into(),
            text: Text { content: text.into() },
            ..Default::default()
        }
    }

    fn signed() -> SignatureHeaders {
        SignatureHeaders { timestamp: NOW.to_string(), sign: sign(NOW, SECRET) }
    }

    fn gate(policy: AccessPolicy) -> RequestGate {
        RequestGate::new(policy, SECRET.into())
    }

    fn set(items: &[&str]) -> std::collections::HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_signature_round_trip() {
        let s = sign(NOW, SECRET);
        assert!(verify_signature(&NOW.to_string(), &s, SECRET, NOW));
        assert!(verify_signature(&NOW.to_string(), &s, SECRET, NOW + 30 * 60 * 1000));
    }

    #[test]
    fn test_signature_rejects_wrong_secret_and_stale_timestamp() {
        let s = sign(NOW, SECRET);
        assert!(!verify_signature(&NOW.to_string(), &s, "other", NOW));
        assert!(!verify_signature(&NOW.to_string(), &s, SECRET, NOW + 2 * SIGNATURE_WINDOW_MS));
        assert!(!verify_signature("not-a-number", &s, SECRET, NOW));
        assert!(!verify_signature(&NOW.to_string(), "%%%", SECRET, NOW));
    }

    #[test]
    fn test_empty_secret_disables_signature() {
        assert!(verify_signature("", "", "", NOW));
    }

    #[test]
    fn test_bad_signature_rejected_silently() {
        let headers = SignatureHeaders { timestamp: NOW.to_string(), sign: "bogus".into() };
        let result = gate(AccessPolicy::default()).admit_at(&event("s1", "1", "hi"), &headers, NOW);
        assert_eq!(result, Admission::Reject(RejectReason::InvalidSignature));
        assert_eq!(RejectReason::InvalidSignature.user_message(), None);
    }

    #[test]
    fn test_outgoing_robot_origin_check() {
        let policy = AccessPolicy { allow_outgoing_groups: set(&["cid-ok"]), ..Default::default() };
        let g = gate(policy);
        let unsigned = SignatureHeaders::default();

        let result = g.admit_at(&event("", "2", "hi"), &unsigned, NOW);
        assert_eq!(result, Admission::Reject(RejectReason::UnauthorizedOrigin));

        let mut ok = event("", "2", "hi");
        ok.conversation_id = "cid-ok".into();
        assert_eq!(g.admit_at(&ok, &unsigned, NOW), Admission::Allow);
    }

    #[test]
    fn test_empty_payload() {
        let g = gate(AccessPolicy::default());
        assert_eq!(
            g.admit_at(&event("s1", "1", ""), &signed(), NOW),
            Admission::Reject(RejectReason::EmptyPayload)
        );
        let mut no_bot = event("s1", "1", "hi");
        no_bot.chatbot_user_id.clear();
        assert_eq!(g.admit_at(&no_bot, &signed(), NOW), Admission::Reject(RejectReason::EmptyPayload));
    }

    #[test]
    fn test_sensitive_words_anywhere_in_text() {
        let policy = AccessPolicy { sensitive_words: vec!["机密".into()], ..Default::default() };
        let g = gate(policy);
        for text in ["机密", "  这是机密文件  ", "abc机密"] {
            assert_eq!(
                g.admit_at(&event("s1", "2", text), &signed(), NOW),
                Admission::Reject(RejectReason::SensitiveContent),
                "{text}"
            );
        }
        assert!(RejectReason::SensitiveContent.user_message().is_some());
    }

    #[test]
    fn test_sensitive_check_applies_to_admins() {
        let policy = AccessPolicy {
            sensitive_words: vec!["机密".into()],
            admin_users: set(&["boss"]),
            ..Default::default()
        };
        assert_eq!(
            gate(policy).admit_at(&event("boss", "1", "机密"), &signed(), NOW),
            Admission::Reject(RejectReason::SensitiveContent)
        );
    }

    #[test]
    fn test_chat_type_restriction() {
        let policy = AccessPolicy { chat_type: Some("1".into()), ..Default::default() };
        let g = gate(policy);
        assert_eq!(
            g.admit_at(&event("s1", "2", "hi"), &signed(), NOW),
            Admission::Reject(RejectReason::DisallowedChatType)
        );
        assert_eq!(g.admit_at(&event("s1", "1", "hi"), &signed(), NOW), Admission::Allow);
    }

    #[test]
    fn test_group_allow_list_and_admin_bypass() {
        let policy = AccessPolicy {
            allow_groups: set(&["cid-other"]),
            allow_users: set(&["someone"]),
            admin_users: set(&["boss"]),
            ..Default::default()
        };
        let g = gate(policy);
        assert_eq!(
            g.admit_at(&event("s1", "2", "hi"), &signed(), NOW),
            Admission::Reject(RejectReason::Unauthorized(AuthScope::Group))
        );
        assert_eq!(g.admit_at(&event("boss", "2", "hi"), &signed(), NOW), Admission::Allow);
    }

    #[test]
    fn test_user_allow_and_deny_lists() {
        let policy = AccessPolicy {
            allow_users: set(&["s1", "s2"]),
            deny_users: set(&["s2"]),
            ..Default::default()
        };
        let g = gate(policy);
        assert_eq!(g.admit_at(&event("s1", "1", "hi"), &signed(), NOW), Admission::Allow);
        assert_eq!(
            g.admit_at(&event("s2", "1", "hi"), &signed(), NOW),
            Admission::Reject(RejectReason::Unauthorized(AuthScope::User))
        );
        assert_eq!(
            g.admit_at(&event("s3", "2", "hi"), &signed(), NOW),
            Admission::Reject(RejectReason::Unauthorized(AuthScope::User))
        );
    }

    #[test]
    fn test_admin_bypasses_deny_list() {
        let policy = AccessPolicy {
            deny_users: set(&["boss"]),
            admin_users: set(&["boss"]),
            ..Default::default()
        };
        assert_eq!(gate(policy).admit_at(&event("boss", "1", "hi"), &signed(), NOW), Admission::Allow);
    }

    #[test]
    fn test_open_policy_admits_everyone() {
        let g = gate(AccessPolicy::default());
        assert_eq!(g.admit_at(&event("anyone", "2", "hi"), &signed(), NOW), Admission::Allow);
    }
}
