//! Chatbot module - relays DingTalk messages to the completion backend.

pub mod backend;
pub mod bridge;
pub mod engine;
pub mod lookup;
pub mod message;
pub mod persona;
pub mod reply;
pub mod router;
pub mod session;
pub mod transcript;


pub use backend::{CompletionBackend, OpenAiBackend};
pub use engine::{ChatbotEngine, EngineConfig, EngineParts};
pub use lookup::{DomainLookup, PublicLookup};
pub use message::{IncomingEvent, ReplyPayload};
pub use reply::{DingTalkReplier, ReplyChannel};
pub use session::SessionStore;
pub use transcript::TranscriptStore;
