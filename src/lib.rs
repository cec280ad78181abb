//! DingTalk robot bridging group and direct chats to an AI completion backend.

pub mod chatbot;
pub mod config;
pub mod console;
pub mod error;
pub mod gate;
pub mod server;

pub use config::Config;
pub use error::PipelineError;
