//! Errors surfaced by the message pipeline.
//!
//! By the time one of these reaches a caller, any reply owed to the user has
//! already been attempted. Callers only log them.

use thiserror::Error;

use crate::chatbot::backend::BackendError;
use crate::chatbot::lookup::LookupError;
use crate::chatbot::reply::ReplyError;
use crate::chatbot::transcript::TranscriptError;
use crate::gate::RejectReason;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("rejected: {0}")]
    Rejected(RejectReason),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("upstream failure: {0}")]
    Upstream(#[from] BackendError),
    #[error("lookup failure: {0}")]
    Lookup(#[from] LookupError),
    #[error("persistence failure: {0}")]
    Persistence(#[from] TranscriptError),
    #[error("reply failed: {0}")]
    Reply(#[from] ReplyError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Rejections the HTTP layer answers with `400` instead of an empty `200`.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, PipelineError::Rejected(RejectReason::EmptyPayload))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
