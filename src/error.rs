use thiserror::Error;

use crate::backend::{PollError, SubmissionError};
use crate::event::EventId;
use crate::sandbox::SandboxError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ForgeciError {
    /// Project configuration could not be resolved; dispatch is aborted
    /// before any job is created.
    #[error("configuration unresolved: {reason}")]
    Configuration { reason: String },

    #[error("submission failed: {0}")]
    Submission(#[from] SubmissionError),

    #[error("poll failed: {0}")]
    Poll(#[from] PollError),

    #[error("sandbox failure: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("work queue is at capacity")]
    QueueFull,

    #[error("event not found: {0}")]
    EventNotFound(EventId),

    /// Best-effort only; never escalated to a failure of the owning event.
    #[error("cancellation failed: {0}")]
    Cancellation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ForgeciError>;
