//! Pluggable adapters to external build/test/release systems.
//!
//! Every backend implements the same capability set {submit, poll, cancel}
//! over a thin API boundary trait for its external system. The set of
//! backend kinds is closed so the registry stays a fixed dispatch table
//! rather than open-ended plugin loading.

pub mod bodhi;
pub mod copr;
pub mod testing_farm;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{FailureKind, JobDescriptor};

pub use bodhi::BodhiReleaseBackend;
pub use copr::CoprBuildBackend;
pub use testing_farm::TestingFarmBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Build,
    Test,
    Release,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Build => write!(f, "build"),
            BackendKind::Test => write!(f, "test"),
            BackendKind::Release => write!(f, "release"),
        }
    }
}

/// Weak reference to a job record inside an external system. Assigned once
/// on successful submission and never reassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRef {
    pub backend: BackendKind,
    pub id: String,
}

impl std::fmt::Display for ExternalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.backend, self.id)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind} failure from {backend} backend: {message}")]
pub struct SubmissionError {
    pub backend: BackendKind,
    pub kind: FailureKind,
    pub message: String,
}

impl SubmissionError {
    pub fn transient(backend: BackendKind, message: impl Into<String>) -> Self {
        Self {
            backend,
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(backend: BackendKind, message: impl Into<String>) -> Self {
        Self {
            backend,
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }
}

/// Always transient: a failed status check is retried with backoff and
/// never fails the job by itself.
#[derive(Debug, Clone, Error)]
#[error("poll of {external_ref} failed: {message}")]
pub struct PollError {
    pub external_ref: ExternalRef,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Running,
    Succeeded,
    Failed { kind: FailureKind, reason: String },
    /// The external system has no record (yet); treated as a transient
    /// anomaly after a successful submission, not as a failure.
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    NotCancelable,
}

/// Error surfaced by the thin per-system API boundary. Backends translate
/// these into the transient/permanent taxonomy.
#[derive(Debug, Clone, Error)]
pub enum BackendApiError {
    /// The external system rejected the request outright (invalid target,
    /// quota, permissions); retrying the same request cannot help.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The external system could not be reached or answered with a
    /// server-side error; worth retrying.
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("no such record")]
    NotFound,
}

/// Uniform capability interface implemented once per external system.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Submit the job to the external system. Called at most once per
    /// descriptor; the returned ref is stored write-once.
    async fn submit(&self, job: &JobDescriptor) -> Result<ExternalRef, SubmissionError>;

    /// Non-blocking status check.
    async fn poll(&self, external_ref: &ExternalRef) -> Result<PollOutcome, PollError>;

    /// Best-effort cancellation; `NotCancelable` is a valid answer, not an
    /// error.
    async fn cancel(&self, external_ref: &ExternalRef) -> Result<CancelOutcome, PollError>;
}

impl std::fmt::Debug for dyn ExecutionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExecutionBackend({})", self.kind())
    }
}

/// Fixed dispatch table over the closed set of backend kinds.
pub struct BackendRegistry {
    backends: HashMap<BackendKind, Arc<dyn ExecutionBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    pub fn register(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn ExecutionBackend>> {
        self.backends.get(&kind).cloned()
    }

    /// Missing registration is a permanent submission failure: the target
    /// was configured for a backend this deployment does not carry.
    pub fn require(&self, kind: BackendKind) -> Result<Arc<dyn ExecutionBackend>, SubmissionError> {
        self.get(kind)
            .ok_or_else(|| SubmissionError::permanent(kind, "no backend registered for kind"))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
