//! Durable record of every dispatched job and the only mutation path for
//! its state.
//!
//! A `JobDescriptor` is created once per (event, backend, target) attempt
//! and then only changes through `JobStore::transition`, an atomic
//! compare-and-swap on the current phase. Retries never mutate an existing
//! record: the supervisor appends a successor descriptor with a fresh id
//! and a bumped attempt index, so history stays auditable and terminal
//! states stay terminal.

mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::backend::{BackendKind, ExternalRef};
use crate::event::{Event, EventId};

pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Classification that decides retry eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Permanent => write!(f, "permanent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "phase")]
pub enum JobState {
    Pending,
    Submitted,
    Running,
    Succeeded,
    Failed { kind: FailureKind, reason: String },
    Canceled,
}

/// State discriminant used for compare-and-swap transitions and queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Pending,
    Submitted,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobPhase::Succeeded | JobPhase::Failed | JobPhase::Canceled
        )
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobPhase::Pending => "pending",
            JobPhase::Submitted => "submitted",
            JobPhase::Running => "running",
            JobPhase::Succeeded => "succeeded",
            JobPhase::Failed => "failed",
            JobPhase::Canceled => "canceled",
        };
        write!(f, "{name}")
    }
}

impl JobState {
    pub fn phase(&self) -> JobPhase {
        match self {
            JobState::Pending => JobPhase::Pending,
            JobState::Submitted => JobPhase::Submitted,
            JobState::Running => JobPhase::Running,
            JobState::Succeeded => JobPhase::Succeeded,
            JobState::Failed { .. } => JobPhase::Failed,
            JobState::Canceled => JobPhase::Canceled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            JobState::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Idempotency key for dispatch: at most one non-terminal descriptor may
/// exist per key at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub event_id: EventId,
    pub backend: BackendKind,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: JobId,
    pub event_id: EventId,
    pub backend: BackendKind,
    /// Build chroot, test plan name, or release target
    pub target: String,
    pub state: JobState,
    /// Zero-based attempt index; a retry is a new descriptor with this
    /// bumped by one
    pub attempt: u32,
    pub external_ref: Option<ExternalRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl JobDescriptor {
    pub fn new(event_id: EventId, backend: BackendKind, target: String, attempt: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            event_id,
            backend,
            target,
            state: JobState::Pending,
            attempt,
            external_ref: None,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            event_id: self.event_id,
            backend: self.backend,
            target: self.target.clone(),
        }
    }

    /// Failure state for this descriptor, upgrading a transient failure to
    /// permanent when the retry budget is spent. Keeping the upgrade at the
    /// single mutation path guarantees exhausted chains always end
    /// permanent.
    pub fn failure_state(&self, kind: FailureKind, reason: String, budget: u32) -> JobState {
        match kind {
            FailureKind::Transient if self.attempt >= budget => JobState::Failed {
                kind: FailureKind::Permanent,
                reason: format!("retry budget exhausted after attempt {}: {reason}", self.attempt),
            },
            kind => JobState::Failed { kind, reason },
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("job already exists: {0}")]
    DuplicateJob(JobId),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Another worker already moved the descriptor; the caller lost the
    /// compare-and-swap and must not apply its transition.
    #[error("job {job_id}: expected phase {expected}, found {actual}")]
    StateConflict {
        job_id: JobId,
        expected: JobPhase,
        actual: JobPhase,
    },

    /// No transition ever leaves a terminal state.
    #[error("job {job_id} is terminal in phase {phase}")]
    TerminalState { job_id: JobId, phase: JobPhase },

    #[error("job {0} already has an external reference")]
    ExternalRefAlreadySet(JobId),

    #[error("event already exists: {0}")]
    DuplicateEvent(EventId),

    #[error("event not found: {0}")]
    EventNotFound(EventId),
}

/// Keyed storage for events and job descriptors with atomic
/// compare-and-swap on job state.
///
/// Methods are synchronous: implementations are expected to hold short
/// critical sections (the in-memory store) or map onto single round-trips.
pub trait JobStore: Send + Sync {
    fn insert_event(&self, event: Event) -> Result<(), StoreError>;

    fn get_event(&self, event_id: EventId) -> Option<Event>;

    fn insert(&self, descriptor: JobDescriptor) -> Result<(), StoreError>;

    fn get(&self, job_id: JobId) -> Option<JobDescriptor>;

    /// Atomically move the descriptor from `expected` to `next`.
    ///
    /// Rejects with `TerminalState` when the descriptor already reached a
    /// terminal phase and with `StateConflict` when another worker got
    /// there first. This is the only way job state changes.
    fn transition(
        &self,
        job_id: JobId,
        expected: JobPhase,
        next: JobState,
    ) -> Result<JobDescriptor, StoreError>;

    /// Record the external system's reference. Write-once.
    fn set_external_ref(&self, job_id: JobId, external_ref: ExternalRef)
        -> Result<(), StoreError>;

    /// Full descriptor history for an event, oldest first.
    fn jobs_for_event(&self, event_id: EventId) -> Vec<JobDescriptor>;

    /// The non-terminal descriptor for a key, if any. Dispatch idempotency
    /// check.
    fn active_job_for_key(&self, key: &JobKey) -> Option<JobDescriptor>;

    /// Newest attempt per (backend, target) key of the event. Aggregation
    /// input.
    fn latest_attempts(&self, event_id: EventId) -> Vec<JobDescriptor>;

    /// Non-terminal descriptors not updated since `cutoff`. Covers
    /// `Submitted`/`Running` jobs that stopped making progress as well as
    /// `Pending` jobs whose queue delivery was lost.
    fn stale_jobs(&self, cutoff: DateTime<Utc>) -> Vec<JobDescriptor>;

    /// Latest-attempt descriptors in `Failed(Transient)`, i.e. failures
    /// that have not been superseded by a retry yet.
    fn retryable_jobs(&self) -> Vec<JobDescriptor>;
}
