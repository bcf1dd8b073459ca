//! Derives one commit status from an event's job descriptors and pushes it
//! to the forge.
//!
//! `aggregate` is a pure function of the latest-attempt descriptor set:
//! identical states always produce the identical report, whatever order the
//! workers raced through their transitions in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::EventId;
use crate::store::{FailureKind, JobDescriptor, JobId, JobPhase, JobState, JobStore};

/// Combined state reported against the commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    Pending,
    Succeeded,
    Failed,
    Canceled,
    /// Nothing was configured to run for this event
    Neutral,
}

impl std::fmt::Display for CommitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommitState::Pending => "pending",
            CommitState::Succeeded => "succeeded",
            CommitState::Failed => "failed",
            CommitState::Canceled => "canceled",
            CommitState::Neutral => "neutral",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusLine {
    pub job_id: JobId,
    pub backend: crate::backend::BackendKind,
    pub target: String,
    pub phase: JobPhase,
    pub attempt: u32,
    pub error: Option<String>,
}

/// Derived on demand, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub event_id: EventId,
    pub state: CommitState,
    pub description: String,
    pub jobs: Vec<JobStatusLine>,
}

/// Combine the latest attempt per (backend, target) into one status.
///
/// Precedence: anything still active wins as `Pending` (a transient
/// failure that will be retried counts as active); then a permanent
/// failure; then cancellation; all-green is `Succeeded`; an empty set is
/// `Neutral`.
pub fn aggregate(event_id: EventId, latest_attempts: &[JobDescriptor]) -> StatusReport {
    let mut jobs: Vec<&JobDescriptor> = latest_attempts.iter().collect();
    jobs.sort_by(|a, b| (a.backend, &a.target).cmp(&(b.backend, &b.target)));

    let lines: Vec<JobStatusLine> = jobs
        .iter()
        .map(|job| JobStatusLine {
            job_id: job.id,
            backend: job.backend,
            target: job.target.clone(),
            phase: job.state.phase(),
            attempt: job.attempt,
            error: job.last_error.clone(),
        })
        .collect();

    let (state, description) = if jobs.is_empty() {
        (CommitState::Neutral, "no jobs configured".to_string())
    } else if let Some(active) = jobs.iter().find(|job| !job.state.is_terminal()) {
        (
            CommitState::Pending,
            format!("{} job for {} in progress", active.backend, active.target),
        )
    } else if let Some(failed) = jobs.iter().find(|job| {
        matches!(
            &job.state,
            JobState::Failed {
                kind: FailureKind::Permanent,
                ..
            }
        )
    }) {
        let reason = failed.last_error.as_deref().unwrap_or("unknown failure");
        (
            CommitState::Failed,
            format!("{} job for {} failed: {reason}", failed.backend, failed.target),
        )
    } else if let Some(retrying) = jobs.iter().find(|job| {
        matches!(
            &job.state,
            JobState::Failed {
                kind: FailureKind::Transient,
                ..
            }
        )
    }) {
        // A transient failure on the latest attempt means a retry
        // descriptor is on its way.
        (
            CommitState::Pending,
            format!(
                "{} job for {} failed transiently, retry pending",
                retrying.backend, retrying.target
            ),
        )
    } else if jobs
        .iter()
        .any(|job| job.state.phase() == JobPhase::Canceled)
    {
        (CommitState::Canceled, "jobs were canceled".to_string())
    } else {
        (
            CommitState::Succeeded,
            format!("all {} jobs succeeded", jobs.len()),
        )
    };

    StatusReport {
        event_id,
        state,
        description,
        jobs: lines,
    }
}

#[derive(Debug, Clone, Error)]
#[error("status report failed: {0}")]
pub struct ReportError(pub String);

/// Commit-status API boundary. Implementations must tolerate repeated
/// identical reports.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, commit_sha: &str, report: &StatusReport) -> Result<(), ReportError>;
}

/// Reporter that only logs; the default when no forge integration is wired.
pub struct LogReporter;

#[async_trait]
impl StatusReporter for LogReporter {
    async fn report(&self, commit_sha: &str, report: &StatusReport) -> Result<(), ReportError> {
        tracing::info!(
            commit = commit_sha,
            event_id = %report.event_id,
            state = %report.state,
            description = %report.description,
            "Commit status"
        );
        Ok(())
    }
}

/// Recompute the event's status and push it out. Reporter failures are
/// logged, never escalated to the job that triggered the report.
pub async fn publish(store: &dyn JobStore, reporter: &dyn StatusReporter, event_id: EventId) {
    let Some(event) = store.get_event(event_id) else {
        tracing::warn!(event_id = %event_id, "Cannot report status for unknown event");
        return;
    };
    let latest = store.latest_attempts(event_id);
    let report = aggregate(event_id, &latest);
    if let Err(e) = reporter.report(&event.commit_sha, &report).await {
        tracing::warn!(event_id = %event_id, error = %e, "Commit status report failed");
    }
}
