use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind of inbound trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest { number: u64 },
    Release { tag: String },
    /// Explicit user-requested re-run of a previous event
    ManualRerun { of: EventId },
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Push => write!(f, "push"),
            EventKind::PullRequest { number } => write!(f, "pull_request #{number}"),
            EventKind::Release { tag } => write!(f, "release {tag}"),
            EventKind::ManualRerun { of } => write!(f, "manual_rerun of {of}"),
        }
    }
}

/// Reference to the project on its source forge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    /// Forge instance, e.g. "github.com" or "pagure.io"
    pub forge: String,
    pub namespace: String,
    pub repo: String,
}

impl std::fmt::Display for ProjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.forge, self.namespace, self.repo)
    }
}

/// One configured target for one backend: a build chroot, a test plan
/// name, or a release target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub backend: BackendKind,
    pub target: String,
}

/// Project configuration as resolved at event creation time.
///
/// The snapshot is never re-read after the event is created, so re-runs
/// reproduce the original target set even if the project configuration
/// changed in the meantime. Upstream resolution failures are carried as
/// `Unresolved` and abort dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "resolution")]
pub enum ConfigSnapshot {
    Resolved { targets: Vec<TargetSpec> },
    Unresolved { reason: String },
}

impl ConfigSnapshot {
    pub fn targets(&self) -> Result<&[TargetSpec], String> {
        match self {
            ConfigSnapshot::Resolved { targets } => Ok(targets),
            ConfigSnapshot::Unresolved { reason } => Err(reason.clone()),
        }
    }
}

/// Normalized inbound trigger. Immutable once created: all fields are set
/// by the constructor and never written afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub project: ProjectRef,
    pub kind: EventKind,
    /// Commit the combined status is reported against
    pub commit_sha: String,
    /// Git ref the event targets (branch, tag, or PR head ref)
    pub git_ref: String,
    /// Account that triggered the event
    pub actor: String,
    pub created_at: DateTime<Utc>,
    pub config: ConfigSnapshot,
}

impl Event {
    pub fn new(
        project: ProjectRef,
        kind: EventKind,
        commit_sha: String,
        git_ref: String,
        actor: String,
        config: ConfigSnapshot,
    ) -> Self {
        Self {
            id: EventId::new(),
            project,
            kind,
            commit_sha,
            git_ref,
            actor,
            created_at: Utc::now(),
            config,
        }
    }
}
