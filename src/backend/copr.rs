//! Build backend: renders the source artifact in the sandbox, then submits
//! it to COPR through the thin `CoprApi` boundary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::RecipeConfig;
use crate::sandbox::{SandboxRunner, SandboxSpec};
use crate::store::{JobDescriptor, JobId};

use super::{
    BackendApiError, BackendKind, CancelOutcome, ExecutionBackend, ExternalRef, PollError,
    PollOutcome, SubmissionError,
};

#[derive(Debug, Clone)]
pub struct CoprBuildRequest {
    pub job_id: JobId,
    /// Build chroot, e.g. "fedora-rawhide-x86_64"
    pub chroot: String,
    pub srpm_path: PathBuf,
    pub srpm_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoprBuildState {
    Pending,
    Running,
    Succeeded,
    Failed(String),
    Canceled,
}

/// Interface boundary to the COPR build service. The real client library
/// lives outside this core.
#[async_trait]
pub trait CoprApi: Send + Sync {
    async fn create_build(&self, request: &CoprBuildRequest) -> Result<String, BackendApiError>;
    async fn build_state(&self, build_id: &str) -> Result<CoprBuildState, BackendApiError>;
    async fn cancel_build(&self, build_id: &str) -> Result<(), BackendApiError>;
}

pub struct CoprBuildBackend {
    api: Arc<dyn CoprApi>,
    sandbox: Arc<SandboxRunner>,
    recipe: RecipeConfig,
    sandbox_timeout: Duration,
}

impl CoprBuildBackend {
    pub fn new(
        api: Arc<dyn CoprApi>,
        sandbox: Arc<SandboxRunner>,
        recipe: RecipeConfig,
        sandbox_timeout: Duration,
    ) -> Self {
        Self {
            api,
            sandbox,
            recipe,
            sandbox_timeout,
        }
    }
}

#[async_trait]
impl ExecutionBackend for CoprBuildBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Build
    }

    async fn submit(&self, job: &JobDescriptor) -> Result<ExternalRef, SubmissionError> {
        // The recipe comes from the repository and is untrusted; it only
        // ever runs inside the sandbox.
        let spec = SandboxSpec {
            program: self.recipe.program.clone(),
            args: self.recipe.args.clone(),
            inputs: Vec::new(),
            expected_artifact: self.recipe.artifact.clone(),
        };
        let artifact = self
            .sandbox
            .run(&spec, self.sandbox_timeout)
            .await
            .map_err(|e| SubmissionError {
                backend: BackendKind::Build,
                kind: e.failure_kind(),
                message: format!("source render failed: {e}"),
            })?;

        tracing::debug!(
            job_id = %job.id,
            chroot = %job.target,
            digest = %artifact.digest,
            "Source artifact rendered, submitting build"
        );

        let request = CoprBuildRequest {
            job_id: job.id,
            chroot: job.target.clone(),
            srpm_path: artifact.path,
            srpm_digest: artifact.digest,
        };
        let build_id = self
            .api
            .create_build(&request)
            .await
            .map_err(|e| match e {
                BackendApiError::Rejected(msg) => {
                    SubmissionError::permanent(BackendKind::Build, msg)
                }
                BackendApiError::Unavailable(msg) => {
                    SubmissionError::transient(BackendKind::Build, msg)
                }
                BackendApiError::NotFound => {
                    SubmissionError::permanent(BackendKind::Build, "copr project not found")
                }
            })?;

        Ok(ExternalRef {
            backend: BackendKind::Build,
            id: build_id,
        })
    }

    async fn poll(&self, external_ref: &ExternalRef) -> Result<PollOutcome, PollError> {
        match self.api.build_state(&external_ref.id).await {
            Ok(CoprBuildState::Pending) | Ok(CoprBuildState::Running) => Ok(PollOutcome::Running),
            Ok(CoprBuildState::Succeeded) => Ok(PollOutcome::Succeeded),
            Ok(CoprBuildState::Failed(reason)) => Ok(PollOutcome::Failed {
                kind: crate::store::FailureKind::Permanent,
                reason: format!("copr build failed: {reason}"),
            }),
            Ok(CoprBuildState::Canceled) => Ok(PollOutcome::Failed {
                kind: crate::store::FailureKind::Transient,
                reason: "copr build canceled externally".into(),
            }),
            Err(BackendApiError::NotFound) => Ok(PollOutcome::NotFound),
            Err(e) => Err(PollError {
                external_ref: external_ref.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn cancel(&self, external_ref: &ExternalRef) -> Result<CancelOutcome, PollError> {
        match self.api.cancel_build(&external_ref.id).await {
            Ok(()) => Ok(CancelOutcome::Canceled),
            Err(BackendApiError::Rejected(_)) | Err(BackendApiError::NotFound) => {
                Ok(CancelOutcome::NotCancelable)
            }
            Err(e) => Err(PollError {
                external_ref: external_ref.clone(),
                message: e.to_string(),
            }),
        }
    }
}

/// In-memory COPR for tests and local development: accepts builds and walks
/// each one through a scripted state sequence, one step per poll.
pub struct InMemoryCoprApi {
    script: Vec<CoprBuildState>,
    inner: Mutex<InMemoryInner>,
}

#[derive(Default)]
struct InMemoryInner {
    next_id: u64,
    cursors: HashMap<String, usize>,
    submit_failures: Vec<BackendApiError>,
    canceled: Vec<String>,
}

impl InMemoryCoprApi {
    pub fn new() -> Self {
        Self::with_script(vec![CoprBuildState::Running, CoprBuildState::Succeeded])
    }

    pub fn with_script(script: Vec<CoprBuildState>) -> Self {
        Self {
            script,
            inner: Mutex::new(InMemoryInner::default()),
        }
    }

    /// Queue errors returned by upcoming `create_build` calls, in order.
    pub async fn fail_next_submissions(&self, failures: Vec<BackendApiError>) {
        let mut inner = self.inner.lock().await;
        inner.submit_failures = failures;
    }

    pub async fn canceled_builds(&self) -> Vec<String> {
        self.inner.lock().await.canceled.clone()
    }
}

impl Default for InMemoryCoprApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoprApi for InMemoryCoprApi {
    async fn create_build(&self, _request: &CoprBuildRequest) -> Result<String, BackendApiError> {
        let mut inner = self.inner.lock().await;
        if !inner.submit_failures.is_empty() {
            return Err(inner.submit_failures.remove(0));
        }
        inner.next_id += 1;
        let build_id = inner.next_id.to_string();
        inner.cursors.insert(build_id.clone(), 0);
        Ok(build_id)
    }

    async fn build_state(&self, build_id: &str) -> Result<CoprBuildState, BackendApiError> {
        let mut inner = self.inner.lock().await;
        let cursor = inner
            .cursors
            .get_mut(build_id)
            .ok_or(BackendApiError::NotFound)?;
        let state = self
            .script
            .get(*cursor)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or(CoprBuildState::Succeeded);
        if *cursor + 1 < self.script.len() {
            *cursor += 1;
        }
        Ok(state)
    }

    async fn cancel_build(&self, build_id: &str) -> Result<(), BackendApiError> {
        let mut inner = self.inner.lock().await;
        if !inner.cursors.contains_key(build_id) {
            return Err(BackendApiError::NotFound);
        }
        inner.canceled.push(build_id.to_string());
        Ok(())
    }
}
