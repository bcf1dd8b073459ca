//! Release backend: creates distribution updates through the thin
//! `BodhiApi` boundary. Updates cannot be withdrawn once filed, so
//! cancellation always reports `NotCancelable`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::store::{FailureKind, JobDescriptor, JobId};

use super::{
    BackendApiError, BackendKind, CancelOutcome, ExecutionBackend, ExternalRef, PollError,
    PollOutcome, SubmissionError,
};

#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub job_id: JobId,
    /// Release target, e.g. "fedora-41"
    pub release: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateState {
    Pending,
    Testing,
    Stable,
    Unpushed(String),
}

#[async_trait]
pub trait BodhiApi: Send + Sync {
    async fn create_update(&self, request: &UpdateRequest) -> Result<String, BackendApiError>;
    async fn update_state(&self, update_id: &str) -> Result<UpdateState, BackendApiError>;
}

pub struct BodhiReleaseBackend {
    api: Arc<dyn BodhiApi>,
}

impl BodhiReleaseBackend {
    pub fn new(api: Arc<dyn BodhiApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ExecutionBackend for BodhiReleaseBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Release
    }

    async fn submit(&self, job: &JobDescriptor) -> Result<ExternalRef, SubmissionError> {
        let request = UpdateRequest {
            job_id: job.id,
            release: job.target.clone(),
        };
        let update_id = self.api.create_update(&request).await.map_err(|e| match e {
            BackendApiError::Rejected(msg) => {
                SubmissionError::permanent(BackendKind::Release, msg)
            }
            BackendApiError::Unavailable(msg) => {
                SubmissionError::transient(BackendKind::Release, msg)
            }
            BackendApiError::NotFound => {
                SubmissionError::permanent(BackendKind::Release, "release target not found")
            }
        })?;

        Ok(ExternalRef {
            backend: BackendKind::Release,
            id: update_id,
        })
    }

    async fn poll(&self, external_ref: &ExternalRef) -> Result<PollOutcome, PollError> {
        match self.api.update_state(&external_ref.id).await {
            Ok(UpdateState::Pending) | Ok(UpdateState::Testing) => Ok(PollOutcome::Running),
            Ok(UpdateState::Stable) => Ok(PollOutcome::Succeeded),
            Ok(UpdateState::Unpushed(reason)) => Ok(PollOutcome::Failed {
                kind: FailureKind::Permanent,
                reason: format!("update unpushed: {reason}"),
            }),
            Err(BackendApiError::NotFound) => Ok(PollOutcome::NotFound),
            Err(e) => Err(PollError {
                external_ref: external_ref.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn cancel(&self, _external_ref: &ExternalRef) -> Result<CancelOutcome, PollError> {
        Ok(CancelOutcome::NotCancelable)
    }
}

/// In-memory Bodhi for tests and local development.
pub struct InMemoryBodhiApi {
    script: Vec<UpdateState>,
    inner: Mutex<InMemoryInner>,
}

#[derive(Default)]
struct InMemoryInner {
    next_id: u64,
    cursors: HashMap<String, usize>,
}

impl InMemoryBodhiApi {
    pub fn new() -> Self {
        Self::with_script(vec![UpdateState::Testing, UpdateState::Stable])
    }

    pub fn with_script(script: Vec<UpdateState>) -> Self {
        Self {
            script,
            inner: Mutex::new(InMemoryInner::default()),
        }
    }
}

impl Default for InMemoryBodhiApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BodhiApi for InMemoryBodhiApi {
    async fn create_update(&self, request: &UpdateRequest) -> Result<String, BackendApiError> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let update_id = format!("FEDORA-{}-{}", request.release, inner.next_id);
        inner.cursors.insert(update_id.clone(), 0);
        Ok(update_id)
    }

    async fn update_state(&self, update_id: &str) -> Result<UpdateState, BackendApiError> {
        let mut inner = self.inner.lock().await;
        let cursor = inner
            .cursors
            .get_mut(update_id)
            .ok_or(BackendApiError::NotFound)?;
        let state = self
            .script
            .get(*cursor)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or(UpdateState::Stable);
        if *cursor + 1 < self.script.len() {
            *cursor += 1;
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventId;

    #[tokio::test]
    async fn release_is_not_cancelable() {
        let backend = BodhiReleaseBackend::new(Arc::new(InMemoryBodhiApi::new()));
        let job = JobDescriptor::new(EventId::new(), BackendKind::Release, "fedora-41".into(), 0);
        let external_ref = backend.submit(&job).await.unwrap();
        assert_eq!(
            backend.cancel(&external_ref).await.unwrap(),
            CancelOutcome::NotCancelable
        );
    }

    #[tokio::test]
    async fn update_walks_to_stable() {
        let backend = BodhiReleaseBackend::new(Arc::new(InMemoryBodhiApi::new()));
        let job = JobDescriptor::new(EventId::new(), BackendKind::Release, "fedora-41".into(), 0);
        let external_ref = backend.submit(&job).await.unwrap();
        assert!(external_ref.id.starts_with("FEDORA-fedora-41-"));
        assert_eq!(backend.poll(&external_ref).await.unwrap(), PollOutcome::Running);
        assert_eq!(
            backend.poll(&external_ref).await.unwrap(),
            PollOutcome::Succeeded
        );
    }
}
