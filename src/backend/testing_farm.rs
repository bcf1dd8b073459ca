//! Test backend: submits test-plan runs through the thin `TestingFarmApi`
//! boundary.

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
pub struct TestRunRequest {
    pub job_id: JobId,
    /// Test plan identifier from the project configuration
    pub plan: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestRunState {
    Queued,
    Running,
    Passed,
    /// Tests ran and failed; re-running the same plan cannot help
    Failed(String),
    /// Infrastructure error on the farm side; worth retrying
    Error(String),
    Canceled,
}

#[async_trait]
pub trait TestingFarmApi: Send + Sync {
    async fn request_run(&self, request: &TestRunRequest) -> Result<String, BackendApiError>;
    async fn run_state(&self, run_id: &str) -> Result<TestRunState, BackendApiError>;
    async fn cancel_run(&self, run_id: &str) -> Result<(), BackendApiError>;
}

pub struct TestingFarmBackend {
    api: Arc<dyn TestingFarmApi>,
}

impl TestingFarmBackend {
    pub fn new(api: Arc<dyn TestingFarmApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ExecutionBackend for TestingFarmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Test
    }

    async fn submit(&self, job: &JobDescriptor) -> Result<ExternalRef, SubmissionError> {
        let request = TestRunRequest {
            job_id: job.id,
            plan: job.target.clone(),
        };
        let run_id = self.api.request_run(&request).await.map_err(|e| match e {
            BackendApiError::Rejected(msg) => SubmissionError::permanent(BackendKind::Test, msg),
            BackendApiError::Unavailable(msg) => {
                SubmissionError::transient(BackendKind::Test, msg)
            }
            BackendApiError::NotFound => {
                SubmissionError::permanent(BackendKind::Test, "test plan not found")
            }
        })?;

        tracing::debug!(job_id = %job.id, plan = %job.target, run_id = %run_id, "Test run requested");

        Ok(ExternalRef {
            backend: BackendKind::Test,
            id: run_id,
        })
    }

    async fn poll(&self, external_ref: &ExternalRef) -> Result<PollOutcome, PollError> {
        match self.api.run_state(&external_ref.id).await {
            Ok(TestRunState::Queued) | Ok(TestRunState::Running) => Ok(PollOutcome::Running),
            Ok(TestRunState::Passed) => Ok(PollOutcome::Succeeded),
            Ok(TestRunState::Failed(reason)) => Ok(PollOutcome::Failed {
                kind: FailureKind::Permanent,
                reason: format!("tests failed: {reason}"),
            }),
            Ok(TestRunState::Error(reason)) => Ok(PollOutcome::Failed {
                kind: FailureKind::Transient,
                reason: format!("testing farm error: {reason}"),
            }),
            Ok(TestRunState::Canceled) => Ok(PollOutcome::Failed {
                kind: FailureKind::Transient,
                reason: "test run canceled externally".into(),
            }),
            Err(BackendApiError::NotFound) => Ok(PollOutcome::NotFound),
            Err(e) => Err(PollError {
                external_ref: external_ref.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn cancel(&self, external_ref: &ExternalRef) -> Result<CancelOutcome, PollError> {
        match self.api.cancel_run(&external_ref.id).await {
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

/// In-memory farm for tests and local development.
pub struct InMemoryTestingFarmApi {
    script: Vec<TestRunState>,
    inner: Mutex<InMemoryInner>,
}

#[derive(Default)]
struct InMemoryInner {
    next_id: u64,
    cursors: HashMap<String, usize>,
    submit_failures: Vec<BackendApiError>,
}

impl InMemoryTestingFarmApi {
    pub fn new() -> Self {
        Self::with_script(vec![TestRunState::Running, TestRunState::Passed])
    }

    pub fn with_script(script: Vec<TestRunState>) -> Self {
        Self {
            script,
            inner: Mutex::new(InMemoryInner::default()),
        }
    }

    pub async fn fail_next_submissions(&self, failures: Vec<BackendApiError>) {
        let mut inner = self.inner.lock().await;
        inner.submit_failures = failures;
    }
}

impl Default for InMemoryTestingFarmApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TestingFarmApi for InMemoryTestingFarmApi {
    async fn request_run(&self, _request: &TestRunRequest) -> Result<String, BackendApiError> {
        let mut inner = self.inner.lock().await;
        if !inner.submit_failures.is_empty() {
            return Err(inner.submit_failures.remove(0));
        }
        inner.next_id += 1;
        let run_id = format!("run-{}", inner.next_id);
        inner.cursors.insert(run_id.clone(), 0);
        Ok(run_id)
    }

    async fn run_state(&self, run_id: &str) -> Result<TestRunState, BackendApiError> {
        let mut inner = self.inner.lock().await;
        let cursor = inner
            .cursors
            .get_mut(run_id)
            .ok_or(BackendApiError::NotFound)?;
        let state = self
            .script
            .get(*cursor)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or(TestRunState::Passed);
        if *cursor + 1 < self.script.len() {
            *cursor += 1;
        }
        Ok(state)
    }

    async fn cancel_run(&self, run_id: &str) -> Result<(), BackendApiError> {
        let inner = self.inner.lock().await;
        if !inner.cursors.contains_key(run_id) {
            return Err(BackendApiError::NotFound);
        }
        Ok(())
    }
}
