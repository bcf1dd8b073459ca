//! Test harness for orchestration integration tests.
//!
//! Provides an in-memory service bundle with scripted backends and a
//! recording status reporter, plus polling helpers for async assertions.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use forgeci::backend::{
    BackendKind, BackendRegistry, CancelOutcome, ExecutionBackend, ExternalRef, PollError,
    PollOutcome, SubmissionError,
};
use forgeci::config::RetryConfig;
use forgeci::dispatch::Dispatcher;
use forgeci::event::{ConfigSnapshot, Event, EventKind, ProjectRef, TargetSpec};
use forgeci::queue::{work_queue, QueueReceiver, QueueSender};
use forgeci::status::{ReportError, StatusReport, StatusReporter};
use forgeci::store::{JobId, JobPhase, JobStore, MemoryStore};
use forgeci::supervisor::Supervisor;
use forgeci::worker::{WorkerContext, WorkerPool};

/// Retry policy tuned for fast tests.
pub fn test_retry_config() -> RetryConfig {
    RetryConfig {
        budget: 2,
        staleness: Duration::from_millis(300),
        scan_interval: Duration::from_millis(50),
        poll_interval: Duration::from_millis(10),
        poll_anomaly_budget: 3,
    }
}

pub fn test_project() -> ProjectRef {
    ProjectRef {
        forge: "pagure.io".to_string(),
        namespace: "rpms".to_string(),
        repo: "curl".to_string(),
    }
}

pub fn build_target(target: &str) -> TargetSpec {
    TargetSpec {
        backend: BackendKind::Build,
        target: target.to_string(),
    }
}

pub fn test_target(target: &str) -> TargetSpec {
    TargetSpec {
        backend: BackendKind::Test,
        target: target.to_string(),
    }
}

pub fn release_target(target: &str) -> TargetSpec {
    TargetSpec {
        backend: BackendKind::Release,
        target: target.to_string(),
    }
}

/// Push event with the given resolved targets.
pub fn test_event(targets: Vec<TargetSpec>) -> Event {
    Event::new(
        test_project(),
        EventKind::Push,
        "abc123def".to_string(),
        "rawhide".to_string(),
        "alice".to_string(),
        ConfigSnapshot::Resolved { targets },
    )
}

pub fn unresolved_event(reason: &str) -> Event {
    Event::new(
        test_project(),
        EventKind::Push,
        "abc123def".to_string(),
        "rawhide".to_string(),
        "alice".to_string(),
        ConfigSnapshot::Unresolved {
            reason: reason.to_string(),
        },
    )
}

/// Backend whose submit and poll answers are scripted up front.
///
/// Submissions fail transiently while `submit_failures` is positive. Each
/// poll pops the next scripted outcome; an empty script answers `Succeeded`.
pub struct ScriptedBackend {
    kind: BackendKind,
    submit_failures: Mutex<u32>,
    polls: Mutex<VecDeque<PollOutcome>>,
    submitted: Mutex<Vec<JobId>>,
    canceled: Mutex<Vec<String>>,
    counter: AtomicU64,
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            submit_failures: Mutex::new(0),
            polls: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            canceled: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        })
    }

    pub fn fail_next_submissions(&self, count: u32) {
        *self.submit_failures.lock().unwrap() = count;
    }

    pub fn script_polls(&self, outcomes: Vec<PollOutcome>) {
        self.polls.lock().unwrap().extend(outcomes);
    }

    pub fn submitted_jobs(&self) -> Vec<JobId> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn canceled_refs(&self) -> Vec<String> {
        self.canceled.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn submit(
        &self,
        job: &forgeci::store::JobDescriptor,
    ) -> Result<ExternalRef, SubmissionError> {
        {
            let mut failures = self.submit_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SubmissionError::transient(self.kind, "scripted outage"));
            }
        }
        self.submitted.lock().unwrap().push(job.id);
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(ExternalRef {
            backend: self.kind,
            id: format!("ext-{n}"),
        })
    }

    async fn poll(&self, _external_ref: &ExternalRef) -> Result<PollOutcome, PollError> {
        let next = self.polls.lock().unwrap().pop_front();
        Ok(next.unwrap_or(PollOutcome::Succeeded))
    }

    async fn cancel(&self, external_ref: &ExternalRef) -> Result<CancelOutcome, PollError> {
        self.canceled.lock().unwrap().push(external_ref.id.clone());
        Ok(CancelOutcome::Canceled)
    }
}

/// Reporter that records every report it receives.
#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(String, StatusReport)>>,
}

impl RecordingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reports(&self) -> Vec<(String, StatusReport)> {
        self.reports.lock().unwrap().clone()
    }

    pub fn last_report(&self) -> Option<StatusReport> {
        self.reports
            .lock()
            .unwrap()
            .last()
            .map(|(_, report)| report.clone())
    }
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn report(&self, commit_sha: &str, report: &StatusReport) -> Result<(), ReportError> {
        self.reports
            .lock()
            .unwrap()
            .push((commit_sha.to_string(), report.clone()));
        Ok(())
    }
}

/// The full service wired with scripted backends, minus the HTTP layer.
pub struct TestService {
    pub store: Arc<dyn JobStore>,
    pub dispatcher: Dispatcher,
    pub queue_tx: QueueSender,
    pub queue_rx: QueueReceiver,
    pub registry: Arc<BackendRegistry>,
    pub reporter: Arc<RecordingReporter>,
    pub retry: RetryConfig,
    pub build: Arc<ScriptedBackend>,
    pub test: Arc<ScriptedBackend>,
    pub release: Arc<ScriptedBackend>,
}

impl TestService {
    pub fn new() -> Self {
        Self::with_retry(test_retry_config())
    }

    pub fn with_retry(retry: RetryConfig) -> Self {
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        let (queue_tx, queue_rx) = work_queue(64);
        let build = ScriptedBackend::new(BackendKind::Build);
        let test = ScriptedBackend::new(BackendKind::Test);
        let release = ScriptedBackend::new(BackendKind::Release);
        let registry = Arc::new(
            BackendRegistry::new()
                .register(build.clone())
                .register(test.clone())
                .register(release.clone()),
        );
        let reporter = RecordingReporter::new();
        let dispatcher = Dispatcher::new(Arc::clone(&store), queue_tx.clone());
        Self {
            store,
            dispatcher,
            queue_tx,
            queue_rx,
            registry,
            reporter,
            retry,
            build,
            test,
            release,
        }
    }

    pub fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            reporter: self.reporter.clone(),
            retry: self.retry.clone(),
        }
    }

    pub fn spawn_workers(&self, count: usize, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        WorkerPool::spawn(
            count,
            self.worker_context(),
            self.queue_rx.clone(),
            token.clone(),
        )
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        Arc::new(Supervisor::new(
            Arc::clone(&self.store),
            self.queue_tx.clone(),
            Arc::clone(&self.registry),
            self.reporter.clone(),
            self.retry.clone(),
        ))
    }
}

/// Poll until the job reaches the phase or the timeout elapses.
pub async fn wait_for_phase(
    store: &dyn JobStore,
    job_id: JobId,
    phase: JobPhase,
    timeout: Duration,
) -> bool {
    wait_until(timeout, || {
        store
            .get(job_id)
            .map(|job| job.state.phase() == phase)
            .unwrap_or(false)
    })
    .await
}

/// Poll the predicate every 10 ms until it holds or the timeout elapses.
pub async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
