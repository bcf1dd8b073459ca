use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendRegistry, CancelOutcome, ExecutionBackend, ExternalRef, PollOutcome};
use crate::config::RetryConfig;
use crate::queue::QueueReceiver;
use crate::status::{self, StatusReporter};
use crate::store::{JobId, JobPhase, JobState, JobStore, StoreError};

/// Everything a worker needs; passed in explicitly at spawn time, no
/// ambient singletons.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub registry: Arc<BackendRegistry>,
    pub reporter: Arc<dyn StatusReporter>,
    pub retry: RetryConfig,
}

pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `count` workers draining the shared queue until the token is
    /// cancelled or the queue closes.
    pub fn spawn(
        count: usize,
        ctx: WorkerContext,
        queue: QueueReceiver,
        token: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker_id| {
                let ctx = ctx.clone();
                let queue = queue.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    tracing::debug!(worker_id, "Worker started");
                    worker_loop(worker_id, ctx, queue, token).await;
                    tracing::debug!(worker_id, "Worker stopped");
                })
            })
            .collect()
    }
}

async fn worker_loop(
    worker_id: usize,
    ctx: WorkerContext,
    queue: QueueReceiver,
    token: CancellationToken,
) {
    loop {
        let job_id = tokio::select! {
            _ = token.cancelled() => break,
            received = queue.recv() => match received {
                Some(job_id) => job_id,
                None => break,
            },
        };
        process_job(worker_id, &ctx, &token, job_id).await;
    }
}

async fn process_job(worker_id: usize, ctx: &WorkerContext, token: &CancellationToken, job_id: JobId) {
    let Some(job) = ctx.store.get(job_id) else {
        tracing::warn!(worker_id, job_id = %job_id, "Queued job id has no descriptor");
        return;
    };

    // The queue is at-least-once; anything past Pending was already picked
    // up (or finished) by someone else.
    if job.state.phase() != JobPhase::Pending {
        tracing::debug!(
            worker_id,
            job_id = %job_id,
            phase = %job.state.phase(),
            "Skipping redelivered job"
        );
        return;
    }

    let backend = match ctx.registry.require(job.backend) {
        Ok(backend) => backend,
        Err(err) => {
            let next = job.failure_state(err.kind, err.to_string(), ctx.retry.budget);
            apply_transition(ctx, job_id, JobPhase::Pending, next).await;
            return;
        }
    };

    // Claim before touching the backend so a racing worker backs off
    // instead of double-submitting.
    match ctx.store.transition(job_id, JobPhase::Pending, JobState::Submitted) {
        Ok(_) => {}
        Err(StoreError::StateConflict { .. }) | Err(StoreError::TerminalState { .. }) => {
            tracing::debug!(worker_id, job_id = %job_id, "Lost submission claim");
            return;
        }
        Err(e) => {
            tracing::warn!(worker_id, job_id = %job_id, error = %e, "Claim failed");
            return;
        }
    }
    status::publish(ctx.store.as_ref(), ctx.reporter.as_ref(), job.event_id).await;

    match backend.submit(&job).await {
        Ok(external_ref) => {
            if let Err(e) = ctx.store.set_external_ref(job_id, external_ref.clone()) {
                tracing::warn!(job_id = %job_id, error = %e, "Could not record external ref");
            }
            tracing::info!(
                worker_id,
                job_id = %job_id,
                external_ref = %external_ref,
                "Job submitted"
            );
            poll_until_terminal(ctx, token, job_id, backend, external_ref).await;
        }
        Err(err) => {
            tracing::warn!(worker_id, job_id = %job_id, error = %err, "Submission failed");
            let next = job.failure_state(err.kind, err.to_string(), ctx.retry.budget);
            apply_transition(ctx, job_id, JobPhase::Submitted, next).await;
        }
    }
}

async fn poll_until_terminal(
    ctx: &WorkerContext,
    token: &CancellationToken,
    job_id: JobId,
    backend: Arc<dyn ExecutionBackend>,
    external_ref: ExternalRef,
) {
    let mut anomalies = 0u32;
    let mut backoff = ctx.retry.poll_interval;

    loop {
        tokio::select! {
            // Shutdown leaves the job in place; the staleness scan re-drives
            // it after restart.
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }

        let Some(current) = ctx.store.get(job_id) else {
            return;
        };
        match current.state.phase() {
            JobPhase::Canceled => {
                // Cooperative cancellation: someone recorded the intent,
                // the poll cycle honors it best-effort.
                match backend.cancel(&external_ref).await {
                    Ok(CancelOutcome::Canceled) => {
                        tracing::info!(job_id = %job_id, external_ref = %external_ref, "External job canceled");
                    }
                    Ok(CancelOutcome::NotCancelable) => {
                        tracing::debug!(job_id = %job_id, "Backend cannot cancel submitted job");
                    }
                    Err(e) => {
                        tracing::debug!(job_id = %job_id, error = %e, "Best-effort cancel failed");
                    }
                }
                return;
            }
            phase if phase.is_terminal() => return,
            _ => {}
        }

        match backend.poll(&external_ref).await {
            Ok(PollOutcome::Running) => {
                if current.state.phase() == JobPhase::Submitted {
                    apply_transition(ctx, job_id, JobPhase::Submitted, JobState::Running).await;
                }
                anomalies = 0;
                backoff = ctx.retry.poll_interval;
            }
            Ok(PollOutcome::Succeeded) => {
                apply_transition(ctx, job_id, current.state.phase(), JobState::Succeeded).await;
                return;
            }
            Ok(PollOutcome::Failed { kind, reason }) => {
                let next = current.failure_state(kind, reason, ctx.retry.budget);
                apply_transition(ctx, job_id, current.state.phase(), next).await;
                return;
            }
            Ok(PollOutcome::NotFound) | Err(_) => {
                // NotFound right after submission usually means the external
                // record is not visible yet; both cases retry the poll, not
                // the job.
                anomalies += 1;
                if anomalies > ctx.retry.poll_anomaly_budget {
                    tracing::warn!(
                        job_id = %job_id,
                        external_ref = %external_ref,
                        anomalies,
                        "Poll anomaly budget exhausted, leaving job to staleness scan"
                    );
                    return;
                }
                backoff = (backoff * 2).min(ctx.retry.poll_interval * 16);
            }
        }
    }
}

/// Apply one CAS transition and report the event's new aggregate status.
/// Losing the CAS is normal under concurrency and only logged.
async fn apply_transition(ctx: &WorkerContext, job_id: JobId, expected: JobPhase, next: JobState) {
    match ctx.store.transition(job_id, expected, next) {
        Ok(updated) => {
            tracing::info!(
                job_id = %job_id,
                phase = %updated.state.phase(),
                "Job transitioned"
            );
            status::publish(ctx.store.as_ref(), ctx.reporter.as_ref(), updated.event_id).await;
        }
        Err(StoreError::StateConflict { .. }) | Err(StoreError::TerminalState { .. }) => {
            tracing::debug!(job_id = %job_id, "Transition superseded");
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "Transition failed");
        }
    }
}
