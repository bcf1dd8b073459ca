//! Retry and recovery: re-drives failed or stuck jobs and implements
//! manual re-runs.
//!
//! Retries never mutate history. Every re-drive appends a successor
//! descriptor with the next attempt index and the failed one stays in the
//! store as the audit trail. The retry budget is enforced at the single
//! transition path (`JobDescriptor::failure_state`), so chains are bounded
//! and always end in a permanent failure once the budget is spent.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::BackendRegistry;
use crate::config::RetryConfig;
use crate::error::{ForgeciError, Result};
use crate::event::EventId;
use crate::queue::QueueSender;
use crate::status::{self, StatusReporter};
use crate::store::{FailureKind, JobDescriptor, JobPhase, JobStore, StoreError};

pub struct Supervisor {
    store: Arc<dyn JobStore>,
    queue: QueueSender,
    registry: Arc<BackendRegistry>,
    reporter: Arc<dyn StatusReporter>,
    retry: RetryConfig,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: QueueSender,
        registry: Arc<BackendRegistry>,
        reporter: Arc<dyn StatusReporter>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            reporter,
            retry,
        }
    }

    /// Run the periodic scan until the token is cancelled.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.retry.scan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => self.scan().await,
                }
            }
            tracing::debug!("Supervisor stopped");
        })
    }

    /// One pass: fail stuck jobs transiently, then create retry
    /// descriptors for unsuperseded transient failures.
    pub async fn scan(&self) {
        self.redrive_stale().await;
        self.retry_failed().await;
    }

    async fn redrive_stale(&self) {
        let staleness = chrono::Duration::from_std(self.retry.staleness)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let cutoff = Utc::now() - staleness;

        for job in self.store.stale_jobs(cutoff) {
            let phase = job.state.phase();
            if phase == JobPhase::Pending {
                // Queue delivery was lost (crash, full queue); hand it back
                // to the workers untouched.
                tracing::info!(job_id = %job.id, "Re-enqueueing stale pending job");
                if let Err(e) = self.queue.enqueue(job.id) {
                    tracing::warn!(job_id = %job.id, error = %e, "Re-enqueue failed");
                }
                continue;
            }

            tracing::warn!(
                job_id = %job.id,
                phase = %phase,
                updated_at = %job.updated_at,
                "Job is stuck, re-driving"
            );
            self.cancel_external(&job).await;
            let next = job.failure_state(
                FailureKind::Transient,
                format!("no progress in phase {phase} past staleness threshold"),
                self.retry.budget,
            );
            match self.store.transition(job.id, phase, next) {
                Ok(updated) => {
                    status::publish(
                        self.store.as_ref(),
                        self.reporter.as_ref(),
                        updated.event_id,
                    )
                    .await;
                }
                Err(StoreError::StateConflict { .. }) | Err(StoreError::TerminalState { .. }) => {}
                Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Stale transition failed"),
            }
        }
    }

    async fn retry_failed(&self) {
        for failed in self.store.retryable_jobs() {
            if failed.attempt >= self.retry.budget {
                // Normally finalized permanent at write time; never retry
                // past the budget regardless.
                continue;
            }
            let successor = JobDescriptor::new(
                failed.event_id,
                failed.backend,
                failed.target.clone(),
                failed.attempt + 1,
            );
            if let Err(e) = self.store.insert(successor.clone()) {
                tracing::warn!(job_id = %failed.id, error = %e, "Retry insert failed");
                continue;
            }
            if let Err(e) = self.queue.enqueue(successor.id) {
                tracing::warn!(job_id = %successor.id, error = %e, "Retry enqueue failed");
                continue;
            }
            tracing::info!(
                job_id = %successor.id,
                predecessor = %failed.id,
                backend = %successor.backend,
                target = %successor.target,
                attempt = successor.attempt,
                "Retry dispatched"
            );
            status::publish(self.store.as_ref(), self.reporter.as_ref(), failed.event_id).await;
        }
    }

    /// Manual re-run: cancel whatever is still active, then create fresh
    /// descriptors for every configured target. History stays untouched.
    pub async fn rerun(&self, event_id: EventId) -> Result<Vec<JobDescriptor>> {
        let event = self
            .store
            .get_event(event_id)
            .ok_or(ForgeciError::EventNotFound(event_id))?;
        let targets = event
            .config
            .targets()
            .map_err(|reason| ForgeciError::Configuration { reason })?;

        for job in self.store.jobs_for_event(event_id) {
            let phase = job.state.phase();
            if phase.is_terminal() {
                continue;
            }
            match self.store.transition(job.id, phase, crate::store::JobState::Canceled) {
                Ok(_) => {
                    tracing::info!(job_id = %job.id, "Canceled superseded job");
                    self.cancel_external(&job).await;
                }
                Err(StoreError::StateConflict { .. }) | Err(StoreError::TerminalState { .. }) => {}
                Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Cancel failed"),
            }
        }

        let history = self.store.jobs_for_event(event_id);
        let mut created = Vec::with_capacity(targets.len());
        for target in targets {
            let attempt = history
                .iter()
                .filter(|job| job.backend == target.backend && job.target == target.target)
                .map(|job| job.attempt + 1)
                .max()
                .unwrap_or(0);
            let descriptor =
                JobDescriptor::new(event_id, target.backend, target.target.clone(), attempt);
            self.store.insert(descriptor.clone())?;
            self.queue.enqueue(descriptor.id)?;
            tracing::info!(
                event_id = %event_id,
                job_id = %descriptor.id,
                backend = %descriptor.backend,
                target = %descriptor.target,
                attempt = descriptor.attempt,
                "Re-run job dispatched"
            );
            created.push(descriptor);
        }

        status::publish(self.store.as_ref(), self.reporter.as_ref(), event_id).await;
        Ok(created)
    }

    /// Best-effort external cancellation; failures are logged and never
    /// escalated.
    async fn cancel_external(&self, job: &JobDescriptor) {
        let Some(external_ref) = &job.external_ref else {
            return;
        };
        let Ok(backend) = self.registry.require(job.backend) else {
            return;
        };
        match backend.cancel(external_ref).await {
            Ok(outcome) => {
                tracing::debug!(job_id = %job.id, ?outcome, "External cancel attempted");
            }
            Err(e) => {
                tracing::debug!(job_id = %job.id, error = %e, "External cancel failed");
            }
        }
    }
}
