use std::sync::Arc;

use crate::error::{ForgeciError, Result};
use crate::event::Event;
use crate::queue::QueueSender;
use crate::store::{JobDescriptor, JobKey, JobStore};

/// Maps one inbound event to its set of job descriptors and enqueues them.
///
/// Dispatch never blocks on backend completion: descriptors are persisted
/// `Pending` and handed to the queue, nothing more.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    queue: QueueSender,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, queue: QueueSender) -> Self {
        Self { store, queue }
    }

    /// Create one `Pending` descriptor per configured target.
    ///
    /// Idempotent per (event, backend, target): a key that already has a
    /// non-terminal descriptor (duplicate webhook delivery) is skipped and
    /// the existing descriptor returned. An unresolved configuration
    /// aborts before anything is created.
    pub fn dispatch(&self, event: &Event) -> Result<Vec<JobDescriptor>> {
        let targets = event
            .config
            .targets()
            .map_err(|reason| ForgeciError::Configuration { reason })?;

        let history = self.store.jobs_for_event(event.id);
        let mut dispatched = Vec::with_capacity(targets.len());

        for target in targets {
            let key = JobKey {
                event_id: event.id,
                backend: target.backend,
                target: target.target.clone(),
            };
            if let Some(existing) = self.store.active_job_for_key(&key) {
                tracing::debug!(
                    event_id = %event.id,
                    job_id = %existing.id,
                    backend = %key.backend,
                    target = %key.target,
                    "Active descriptor exists, skipping duplicate dispatch"
                );
                dispatched.push(existing);
                continue;
            }

            let attempt = history
                .iter()
                .filter(|job| job.key() == key)
                .map(|job| job.attempt + 1)
                .max()
                .unwrap_or(0);
            let descriptor =
                JobDescriptor::new(event.id, target.backend, target.target.clone(), attempt);
            self.store.insert(descriptor.clone())?;
            self.queue.enqueue(descriptor.id)?;
            tracing::info!(
                event_id = %event.id,
                job_id = %descriptor.id,
                backend = %descriptor.backend,
                target = %descriptor.target,
                attempt = descriptor.attempt,
                "Job dispatched"
            );
            dispatched.push(descriptor);
        }

        Ok(dispatched)
    }
}
