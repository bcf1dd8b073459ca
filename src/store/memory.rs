use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::backend::ExternalRef;
use crate::event::{Event, EventId};

use super::{JobDescriptor, JobId, JobKey, JobPhase, JobState, JobStore, StoreError};

/// In-memory `JobStore` used by the service and the test suites.
///
/// Terminal descriptors are retained indefinitely: they are the audit
/// trail manual re-runs and retries append to.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    events: HashMap<EventId, Event>,
    jobs: HashMap<JobId, JobDescriptor>,
    /// Insertion order, so history queries stay chronologically stable
    /// even within one timestamp tick
    order: Vec<JobId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl JobStore for MemoryStore {
    fn insert_event(&self, event: Event) -> Result<(), StoreError> {
        let mut inner = self.write();
        if inner.events.contains_key(&event.id) {
            return Err(StoreError::DuplicateEvent(event.id));
        }
        inner.events.insert(event.id, event);
        Ok(())
    }

    fn get_event(&self, event_id: EventId) -> Option<Event> {
        self.read().events.get(&event_id).cloned()
    }

    fn insert(&self, descriptor: JobDescriptor) -> Result<(), StoreError> {
        let mut inner = self.write();
        if inner.jobs.contains_key(&descriptor.id) {
            return Err(StoreError::DuplicateJob(descriptor.id));
        }
        inner.order.push(descriptor.id);
        inner.jobs.insert(descriptor.id, descriptor);
        Ok(())
    }

    fn get(&self, job_id: JobId) -> Option<JobDescriptor> {
        self.read().jobs.get(&job_id).cloned()
    }

    fn transition(
        &self,
        job_id: JobId,
        expected: JobPhase,
        next: JobState,
    ) -> Result<JobDescriptor, StoreError> {
        let mut inner = self.write();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;

        let current = job.state.phase();
        if current.is_terminal() {
            return Err(StoreError::TerminalState {
                job_id,
                phase: current,
            });
        }
        if current != expected {
            return Err(StoreError::StateConflict {
                job_id,
                expected,
                actual: current,
            });
        }

        if let JobState::Failed { reason, .. } = &next {
            job.last_error = Some(reason.clone());
        }
        job.state = next;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    fn set_external_ref(
        &self,
        job_id: JobId,
        external_ref: ExternalRef,
    ) -> Result<(), StoreError> {
        let mut inner = self.write();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        if job.external_ref.is_some() {
            return Err(StoreError::ExternalRefAlreadySet(job_id));
        }
        job.external_ref = Some(external_ref);
        job.updated_at = Utc::now();
        Ok(())
    }

    fn jobs_for_event(&self, event_id: EventId) -> Vec<JobDescriptor> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| job.event_id == event_id)
            .cloned()
            .collect()
    }

    fn active_job_for_key(&self, key: &JobKey) -> Option<JobDescriptor> {
        let inner = self.read();
        inner
            .jobs
            .values()
            .find(|job| !job.state.is_terminal() && &job.key() == key)
            .cloned()
    }

    fn latest_attempts(&self, event_id: EventId) -> Vec<JobDescriptor> {
        let inner = self.read();
        let mut latest: HashMap<JobKey, JobDescriptor> = HashMap::new();
        for id in &inner.order {
            let Some(job) = inner.jobs.get(id) else {
                continue;
            };
            if job.event_id != event_id {
                continue;
            }
            match latest.get(&job.key()) {
                Some(existing) if existing.attempt >= job.attempt => {}
                _ => {
                    latest.insert(job.key(), job.clone());
                }
            }
        }
        let mut jobs: Vec<JobDescriptor> = latest.into_values().collect();
        jobs.sort_by(|a, b| (a.backend, &a.target).cmp(&(b.backend, &b.target)));
        jobs
    }

    fn stale_jobs(&self, cutoff: DateTime<Utc>) -> Vec<JobDescriptor> {
        let inner = self.read();
        inner
            .jobs
            .values()
            .filter(|job| !job.state.is_terminal() && job.updated_at < cutoff)
            .cloned()
            .collect()
    }

    fn retryable_jobs(&self) -> Vec<JobDescriptor> {
        let inner = self.read();
        let mut events: Vec<EventId> = inner
            .jobs
            .values()
            .map(|job| job.event_id)
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        events.sort_by_key(|id| id.0);
        drop(inner);

        let mut retryable = Vec::new();
        for event_id in events {
            for job in self.latest_attempts(event_id) {
                if matches!(
                    &job.state,
                    JobState::Failed {
                        kind: super::FailureKind::Transient,
                        ..
                    }
                ) {
                    retryable.push(job);
                }
            }
        }
        retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::store::FailureKind;

    fn descriptor(event_id: EventId, target: &str, attempt: u32) -> JobDescriptor {
        JobDescriptor::new(event_id, BackendKind::Build, target.to_string(), attempt)
    }

    #[test]
    fn insert_and_get() {
        let store = MemoryStore::new();
        let job = descriptor(EventId::new(), "fedora-41-x86_64", 0);
        let id = job.id;
        store.insert(job).unwrap();
        assert_eq!(store.get(id).unwrap().target, "fedora-41-x86_64");
    }

    #[test]
    fn duplicate_insert_rejected() {
        let store = MemoryStore::new();
        let job = descriptor(EventId::new(), "fedora-41-x86_64", 0);
        store.insert(job.clone()).unwrap();
        assert!(matches!(
            store.insert(job),
            Err(StoreError::DuplicateJob(_))
        ));
    }

    #[test]
    fn transition_cas_happy_path() {
        let store = MemoryStore::new();
        let job = descriptor(EventId::new(), "fedora-41-x86_64", 0);
        let id = job.id;
        store.insert(job).unwrap();

        let updated = store
            .transition(id, JobPhase::Pending, JobState::Submitted)
            .unwrap();
        assert_eq!(updated.state.phase(), JobPhase::Submitted);
    }

    #[test]
    fn transition_conflict_on_wrong_expected_phase() {
        let store = MemoryStore::new();
        let job = descriptor(EventId::new(), "fedora-41-x86_64", 0);
        let id = job.id;
        store.insert(job).unwrap();

        let err = store
            .transition(id, JobPhase::Running, JobState::Succeeded)
            .unwrap_err();
        assert!(matches!(err, StoreError::StateConflict { .. }));
        // Loser must not have moved anything.
        assert_eq!(store.get(id).unwrap().state, JobState::Pending);
    }

    #[test]
    fn no_transition_leaves_terminal_state() {
        let store = MemoryStore::new();
        let job = descriptor(EventId::new(), "fedora-41-x86_64", 0);
        let id = job.id;
        store.insert(job).unwrap();
        store
            .transition(id, JobPhase::Pending, JobState::Canceled)
            .unwrap();

        for next in [
            JobState::Pending,
            JobState::Submitted,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed {
                kind: FailureKind::Permanent,
                reason: "x".into(),
            },
            JobState::Canceled,
        ] {
            let err = store
                .transition(id, JobPhase::Canceled, next)
                .unwrap_err();
            assert!(matches!(err, StoreError::TerminalState { .. }));
        }
    }

    #[test]
    fn failed_transition_records_last_error() {
        let store = MemoryStore::new();
        let job = descriptor(EventId::new(), "fedora-41-x86_64", 0);
        let id = job.id;
        store.insert(job).unwrap();
        store
            .transition(
                id,
                JobPhase::Pending,
                JobState::Failed {
                    kind: FailureKind::Transient,
                    reason: "copr outage".into(),
                },
            )
            .unwrap();
        assert_eq!(store.get(id).unwrap().last_error.as_deref(), Some("copr outage"));
    }

    #[test]
    fn external_ref_is_write_once() {
        let store = MemoryStore::new();
        let job = descriptor(EventId::new(), "fedora-41-x86_64", 0);
        let id = job.id;
        store.insert(job).unwrap();

        let external_ref = ExternalRef {
            backend: BackendKind::Build,
            id: "1".into(),
        };
        store.set_external_ref(id, external_ref.clone()).unwrap();
        assert!(matches!(
            store.set_external_ref(id, external_ref),
            Err(StoreError::ExternalRefAlreadySet(_))
        ));
    }

    #[test]
    fn active_job_for_key_ignores_terminal() {
        let store = MemoryStore::new();
        let event_id = EventId::new();
        let first = descriptor(event_id, "fedora-41-x86_64", 0);
        let key = first.key();
        let first_id = first.id;
        store.insert(first).unwrap();

        assert_eq!(store.active_job_for_key(&key).unwrap().id, first_id);

        store
            .transition(first_id, JobPhase::Pending, JobState::Canceled)
            .unwrap();
        assert!(store.active_job_for_key(&key).is_none());
    }

    #[test]
    fn latest_attempts_picks_highest_attempt_per_key() {
        let store = MemoryStore::new();
        let event_id = EventId::new();
        let first = descriptor(event_id, "fedora-41-x86_64", 0);
        let first_id = first.id;
        store.insert(first).unwrap();
        store
            .transition(
                first_id,
                JobPhase::Pending,
                JobState::Failed {
                    kind: FailureKind::Transient,
                    reason: "outage".into(),
                },
            )
            .unwrap();
        let retry = descriptor(event_id, "fedora-41-x86_64", 1);
        let retry_id = retry.id;
        store.insert(retry).unwrap();

        let latest = store.latest_attempts(event_id);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, retry_id);
        // History keeps both.
        assert_eq!(store.jobs_for_event(event_id).len(), 2);
    }

    #[test]
    fn retryable_excludes_superseded_failures() {
        let store = MemoryStore::new();
        let event_id = EventId::new();
        let first = descriptor(event_id, "fedora-41-x86_64", 0);
        let first_id = first.id;
        store.insert(first).unwrap();
        store
            .transition(
                first_id,
                JobPhase::Pending,
                JobState::Failed {
                    kind: FailureKind::Transient,
                    reason: "outage".into(),
                },
            )
            .unwrap();

        assert_eq!(store.retryable_jobs().len(), 1);

        let retry = descriptor(event_id, "fedora-41-x86_64", 1);
        store.insert(retry).unwrap();
        assert!(store.retryable_jobs().is_empty());
    }

    #[test]
    fn stale_jobs_filters_by_phase_and_cutoff() {
        let store = MemoryStore::new();
        let job = descriptor(EventId::new(), "fedora-41-x86_64", 0);
        let id = job.id;
        store.insert(job).unwrap();
        store
            .transition(id, JobPhase::Pending, JobState::Submitted)
            .unwrap();

        let future = Utc::now() + chrono::Duration::seconds(10);
        assert_eq!(store.stale_jobs(future).len(), 1);
        let past = Utc::now() - chrono::Duration::seconds(10);
        assert!(store.stale_jobs(past).is_empty());
    }
}
