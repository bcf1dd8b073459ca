//! End-to-end job lifecycle tests: dispatch through worker execution to
//! the final commit status.

mod test_harness;

use std::time::Duration;

use forgeci::backend::PollOutcome;
use forgeci::status::CommitState;
use forgeci::store::{FailureKind, JobPhase, JobState};
use tokio_util::sync::CancellationToken;

use test_harness::{build_target, test_event, test_target, wait_for_phase, wait_until, TestService};

#[tokio::test]
async fn test_event_runs_to_success() {
    let service = TestService::new();
    let token = CancellationToken::new();
    let workers = service.spawn_workers(2, &token);

    let event = test_event(vec![
        build_target("fedora-rawhide-x86_64"),
        test_target("basic-plan"),
    ]);
    service.store.insert_event(event.clone()).unwrap();
    let jobs = service.dispatcher.dispatch(&event).unwrap();
    assert_eq!(jobs.len(), 2);

    for job in &jobs {
        assert!(
            wait_for_phase(
                service.store.as_ref(),
                job.id,
                JobPhase::Succeeded,
                Duration::from_secs(5),
            )
            .await,
            "job {} should reach Succeeded",
            job.id
        );
    }

    // The final report aggregates both successes.
    let report = service.reporter.last_report().unwrap();
    assert_eq!(report.state, CommitState::Succeeded);
    assert_eq!(report.jobs.len(), 2);

    // Both jobs got their external refs recorded write-once.
    for job in service.store.jobs_for_event(event.id) {
        assert!(job.external_ref.is_some());
    }

    token.cancel();
    for handle in workers {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_running_job_keeps_commit_status_pending() {
    let service = TestService::new();
    // Hold the build in Running for a few poll cycles before finishing.
    service.build.script_polls(vec![
        PollOutcome::Running,
        PollOutcome::Running,
        PollOutcome::Running,
        PollOutcome::Succeeded,
    ]);

    let token = CancellationToken::new();
    let workers = service.spawn_workers(1, &token);

    let event = test_event(vec![build_target("fedora-rawhide-x86_64")]);
    service.store.insert_event(event.clone()).unwrap();
    let jobs = service.dispatcher.dispatch(&event).unwrap();
    let job_id = jobs[0].id;

    assert!(
        wait_for_phase(
            service.store.as_ref(),
            job_id,
            JobPhase::Running,
            Duration::from_secs(5),
        )
        .await
    );

    // While the build runs, every report so far is pending.
    for (_, report) in service.reporter.reports() {
        assert_eq!(report.state, CommitState::Pending);
    }

    assert!(
        wait_for_phase(
            service.store.as_ref(),
            job_id,
            JobPhase::Succeeded,
            Duration::from_secs(5),
        )
        .await
    );
    assert_eq!(
        service.reporter.last_report().unwrap().state,
        CommitState::Succeeded
    );

    token.cancel();
    for handle in workers {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_permanent_failure_fails_commit_status() {
    let service = TestService::new();
    service.build.script_polls(vec![PollOutcome::Failed {
        kind: FailureKind::Permanent,
        reason: "build error in %prep".to_string(),
    }]);

    let token = CancellationToken::new();
    let workers = service.spawn_workers(1, &token);

    let event = test_event(vec![build_target("fedora-rawhide-x86_64")]);
    service.store.insert_event(event.clone()).unwrap();
    let jobs = service.dispatcher.dispatch(&event).unwrap();

    assert!(
        wait_for_phase(
            service.store.as_ref(),
            jobs[0].id,
            JobPhase::Failed,
            Duration::from_secs(5),
        )
        .await
    );

    let job = service.store.get(jobs[0].id).unwrap();
    assert_eq!(job.state.failure_kind(), Some(FailureKind::Permanent));

    let report = service.reporter.last_report().unwrap();
    assert_eq!(report.state, CommitState::Failed);
    assert!(report.description.contains("build error in %prep"));

    token.cancel();
    for handle in workers {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_transient_submit_failure_is_retried_by_supervisor() {
    let service = TestService::new();
    service.build.fail_next_submissions(1);

    let token = CancellationToken::new();
    let workers = service.spawn_workers(1, &token);
    let supervisor_handle = service.supervisor().spawn(token.clone());

    let event = test_event(vec![build_target("fedora-rawhide-x86_64")]);
    service.store.insert_event(event.clone()).unwrap();
    let jobs = service.dispatcher.dispatch(&event).unwrap();
    let first_id = jobs[0].id;

    // First attempt fails transiently, the supervisor appends a successor
    // that succeeds. The failed record is preserved untouched.
    let store = service.store.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            store
                .jobs_for_event(event.id)
                .iter()
                .any(|job| job.attempt == 1 && job.state == JobState::Succeeded)
        })
        .await,
        "retry attempt should succeed"
    );

    let first = service.store.get(first_id).unwrap();
    assert_eq!(first.state.failure_kind(), Some(FailureKind::Transient));
    assert_eq!(first.attempt, 0);

    assert_eq!(
        service.reporter.last_report().unwrap().state,
        CommitState::Succeeded
    );

    token.cancel();
    for handle in workers {
        handle.await.unwrap();
    }
    supervisor_handle.await.unwrap();
}

#[tokio::test]
async fn test_canceled_job_triggers_backend_cancel() {
    let service = TestService::new();
    // Keep the job running so cancellation lands mid-poll.
    service.build.script_polls(vec![PollOutcome::Running; 200]);

    let token = CancellationToken::new();
    let workers = service.spawn_workers(1, &token);

    let event = test_event(vec![build_target("fedora-rawhide-x86_64")]);
    service.store.insert_event(event.clone()).unwrap();
    let jobs = service.dispatcher.dispatch(&event).unwrap();
    let job_id = jobs[0].id;

    assert!(
        wait_for_phase(
            service.store.as_ref(),
            job_id,
            JobPhase::Running,
            Duration::from_secs(5),
        )
        .await
    );

    service
        .store
        .transition(job_id, JobPhase::Running, JobState::Canceled)
        .unwrap();

    // The poll loop notices the canceled descriptor and forwards the
    // cancellation to the external system.
    let build = service.build.clone();
    assert!(
        wait_until(Duration::from_secs(5), || !build.canceled_refs().is_empty()).await,
        "external cancel should be attempted"
    );

    token.cancel();
    for handle in workers {
        handle.await.unwrap();
    }
}
