use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use rstest::*;
use uuid::Uuid;

use forge_inbox_api::{
    forge_inbox::ForgeInboxError,
    jobs::{encode_payload, Job, JobKind, JobStatus, PollJob},
    repository::job::{JobRepository, NewJob},
    scheduler::{JobHandler, JobRegistry, Scheduler},
};

use crate::helpers::{test_scheduler_config, tested_app, TestedApp};

async fn enqueue(app: &TestedApp, dedup_key: Option<&str>) -> Option<Job> {
    let repository = &app.services.repository;
    let mut transaction = repository.begin().await.unwrap();
    let job = repository
        .enqueue_job(
            &mut transaction,
            NewJob {
                kind: JobKind::Poll,
                payload: encode_payload(&PollJob {
                    user_id: app.user_id,
                })
                .unwrap(),
                dedup_key: dedup_key.map(str::to_string),
                run_at: Utc::now(),
                max_attempts: 5,
            },
        )
        .await
        .unwrap();
    transaction.commit().await.unwrap();
    job
}

async fn claim(app: &TestedApp, lease_token: &str, lease_secs: i64) -> Option<Job> {
    let repository = &app.services.repository;
    let now = Utc::now();
    let mut transaction = repository.begin().await.unwrap();
    let job = repository
        .claim_due_job(
            &mut transaction,
            lease_token,
            now + Duration::seconds(lease_secs),
            now,
        )
        .await
        .unwrap();
    transaction.commit().await.unwrap();
    job
}

mod queue {
    use super::*;
    use pretty_assertions::assert_eq;

    #[rstest]
    #[tokio::test]
    async fn test_claim_sets_lease_and_counts_the_attempt(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let enqueued = enqueue(&app, None).await.expect("job should be enqueued");
        assert_eq!(enqueued.status, JobStatus::Pending);
        assert_eq!(enqueued.attempts, 0);

        let claimed = claim(&app, "token-1", 60).await.expect("job should be claimable");
        assert_eq!(claimed.id, enqueued.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.lease_token.as_deref(), Some("token-1"));

        // The queue is now empty: the same job cannot be claimed twice.
        assert!(claim(&app, "token-2", 60).await.is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn test_dedup_key_collapses_pending_jobs(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        assert!(enqueue(&app, Some("poll")).await.is_some());
        assert!(enqueue(&app, Some("poll")).await.is_none());

        // Once the first job finished, the key is free again.
        let claimed = claim(&app, "token-1", 60).await.unwrap();
        let repository = &app.services.repository;
        let mut transaction = repository.begin().await.unwrap();
        repository
            .complete_job(&mut transaction, claimed.id, "token-1")
            .await
            .unwrap();
        transaction.commit().await.unwrap();

        assert!(enqueue(&app, Some("poll")).await.is_some());
    }

    #[rstest]
    #[tokio::test]
    async fn test_future_run_at_is_not_due(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let repository = &app.services.repository;
        let mut transaction = repository.begin().await.unwrap();
        repository
            .enqueue_job(
                &mut transaction,
                NewJob {
                    kind: JobKind::Poll,
                    payload: encode_payload(&PollJob {
                        user_id: app.user_id,
                    })
                    .unwrap(),
                    dedup_key: None,
                    run_at: Utc::now() + Duration::hours(1),
                    max_attempts: 5,
                },
            )
            .await
            .unwrap();
        transaction.commit().await.unwrap();

        assert!(claim(&app, "token-1", 60).await.is_none());
    }

    /// Scenario: worker claims, crashes without heartbeating, the janitor
    /// returns the job to the queue and the next claim counts attempt two.
    #[rstest]
    #[tokio::test]
    async fn test_expired_lease_is_recovered(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        enqueue(&app, None).await.unwrap();

        let claimed = claim(&app, "crashed-worker", 1).await.unwrap();
        assert_eq!(claimed.attempts, 1);

        // Lease expires; the sweep runs afterwards.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let repository = &app.services.repository;
        let mut transaction = repository.begin().await.unwrap();
        let swept = repository
            .sweep_expired_leases(&mut transaction, Utc::now())
            .await
            .unwrap();
        transaction.commit().await.unwrap();
        assert_eq!(swept, 1);

        let reclaimed = claim(&app, "healthy-worker", 60).await.unwrap();
        assert_eq!(reclaimed.id, claimed.id);
        assert_eq!(reclaimed.attempts, 2);
        assert_eq!(reclaimed.last_error.as_deref(), Some("lease expired"));
    }

    #[rstest]
    #[tokio::test]
    async fn test_completion_requires_the_lease(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        enqueue(&app, None).await.unwrap();
        let claimed = claim(&app, "token-1", 60).await.unwrap();

        let repository = &app.services.repository;
        let mut transaction = repository.begin().await.unwrap();
        // A stale worker with an old token cannot complete the job.
        assert!(!repository
            .complete_job(&mut transaction, claimed.id, "stale-token")
            .await
            .unwrap());
        assert!(repository
            .complete_job(&mut transaction, claimed.id, "token-1")
            .await
            .unwrap());
        transaction.commit().await.unwrap();
    }

    #[rstest]
    #[tokio::test]
    async fn test_failed_job_retries_then_dies(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let repository = &app.services.repository;
        let mut transaction = repository.begin().await.unwrap();
        repository
            .enqueue_job(
                &mut transaction,
                NewJob {
                    kind: JobKind::Poll,
                    payload: encode_payload(&PollJob {
                        user_id: app.user_id,
                    })
                    .unwrap(),
                    dedup_key: None,
                    run_at: Utc::now(),
                    max_attempts: 2,
                },
            )
            .await
            .unwrap();
        transaction.commit().await.unwrap();

        // First attempt fails retryably.
        let claimed = claim(&app, "token-1", 60).await.unwrap();
        let mut transaction = repository.begin().await.unwrap();
        repository
            .fail_job(
                &mut transaction,
                claimed.id,
                "token-1",
                "rate limited",
                Some(Utc::now()),
            )
            .await
            .unwrap();
        transaction.commit().await.unwrap();

        let retried = claim(&app, "token-2", 60).await.unwrap();
        assert_eq!(retried.attempts, 2);
        assert_eq!(retried.last_error.as_deref(), Some("rate limited"));

        // Attempts are exhausted now.
        let mut transaction = repository.begin().await.unwrap();
        repository
            .fail_job(&mut transaction, retried.id, "token-2", "rate limited", None)
            .await
            .unwrap();
        transaction.commit().await.unwrap();

        assert!(claim(&app, "token-3", 60).await.is_none());
        let mut transaction = repository.begin().await.unwrap();
        let job = repository
            .get_job(&mut transaction, retried.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Dead);
    }
}

mod workers {
    use super::*;
    use pretty_assertions::assert_eq;

    struct CountingHandler {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn run(&self, _job: &Job) -> Result<(), ForgeInboxError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[rstest]
    #[tokio::test]
    async fn test_workers_drain_the_queue(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = JobRegistry::new();
        registry.register(
            JobKind::SubjectRefresh,
            Arc::new(CountingHandler { runs: runs.clone() }),
        );

        let repository = &app.services.repository;
        let mut transaction = repository.begin().await.unwrap();
        for _ in 0..5 {
            repository
                .enqueue_job(
                    &mut transaction,
                    NewJob {
                        kind: JobKind::SubjectRefresh,
                        payload: encode_payload(&forge_inbox_api::jobs::SubjectRefreshJob {
                            user_id: app.user_id,
                            notification_id: forge_inbox::NotificationId(1),
                        })
                        .unwrap(),
                        dedup_key: Some(Uuid::new_v4().to_string()),
                        run_at: Utc::now(),
                        max_attempts: 5,
                    },
                )
                .await
                .unwrap();
        }
        transaction.commit().await.unwrap();

        let scheduler = Scheduler::new(
            app.services.repository.clone(),
            registry,
            test_scheduler_config(),
        );
        let handle = scheduler.start();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 5 && std::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        handle.shutdown().await;

        assert_eq!(runs.load(Ordering::SeqCst), 5);
        let statuses = crate::helpers::job_statuses(&app).await;
        assert!(statuses
            .values()
            .filter(|status| **status == JobStatus::Succeeded)
            .count() >= 5);
    }

    #[rstest]
    #[tokio::test]
    async fn test_missing_handler_kills_the_job(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let job = enqueue(&app, None).await.unwrap();

        // A registry without a poll handler.
        let scheduler = Scheduler::new(
            app.services.repository.clone(),
            JobRegistry::new(),
            test_scheduler_config(),
        );
        let handle = scheduler.start();

        let repository = &app.services.repository;
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let mut transaction = repository.begin().await.unwrap();
            let current = repository
                .get_job(&mut transaction, job.id)
                .await
                .unwrap()
                .unwrap();
            if current.status == JobStatus::Dead || std::time::Instant::now() > deadline {
                assert_eq!(current.status, JobStatus::Dead);
                assert!(current
                    .last_error
                    .as_deref()
                    .unwrap_or_default()
                    .contains("No handler registered"));
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        handle.shutdown().await;
    }
}
