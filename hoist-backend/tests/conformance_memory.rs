//! Backend contract conformance, exercised against the in-memory
//! implementation. The Redis backends satisfy the same contract through the
//! same trait; these tests pin the semantics every implementation must hold.

use std::time::Duration;

use hoist_backend::{
    AckOutcome, JobSource, MemoryBackend, MoveTarget, NackDisposition, QueueScope,
    ReserveRequest, StorageBackend,
};
use hoist_core::{
    EnqueueOptions, Job, JobState, Priority, QueueError, ReservationToken, TenantId, WorkerId,
};

fn scope() -> QueueScope {
    QueueScope::new(TenantId::new("conformance").unwrap(), "work")
}

fn job_with(opts: EnqueueOptions) -> Job {
    Job::new(
        TenantId::new("conformance").unwrap(),
        "work",
        b"x".to_vec(),
        opts,
    )
}

fn reserve_as(worker: &str) -> ReserveRequest {
    ReserveRequest {
        worker_id: WorkerId::from(worker),
        visibility_timeout: Duration::from_secs(30),
    }
}

/// Enqueue, reserve, ack: queue and reserved set end empty.
#[tokio::test]
async fn enqueue_reserve_ack_round_trip() {
    let backend = MemoryBackend::new();
    let job = job_with(EnqueueOptions::new());
    let id = job.id.clone();
    backend.enqueue(&job).await.unwrap();

    let reserved = backend.reserve(&scope(), &reserve_as("w1")).await.unwrap().unwrap();
    assert_eq!(reserved.job.id, id);
    assert!(reserved.deadline > chrono::Utc::now());

    assert_eq!(
        backend.ack(&scope(), &id, &reserved.token).await.unwrap(),
        AckOutcome::Acked
    );

    let counts = backend.counts(&scope()).await.unwrap();
    assert_eq!(counts.pending.total(), 0);
    assert_eq!(counts.reserved, 0);
}

/// A reservation is exclusive: the second reserve call gets nothing.
#[tokio::test]
async fn single_reservation_invariant() {
    let backend = MemoryBackend::new();
    backend.enqueue(&job_with(EnqueueOptions::new())).await.unwrap();

    let first = backend.reserve(&scope(), &reserve_as("w1")).await.unwrap();
    assert!(first.is_some());
    let second = backend.reserve(&scope(), &reserve_as("w2")).await.unwrap();
    assert!(second.is_none());
}

/// Only the current fencing token may ack; a reclaimed job rejects the
/// stale holder.
#[tokio::test]
async fn fencing_token_blocks_stale_worker() {
    let backend = MemoryBackend::new();
    let job = job_with(EnqueueOptions::new());
    let id = job.id.clone();
    backend.enqueue(&job).await.unwrap();

    let stale = backend.reserve(&scope(), &reserve_as("w1")).await.unwrap().unwrap();
    backend.force_expire(&scope(), &id);
    backend.reclaim_expired(&scope(), 16).await.unwrap();

    let fresh = backend.reserve(&scope(), &reserve_as("w2")).await.unwrap().unwrap();
    assert_ne!(stale.token, fresh.token);

    // The late-arriving original worker cannot mutate the job
    let result = backend.ack(&scope(), &id, &stale.token).await;
    assert!(matches!(result, Err(QueueError::InvalidReservation)));

    // The current holder can
    assert_eq!(
        backend.ack(&scope(), &id, &fresh.token).await.unwrap(),
        AckOutcome::Acked
    );
}

/// Visibility expiry re-delivers with the failure counted.
#[tokio::test]
async fn visibility_expiry_redelivers() {
    let backend = MemoryBackend::new();
    let job = job_with(EnqueueOptions::new());
    let id = job.id.clone();
    backend.enqueue(&job).await.unwrap();

    backend.reserve(&scope(), &reserve_as("w1")).await.unwrap().unwrap();
    backend.force_expire(&scope(), &id);
    assert_eq!(backend.reclaim_expired(&scope(), 16).await.unwrap(), 1);

    let redelivered = backend.reserve(&scope(), &reserve_as("w2")).await.unwrap().unwrap();
    assert_eq!(redelivered.job.id, id);
    assert_eq!(redelivered.job.attempts, 1);
}

/// Bounded retries: max_attempts nacks dead-letter the job, and no further
/// delivery happens.
#[tokio::test]
async fn bounded_retries_end_in_dlq() {
    let backend = MemoryBackend::new();
    let job = job_with(EnqueueOptions::new().with_max_attempts(3));
    let id = job.id.clone();
    backend.enqueue(&job).await.unwrap();

    for _ in 0..3 {
        let reserved = backend.reserve(&scope(), &reserve_as("w1")).await.unwrap().unwrap();
        backend
            .nack(
                &scope(),
                &id,
                &reserved.token,
                NackDisposition::Retry {
                    retry_at: chrono::Utc::now() - chrono::Duration::seconds(1),
                    error: "transient".to_string(),
                },
            )
            .await
            .unwrap();
    }

    assert!(backend.reserve(&scope(), &reserve_as("w1")).await.unwrap().is_none());
    let counts = backend.counts(&scope()).await.unwrap();
    assert_eq!(counts.dead_lettered, 1);

    let entries = backend
        .peek(&scope(), JobSource::DeadLetter, 0, 10)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, id);
}

/// Terminal nack skips remaining attempts.
#[tokio::test]
async fn non_retryable_nack_goes_straight_to_dlq() {
    let backend = MemoryBackend::new();
    let job = job_with(EnqueueOptions::new().with_max_attempts(5));
    let id = job.id.clone();
    backend.enqueue(&job).await.unwrap();

    let reserved = backend.reserve(&scope(), &reserve_as("w1")).await.unwrap().unwrap();
    backend
        .nack(
            &scope(),
            &id,
            &reserved.token,
            NackDisposition::DeadLetter {
                reason: "schema mismatch".to_string(),
            },
        )
        .await
        .unwrap();

    let entries = backend
        .peek(&scope(), JobSource::DeadLetter, 0, 10)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    match &entries[0].state {
        JobState::DeadLettered { reason, .. } => assert_eq!(reason, "schema mismatch"),
        other => panic!("expected dead-lettered, got {:?}", other),
    }
}

/// FIFO within a priority class under a single producer.
#[tokio::test]
async fn fifo_within_priority_class() {
    let backend = MemoryBackend::new();
    let mut expected = Vec::new();
    for _ in 0..20 {
        let job = job_with(EnqueueOptions::new());
        expected.push(job.id.clone());
        backend.enqueue(&job).await.unwrap();
    }

    for want in expected {
        let reserved = backend.reserve(&scope(), &reserve_as("w1")).await.unwrap().unwrap();
        assert_eq!(reserved.job.id, want);
        backend
            .ack(&scope(), &reserved.job.id.clone(), &reserved.token)
            .await
            .unwrap();
    }
}

/// Higher priority classes dequeue first.
#[tokio::test]
async fn priority_classes_dequeue_in_order() {
    let backend = MemoryBackend::new();
    for priority in [Priority::Low, Priority::Normal, Priority::High, Priority::Critical] {
        backend
            .enqueue(&job_with(EnqueueOptions::new().with_priority(priority)))
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    while let Some(reserved) = backend.reserve(&scope(), &reserve_as("w1")).await.unwrap() {
        seen.push(reserved.job.priority);
        backend
            .ack(&scope(), &reserved.job.id.clone(), &reserved.token)
            .await
            .unwrap();
    }
    assert_eq!(
        seen,
        vec![Priority::Critical, Priority::High, Priority::Normal, Priority::Low]
    );
}

/// Extension pushes the deadline out; an unknown token cannot extend.
#[tokio::test]
async fn heartbeat_extension() {
    let backend = MemoryBackend::new();
    let job = job_with(EnqueueOptions::new());
    let id = job.id.clone();
    backend.enqueue(&job).await.unwrap();

    let reserved = backend.reserve(&scope(), &reserve_as("w1")).await.unwrap().unwrap();
    backend
        .extend(&scope(), &id, &reserved.token, Duration::from_secs(60))
        .await
        .unwrap();

    let record = backend.get_job(&scope(), &id).await.unwrap();
    match record.state {
        JobState::Reserved { deadline, .. } => assert!(deadline > reserved.deadline),
        other => panic!("expected reserved, got {:?}", other),
    }

    let result = backend
        .extend(&scope(), &id, &ReservationToken::from("bogus"), Duration::from_secs(60))
        .await;
    assert!(matches!(result, Err(QueueError::InvalidReservation)));
}

/// Conservation: enqueued = acked + pending + delayed + reserved + dlq
/// across an arbitrary mix of operations.
#[tokio::test]
async fn conservation_across_operation_mix() {
    let backend = MemoryBackend::new();

    for round in 0..8 {
        for _ in 0..5 {
            backend
                .enqueue(&job_with(EnqueueOptions::new().with_max_attempts(2)))
                .await
                .unwrap();
        }
        for i in 0..4 {
            let Some(reserved) = backend.reserve(&scope(), &reserve_as("w1")).await.unwrap()
            else {
                break;
            };
            let id = reserved.job.id.clone();
            match (round + i) % 3 {
                0 => {
                    backend.ack(&scope(), &id, &reserved.token).await.unwrap();
                }
                1 => {
                    backend
                        .nack(
                            &scope(),
                            &id,
                            &reserved.token,
                            NackDisposition::Retry {
                                retry_at: chrono::Utc::now() + chrono::Duration::seconds(60),
                                error: "later".to_string(),
                            },
                        )
                        .await
                        .unwrap();
                }
                _ => {
                    // leave reserved
                }
            }
        }

        let counts = backend.counts(&scope()).await.unwrap();
        let accounted = counts.total_acked
            + counts.pending.total()
            + counts.delayed
            + counts.reserved
            + counts.dead_lettered;
        assert_eq!(counts.total_enqueued, accounted, "round {}", round);
    }
}

/// Requeue from the DLQ restores the job as pending.
#[tokio::test]
async fn dlq_requeue_restores_pending() {
    let backend = MemoryBackend::new();
    let job = job_with(EnqueueOptions::new().with_max_attempts(1));
    let id = job.id.clone();
    backend.enqueue(&job).await.unwrap();

    let reserved = backend.reserve(&scope(), &reserve_as("w1")).await.unwrap().unwrap();
    backend
        .nack(
            &scope(),
            &id,
            &reserved.token,
            NackDisposition::Retry {
                retry_at: chrono::Utc::now(),
                error: "boom".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(backend.counts(&scope()).await.unwrap().dead_lettered, 1);

    backend
        .move_job(
            &scope(),
            &id,
            MoveTarget::Pending {
                queue: None,
                priority: None,
            },
        )
        .await
        .unwrap();

    let counts = backend.counts(&scope()).await.unwrap();
    assert_eq!(counts.dead_lettered, 0);
    assert_eq!(counts.pending.total(), 1);
}
