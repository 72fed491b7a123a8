//! End-to-end scenarios over the assembled stack: broker + admission +
//! exactly-once envelope + ops controllers, wired exactly as the admin
//! plane wires them, against the in-memory backend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hoist_admission::RateLimiter;
use hoist_backend::registry::BackendManager;
use hoist_backend::{MemoryBackend, MemoryTenantStore, StorageBackend, TenantStore};
use hoist_broker::{Broker, DequeueRequest, VisibilitySweeper};
use hoist_core::{
    ChaosInjector, EnqueueOptions, ExactlyOnceConfig, Priority, QueueDefaults, QueueError,
    RateLimitConfig, TenantCtx, TenantId, TenantRecord, WorkerId,
};
use hoist_exactly_once::{IdempotencyManager, IdempotencyScope, MemoryIdempotencyStore};
use hoist_ops::{CanaryController, CanaryStatus, LaneMetrics, RoutingStrategy, ThresholdProfile};

async fn stack() -> (Arc<Broker>, Arc<MemoryBackend>) {
    let memory = Arc::new(MemoryBackend::new());
    let backend: Arc<dyn StorageBackend> = memory.clone();
    let tenants = Arc::new(MemoryTenantStore::new());
    tenants
        .create(TenantRecord::new(TenantId::new("e2e").unwrap()))
        .await
        .unwrap();
    let broker = Arc::new(Broker::new(
        Arc::new(BackendManager::new(backend)),
        tenants,
        Arc::new(ChaosInjector::new()),
        QueueDefaults::default(),
    ));
    (broker, memory)
}

fn ctx() -> TenantCtx {
    TenantCtx::new(TenantId::new("e2e").unwrap())
}

fn dequeue(queue: &str, worker: &str) -> DequeueRequest {
    DequeueRequest {
        worker_id: WorkerId::from(worker),
        queues: vec![queue.to_string()],
        wait_timeout: Duration::from_millis(20),
        visibility_timeout: None,
    }
}

/// Enqueue, dequeue returns the job, ack succeeds, queue and reserved set
/// end empty.
#[tokio::test]
async fn enqueue_dequeue_ack() {
    let (broker, _) = stack().await;
    let job_id = broker
        .enqueue(&ctx(), "q", b"x".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();

    let reserved = broker.dequeue(&ctx(), &dequeue("q", "w1")).await.unwrap().unwrap();
    assert_eq!(reserved.job.id, job_id);

    broker.ack(&ctx(), "q", &job_id, &reserved.token).await.unwrap();

    let stats = broker.stats(&ctx(), "q").await.unwrap();
    assert_eq!(stats.backlog(), 0);
    assert_eq!(stats.reserved, 0);
}

/// A reserved job whose visibility window lapses without an ack is
/// re-delivered with one failure counted.
#[tokio::test]
async fn visibility_reclaim_redelivers() {
    let (broker, memory) = stack().await;
    let job_id = broker
        .enqueue(&ctx(), "q", b"x".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();
    broker.dequeue(&ctx(), &dequeue("q", "w1")).await.unwrap().unwrap();
    // No ack; force the deadline past and run the sweeper

    let scope = hoist_backend::QueueScope::new(TenantId::new("e2e").unwrap(), "q");
    memory.force_expire(&scope, &job_id);
    let sweeper = VisibilitySweeper::new(broker.clone());
    assert_eq!(sweeper.sweep_once().await, 1);

    let redelivered = broker.dequeue(&ctx(), &dequeue("q", "w2")).await.unwrap().unwrap();
    assert_eq!(redelivered.job.id, job_id);
    assert_eq!(redelivered.job.attempts, 1);
}

/// Three retryable nacks against max_attempts=3 land the job in the DLQ;
/// a fourth dequeue yields nothing.
#[tokio::test]
async fn retries_exhaust_into_dlq() {
    let (broker, memory) = stack().await;
    let scope = hoist_backend::QueueScope::new(TenantId::new("e2e").unwrap(), "q");
    let job_id = broker
        .enqueue(
            &ctx(),
            "q",
            b"x".to_vec(),
            EnqueueOptions::new().with_max_attempts(3),
        )
        .await
        .unwrap();

    for round in 0..3 {
        // Pull any backoff forward, then let the sweeper promote it
        memory.force_due(&scope, &job_id);
        broker.sweep_scope(&scope, 100).await.unwrap();
        let reserved = broker
            .dequeue(&ctx(), &dequeue("q", "w1"))
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("round {} should deliver", round));
        broker
            .nack(&ctx(), "q", &job_id, &reserved.token, "boom", true)
            .await
            .unwrap();
    }

    // Third nack exhausted attempts; nothing left to deliver
    memory.force_due(&scope, &job_id);
    broker.sweep_scope(&scope, 100).await.unwrap();
    assert!(broker.dequeue(&ctx(), &dequeue("q", "w1")).await.unwrap().is_none());
    let stats = broker.stats(&ctx(), "q").await.unwrap();
    assert_eq!(stats.dead_lettered, 1);
}

/// Same (key, fingerprint) runs the closure once and replays the result;
/// a different fingerprint under the same key conflicts.
#[tokio::test]
async fn idempotent_execution_envelope() {
    let manager = IdempotencyManager::new(
        MemoryIdempotencyStore::new(),
        &ExactlyOnceConfig::default(),
    );
    let scope = IdempotencyScope::new("e2e", "q");
    let calls = Arc::new(AtomicU32::new(0));

    let c = calls.clone();
    let first = manager
        .process(&scope, "k", "F", move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Some(serde_json::json!("A")))
        })
        .await
        .unwrap();
    assert_eq!(first, Some(serde_json::json!("A")));

    let c = calls.clone();
    let second = manager
        .process(&scope, "k", "F", move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Some(serde_json::json!("B")))
        })
        .await
        .unwrap();
    assert_eq!(second, Some(serde_json::json!("A")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let conflict = manager
        .process(&scope, "k", "F2", || async { Ok(None) })
        .await;
    assert!(matches!(conflict, Err(QueueError::Conflict(_))));
}

/// Burst of 15 against rps=10/burst=10: ten admitted, five denied with a
/// retry-after, admitted again once tokens accrue.
#[tokio::test]
async fn rate_limit_burst_and_recovery() {
    let limiter = RateLimiter::new(RateLimitConfig {
        default_tenant_rps: 10.0,
        default_tenant_burst: 10,
        global_rps: 10_000.0,
        global_burst: 10_000,
        ..RateLimitConfig::default()
    });

    let mut allowed = 0;
    let mut denied = 0;
    for _ in 0..15 {
        let outcome = limiter.consume("e2e", "enqueue", 1, Priority::Normal);
        if outcome.allowed {
            allowed += 1;
        } else {
            denied += 1;
            assert!(outcome.retry_after.unwrap() > Duration::ZERO);
        }
    }
    assert_eq!(allowed, 10);
    assert_eq!(denied, 5);

    // After a second of refill the bucket admits again
    std::thread::sleep(Duration::from_millis(1100));
    assert!(limiter.consume("e2e", "enqueue", 1, Priority::Normal).allowed);
}

/// Canary at 10% whose error rate runs well above stable fails its health
/// check; auto-rollback drives the split to zero with the reason recorded.
#[tokio::test]
async fn canary_error_rate_rollback() {
    let controller = CanaryController::new(ThresholdProfile {
        min_sample_size: 50,
        min_duration: Duration::ZERO,
        ..ThresholdProfile::default_profile()
    });
    let deployment = controller
        .create("q", "1.0", "1.1", RoutingStrategy::SplitQueue, 10, false)
        .unwrap();

    // 100 synthetic canary jobs with an error rate 20 points above stable
    let stable = LaneMetrics {
        requests: 900,
        errors: 9,
        latency_p95: Duration::from_millis(100),
        throughput: 90.0,
    };
    let canary = LaneMetrics {
        requests: 100,
        errors: 21,
        latency_p95: Duration::from_millis(100),
        throughput: 10.0,
    };

    let updated = controller.tick(&deployment.id, &stable, &canary).unwrap();
    assert_eq!(updated.status, CanaryStatus::Failed);
    assert_eq!(updated.current_percent, 0);
    assert!(updated.failure_reason.unwrap().contains("error_rate"));
}

/// Cross-tenant isolation: another tenant cannot observe or reserve these
/// jobs, because every backend structure is keyed by the tenant namespace.
#[tokio::test]
async fn tenant_isolation_blocks_cross_access() {
    let (broker, _) = stack().await;
    let job_id = broker
        .enqueue(&ctx(), "q", b"secret".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();

    let other = TenantCtx::new(TenantId::new("other").unwrap());
    assert!(broker.dequeue(&other, &dequeue("q", "w1")).await.unwrap().is_none());
    assert!(matches!(
        broker.get_job(&other, "q", &job_id).await,
        Err(QueueError::JobNotFound(_))
    ));
}
