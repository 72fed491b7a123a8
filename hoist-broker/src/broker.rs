use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use hoist_backend::{
    AckOutcome, JobSource, NackDisposition, QueueScope, QuotaCheck, QuotaKind, ReserveRequest,
    StorageBackend, TenantStore,
};
use hoist_backend::registry::BackendManager;
use hoist_core::{
    ChaosDecision, ChaosInjector, ChaosPoint, EnqueueOptions, Job, JobId, QueueDefaults,
    QueueError, QueueResult, QueueStats, QuotaPeriod, ReservationToken, ReservedJob, TenantCtx,
    WorkerId,
};

use crate::backoff::BackoffPolicy;

/// Inputs to a worker's dequeue call
#[derive(Debug, Clone)]
pub struct DequeueRequest {
    pub worker_id: WorkerId,
    pub queues: Vec<String>,
    /// How long to wait for an eligible job before returning `None`
    pub wait_timeout: Duration,
    /// Visibility window granted on reserve; falls back to the queue default
    pub visibility_timeout: Option<Duration>,
}

struct RateWindow {
    enqueued: u64,
    acked: u64,
    at: Instant,
}

/// The queue broker: validation, admission bookkeeping and lifecycle
/// orchestration above the storage backend. The backend remains the
/// serialization point for job state.
pub struct Broker {
    backends: Arc<BackendManager>,
    tenants: Arc<dyn TenantStore>,
    chaos: Arc<ChaosInjector>,
    config: QueueDefaults,
    backoff: BackoffPolicy,
    /// Per-queue backoff overrides; the default policy applies otherwise
    backoff_overrides: RwLock<HashMap<String, BackoffPolicy>>,
    /// Queues observed by this process; advisory, rebuilt from traffic
    scopes: RwLock<HashSet<QueueScope>>,
    rate_windows: RwLock<HashMap<QueueScope, RateWindow>>,
    ack_warnings: AtomicU64,
}

impl Broker {
    pub fn new(
        backends: Arc<BackendManager>,
        tenants: Arc<dyn TenantStore>,
        chaos: Arc<ChaosInjector>,
        config: QueueDefaults,
    ) -> Self {
        let backoff = BackoffPolicy::new(config.backoff_base, config.backoff_cap);
        Self {
            backends,
            tenants,
            chaos,
            config,
            backoff,
            backoff_overrides: RwLock::new(HashMap::new()),
            scopes: RwLock::new(HashSet::new()),
            rate_windows: RwLock::new(HashMap::new()),
            ack_warnings: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &QueueDefaults {
        &self.config
    }

    /// Queues this broker has touched since start
    pub fn known_scopes(&self) -> Vec<QueueScope> {
        self.scopes.read().iter().cloned().collect()
    }

    pub fn register_scope(&self, scope: QueueScope) {
        self.scopes.write().insert(scope);
    }

    /// Count of acks that arrived after the job was already gone
    pub fn ack_warning_count(&self) -> u64 {
        self.ack_warnings.load(Ordering::Relaxed)
    }

    /// Override the retry backoff for one queue
    pub fn set_backoff(&self, queue: impl Into<String>, policy: BackoffPolicy) {
        self.backoff_overrides.write().insert(queue.into(), policy);
    }

    fn backoff_for(&self, queue: &str) -> BackoffPolicy {
        self.backoff_overrides
            .read()
            .get(queue)
            .cloned()
            .unwrap_or_else(|| self.backoff.clone())
    }

    fn backend(&self, scope: &QueueScope) -> Arc<dyn StorageBackend> {
        self.backends.backend_for(scope)
    }

    /// One fast local retry for transient backend errors before surfacing
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> QueueResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = QueueResult<T>>,
    {
        match op().await {
            Err(e) if e.is_transient() => {
                debug!(error = %e, "transient backend error, retrying once");
                sleep(Duration::from_millis(25)).await;
                op().await
            }
            other => other,
        }
    }

    /// Accept a job: tenant status, payload bound and quota are checked in
    /// that order, then the job is persisted and usage counted.
    #[instrument(skip(self, payload, opts), fields(tenant = %ctx.tenant_id, queue))]
    pub async fn enqueue(
        &self,
        ctx: &TenantCtx,
        queue: &str,
        payload: Vec<u8>,
        mut opts: EnqueueOptions,
    ) -> QueueResult<JobId> {
        if queue.is_empty() {
            return Err(QueueError::Validation("queue name must not be empty".to_string()));
        }

        let tenant = self.tenants.get(&ctx.tenant_id).await?;
        if !tenant.status.admits_work() {
            return Err(QueueError::TenantSuspended(ctx.tenant_id.to_string()));
        }

        if payload.len() > self.config.max_payload_size {
            return Err(QueueError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }

        for (kind, amount) in [
            (QuotaKind::Jobs, 1u64),
            (QuotaKind::Bytes, payload.len() as u64),
        ] {
            for period in [QuotaPeriod::Hour, QuotaPeriod::Day] {
                let check = self
                    .tenants
                    .check_quota(&ctx.tenant_id, kind, period, amount)
                    .await?;
                if let QuotaCheck::Denied {
                    kind,
                    period,
                    retry_after,
                    ..
                } = check
                {
                    return Err(QueueError::QuotaExceeded {
                        quota: format!("{}_{}", kind.name(), period.name()),
                        retry_after,
                    });
                }
            }
        }

        if opts.max_attempts == 0 {
            opts.max_attempts = self.config.max_attempts;
        }
        if opts.trace_id.is_none() {
            opts.trace_id = ctx.trace_id.clone();
        }

        let payload_len = payload.len() as u64;
        let job = Job::new(ctx.tenant_id.clone(), queue, payload, opts);
        let job_id = job.id.clone();
        let scope = QueueScope::new(ctx.tenant_id.clone(), queue);

        let backend = self.backend(&scope);
        self.with_retry(|| backend.enqueue(&job)).await?;

        for period in [QuotaPeriod::Hour, QuotaPeriod::Day] {
            self.tenants
                .increment_usage(&ctx.tenant_id, QuotaKind::Jobs, period, 1)
                .await?;
            self.tenants
                .increment_usage(&ctx.tenant_id, QuotaKind::Bytes, period, payload_len)
                .await?;
        }

        self.register_scope(scope);
        info!(job_id = %job_id, "enqueued");
        Ok(job_id)
    }

    /// Reserve the next eligible job across the requested queues, scanning
    /// in the order given and waiting up to `wait_timeout`.
    #[instrument(skip(self, req), fields(tenant = %ctx.tenant_id, worker = %req.worker_id))]
    pub async fn dequeue(
        &self,
        ctx: &TenantCtx,
        req: &DequeueRequest,
    ) -> QueueResult<Option<ReservedJob>> {
        if req.queues.is_empty() {
            return Err(QueueError::Validation("no queues requested".to_string()));
        }
        let visibility = req
            .visibility_timeout
            .unwrap_or(self.config.visibility_timeout);
        let reserve = ReserveRequest {
            worker_id: req.worker_id.clone(),
            visibility_timeout: visibility,
        };
        let deadline = Instant::now() + req.wait_timeout;

        loop {
            for queue in &req.queues {
                let scope = QueueScope::new(ctx.tenant_id.clone(), queue.clone());
                match self
                    .chaos
                    .decide(ChaosPoint::Reserve, ctx.tenant_id.as_str(), queue)
                {
                    ChaosDecision::Fail => {
                        return Err(QueueError::BackendUnavailable(
                            "injected reserve failure".to_string(),
                        ))
                    }
                    ChaosDecision::Delay(d) => sleep(d).await,
                    ChaosDecision::Pass => {}
                }

                let backend = self.backend(&scope);
                if let Some(reserved) =
                    self.with_retry(|| backend.reserve(&scope, &reserve)).await?
                {
                    self.register_scope(scope);
                    return Ok(Some(reserved));
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Extend a reservation's visibility deadline. Idempotent for the same
    /// target deadline.
    pub async fn heartbeat(
        &self,
        ctx: &TenantCtx,
        queue: &str,
        job_id: &JobId,
        token: &ReservationToken,
        extend_by: Option<Duration>,
    ) -> QueueResult<()> {
        let scope = QueueScope::new(ctx.tenant_id.clone(), queue);
        let extend = extend_by.unwrap_or(self.config.visibility_timeout);
        let backend = self.backend(&scope);
        self.with_retry(|| backend.extend(&scope, job_id, token, extend))
            .await
    }

    /// Acknowledge completion. Acking a job that is already gone succeeds
    /// with a warning counted.
    #[instrument(skip(self, token), fields(tenant = %ctx.tenant_id, job_id = %job_id))]
    pub async fn ack(
        &self,
        ctx: &TenantCtx,
        queue: &str,
        job_id: &JobId,
        token: &ReservationToken,
    ) -> QueueResult<()> {
        let scope = QueueScope::new(ctx.tenant_id.clone(), queue);
        match self
            .chaos
            .decide(ChaosPoint::Ack, ctx.tenant_id.as_str(), queue)
        {
            ChaosDecision::Fail => {
                return Err(QueueError::BackendUnavailable(
                    "injected ack failure".to_string(),
                ))
            }
            ChaosDecision::Delay(d) => sleep(d).await,
            ChaosDecision::Pass => {}
        }

        let backend = self.backend(&scope);
        match self.with_retry(|| backend.ack(&scope, job_id, token)).await? {
            AckOutcome::Acked => Ok(()),
            AckOutcome::AlreadyGone => {
                self.ack_warnings.fetch_add(1, Ordering::Relaxed);
                warn!("ack for a job no longer reserved");
                Ok(())
            }
        }
    }

    /// Report a failed delivery. Retryable failures requeue after the
    /// queue's backoff; non-retryable ones dead-letter immediately.
    #[instrument(skip(self, token, error), fields(tenant = %ctx.tenant_id, job_id = %job_id))]
    pub async fn nack(
        &self,
        ctx: &TenantCtx,
        queue: &str,
        job_id: &JobId,
        token: &ReservationToken,
        error: &str,
        retryable: bool,
    ) -> QueueResult<()> {
        let scope = QueueScope::new(ctx.tenant_id.clone(), queue);
        let backend = self.backend(&scope);

        let disposition = if retryable {
            let job = backend.get_job(&scope, job_id).await?;
            let next_attempt = job.attempts + 1;
            let delay = self.backoff_for(queue).delay(next_attempt);
            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(1));
            NackDisposition::Retry {
                retry_at,
                error: error.to_string(),
            }
        } else {
            NackDisposition::DeadLetter {
                reason: error.to_string(),
            }
        };

        self.with_retry(|| backend.nack(&scope, job_id, token, disposition.clone()))
            .await
    }

    /// Cancel a job (cancel-wins). Returns false when already terminal.
    pub async fn cancel(
        &self,
        ctx: &TenantCtx,
        queue: &str,
        job_id: &JobId,
    ) -> QueueResult<bool> {
        let scope = QueueScope::new(ctx.tenant_id.clone(), queue);
        let backend = self.backend(&scope);
        self.with_retry(|| backend.cancel(&scope, job_id)).await
    }

    /// Fetch one job record
    pub async fn get_job(&self, ctx: &TenantCtx, queue: &str, job_id: &JobId) -> QueueResult<Job> {
        let scope = QueueScope::new(ctx.tenant_id.clone(), queue);
        self.backend(&scope).get_job(&scope, job_id).await
    }

    /// Read jobs without mutating state
    pub async fn peek(
        &self,
        ctx: &TenantCtx,
        queue: &str,
        source: JobSource,
        offset: usize,
        limit: usize,
    ) -> QueueResult<Vec<Job>> {
        let scope = QueueScope::new(ctx.tenant_id.clone(), queue);
        self.backend(&scope)
            .peek(&scope, source, offset, limit)
            .await
    }

    /// Snapshot of one queue, with enqueue/ack rates derived from counter
    /// deltas since the previous call.
    pub async fn stats(&self, ctx: &TenantCtx, queue: &str) -> QueueResult<QueueStats> {
        let scope = QueueScope::new(ctx.tenant_id.clone(), queue);
        let counts = self.backend(&scope).counts(&scope).await?;

        let now = Instant::now();
        let (enqueue_rate, ack_rate) = {
            let mut windows = self.rate_windows.write();
            let rate = match windows.get(&scope) {
                Some(prev) => {
                    let secs = now.duration_since(prev.at).as_secs_f64().max(0.001);
                    (
                        (counts.total_enqueued.saturating_sub(prev.enqueued)) as f64 / secs,
                        (counts.total_acked.saturating_sub(prev.acked)) as f64 / secs,
                    )
                }
                None => (0.0, 0.0),
            };
            windows.insert(
                scope.clone(),
                RateWindow {
                    enqueued: counts.total_enqueued,
                    acked: counts.total_acked,
                    at: now,
                },
            );
            rate
        };

        Ok(QueueStats {
            tenant_id: ctx.tenant_id.to_string(),
            queue: queue.to_string(),
            pending: counts.pending,
            reserved: counts.reserved,
            dead_lettered: counts.dead_lettered,
            enqueue_rate,
            ack_rate,
            taken_at: Utc::now(),
        })
    }

    /// Delete one job entirely (DLQ drop, operator cleanup)
    pub async fn purge_job(
        &self,
        ctx: &TenantCtx,
        queue: &str,
        job_id: &JobId,
    ) -> QueueResult<bool> {
        let scope = QueueScope::new(ctx.tenant_id.clone(), queue);
        self.backend(&scope).purge(&scope, job_id).await
    }

    /// Delete every job in a queue. The caller is responsible for the
    /// destructive-action confirmation contract.
    pub async fn purge_queue(&self, ctx: &TenantCtx, queue: &str) -> QueueResult<u64> {
        let scope = QueueScope::new(ctx.tenant_id.clone(), queue);
        let removed = self.backend(&scope).purge_queue(&scope).await?;
        info!(queue, removed, "queue purged");
        Ok(removed)
    }

    /// Requeue a dead-lettered or pending job, optionally retargeting queue
    /// or priority (DLQ remediation)
    pub async fn requeue(
        &self,
        ctx: &TenantCtx,
        queue: &str,
        job_id: &JobId,
        target_queue: Option<String>,
        priority: Option<hoist_core::Priority>,
    ) -> QueueResult<()> {
        let scope = QueueScope::new(ctx.tenant_id.clone(), queue);
        self.backend(&scope)
            .move_job(
                &scope,
                job_id,
                hoist_backend::MoveTarget::Pending {
                    queue: target_queue,
                    priority,
                },
            )
            .await
    }

    /// Re-enqueue an existing job record as pending (remediation paths that
    /// transformed the job). Skips producer admission: the job was already
    /// admitted once.
    pub async fn reenqueue(&self, job: &Job) -> QueueResult<()> {
        let scope = QueueScope::new(job.tenant_id.clone(), job.queue.clone());
        let mut pending = job.clone();
        pending.state = hoist_core::JobState::Pending;
        pending.reservation = None;
        let backend = self.backend(&scope);
        self.with_retry(|| backend.enqueue(&pending)).await?;
        self.register_scope(scope);
        Ok(())
    }

    /// Reclaim expired reservations and promote due delayed jobs for one
    /// scope; called by the sweeper.
    pub async fn sweep_scope(&self, scope: &QueueScope, limit: usize) -> QueueResult<u64> {
        let backend = self.backend(scope);
        backend.promote_due(scope, limit).await?;
        backend.reclaim_expired(scope, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoist_backend::{MemoryBackend, MemoryTenantStore};
    use hoist_core::{TenantId, TenantRecord, TenantStatus};

    async fn test_broker() -> Broker {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let tenants = Arc::new(MemoryTenantStore::new());
        tenants
            .create(TenantRecord::new(TenantId::new("acme").unwrap()))
            .await
            .unwrap();
        Broker::new(
            Arc::new(BackendManager::new(backend)),
            tenants,
            Arc::new(ChaosInjector::new()),
            QueueDefaults::default(),
        )
    }

    fn ctx() -> TenantCtx {
        TenantCtx::new(TenantId::new("acme").unwrap())
    }

    fn dequeue_req() -> DequeueRequest {
        DequeueRequest {
            worker_id: WorkerId::from("w1"),
            queues: vec!["default".to_string()],
            wait_timeout: Duration::from_millis(10),
            visibility_timeout: None,
        }
    }

    #[tokio::test]
    async fn enqueue_dequeue_ack_cycle() {
        let broker = test_broker().await;
        let id = broker
            .enqueue(&ctx(), "default", b"work".to_vec(), EnqueueOptions::new())
            .await
            .unwrap();

        let reserved = broker.dequeue(&ctx(), &dequeue_req()).await.unwrap().unwrap();
        assert_eq!(reserved.job.id, id);

        broker
            .ack(&ctx(), "default", &id, &reserved.token)
            .await
            .unwrap();
        let stats = broker.stats(&ctx(), "default").await.unwrap();
        assert_eq!(stats.backlog(), 0);
        assert_eq!(stats.reserved, 0);
    }

    #[tokio::test]
    async fn suspended_tenant_rejected() {
        let broker = test_broker().await;
        let id = TenantId::new("acme").unwrap();
        let mut record = broker.tenants.get(&id).await.unwrap();
        record.status = TenantStatus::Suspended;
        broker.tenants.update(record).await.unwrap();

        let result = broker
            .enqueue(&ctx(), "default", b"x".to_vec(), EnqueueOptions::new())
            .await;
        assert!(matches!(result, Err(QueueError::TenantSuspended(_))));
    }

    #[tokio::test]
    async fn oversized_payload_rejected() {
        let broker = test_broker().await;
        let too_big = vec![0u8; broker.config().max_payload_size + 1];
        let result = broker
            .enqueue(&ctx(), "default", too_big, EnqueueOptions::new())
            .await;
        assert!(matches!(result, Err(QueueError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn quota_exhaustion_rejected_with_retry_after() {
        let broker = test_broker().await;
        let id = TenantId::new("acme").unwrap();
        let mut record = broker.tenants.get(&id).await.unwrap();
        record.quotas.jobs_per_hour = 2;
        broker.tenants.update(record).await.unwrap();

        for _ in 0..2 {
            broker
                .enqueue(&ctx(), "default", b"x".to_vec(), EnqueueOptions::new())
                .await
                .unwrap();
        }
        let result = broker
            .enqueue(&ctx(), "default", b"x".to_vec(), EnqueueOptions::new())
            .await;
        match result {
            Err(QueueError::QuotaExceeded { retry_after, .. }) => {
                assert!(retry_after > Duration::ZERO)
            }
            other => panic!("expected quota denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn dequeue_times_out_empty() {
        let broker = test_broker().await;
        let result = broker.dequeue(&ctx(), &dequeue_req()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn nack_retryable_schedules_backoff() {
        let broker = test_broker().await;
        let id = broker
            .enqueue(&ctx(), "default", b"x".to_vec(), EnqueueOptions::new())
            .await
            .unwrap();
        let reserved = broker.dequeue(&ctx(), &dequeue_req()).await.unwrap().unwrap();

        broker
            .nack(&ctx(), "default", &id, &reserved.token, "flaky", true)
            .await
            .unwrap();

        let job = broker.get_job(&ctx(), "default", &id).await.unwrap();
        assert_eq!(job.attempts, 1);
        assert!(matches!(job.state, hoist_core::JobState::Retrying { .. }));
    }

    #[tokio::test]
    async fn nack_terminal_dead_letters() {
        let broker = test_broker().await;
        let id = broker
            .enqueue(&ctx(), "default", b"x".to_vec(), EnqueueOptions::new())
            .await
            .unwrap();
        let reserved = broker.dequeue(&ctx(), &dequeue_req()).await.unwrap().unwrap();

        broker
            .nack(&ctx(), "default", &id, &reserved.token, "poison", false)
            .await
            .unwrap();

        let stats = broker.stats(&ctx(), "default").await.unwrap();
        assert_eq!(stats.dead_lettered, 1);
    }

    #[tokio::test]
    async fn duplicate_ack_counts_warning() {
        let broker = test_broker().await;
        let id = broker
            .enqueue(&ctx(), "default", b"x".to_vec(), EnqueueOptions::new())
            .await
            .unwrap();
        let reserved = broker.dequeue(&ctx(), &dequeue_req()).await.unwrap().unwrap();

        broker.ack(&ctx(), "default", &id, &reserved.token).await.unwrap();
        broker.ack(&ctx(), "default", &id, &reserved.token).await.unwrap();
        assert_eq!(broker.ack_warning_count(), 1);
    }

    #[tokio::test]
    async fn chaos_fail_rule_surfaces_distinct_error() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let tenants = Arc::new(MemoryTenantStore::new());
        tenants
            .create(TenantRecord::new(TenantId::new("acme").unwrap()))
            .await
            .unwrap();
        let chaos = Arc::new(ChaosInjector::with_seed(3));
        chaos.enable();
        chaos.upsert_rule(hoist_core::ChaosRule::failing(
            ChaosPoint::Reserve,
            hoist_core::ChaosScope::Global,
            1.0,
        ));
        let broker = Broker::new(
            Arc::new(BackendManager::new(backend)),
            tenants,
            chaos,
            QueueDefaults::default(),
        );

        let result = broker.dequeue(&ctx(), &dequeue_req()).await;
        assert!(matches!(result, Err(QueueError::BackendUnavailable(_))));
    }
}
