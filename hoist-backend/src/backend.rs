use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use hoist_core::{
    Capabilities, Job, JobEvent, JobId, PendingCounts, QueueResult, ReservationToken, ReservedJob,
    TenantId, WorkerId,
};

/// One tenant's queue: the unit every backend operation is scoped to.
/// All persisted keys for a scope share the `t:{tenant}:q:{queue}` prefix,
/// so cross-tenant access is impossible by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueScope {
    pub tenant: TenantId,
    pub queue: String,
}

impl QueueScope {
    pub fn new(tenant: TenantId, queue: impl Into<String>) -> Self {
        Self {
            tenant,
            queue: queue.into(),
        }
    }
}

impl std::fmt::Display for QueueScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant, self.queue)
    }
}

/// Inputs to a reserve call
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub worker_id: WorkerId,
    pub visibility_timeout: Duration,
}

/// What to do with a nacked job
#[derive(Debug, Clone)]
pub enum NackDisposition {
    /// Schedule a retry at the given time (head of its priority class once due)
    Retry { retry_at: DateTime<Utc>, error: String },
    /// Non-retryable: move straight to the dead-letter queue
    DeadLetter { reason: String },
}

/// Ack is idempotent: acking an id that is no longer reserved succeeds,
/// with the outcome distinguishing the two cases so the broker can count
/// warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    /// Not in the reserved set (already acked, reclaimed, or unknown)
    AlreadyGone,
}

/// Destination of an explicit job move
#[derive(Debug, Clone)]
pub enum MoveTarget {
    /// Move to the scope's dead-letter queue
    DeadLetter { reason: String },
    /// Requeue as pending, optionally into a different queue or priority
    Pending {
        queue: Option<String>,
        priority: Option<hoist_core::Priority>,
    },
}

/// Which set of jobs to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSource {
    Pending,
    Reserved,
    DeadLetter,
}

/// Point-in-time structure sizes for one scope
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CountsSnapshot {
    pub pending: PendingCounts,
    /// Jobs scheduled or backing off, not yet eligible
    pub delayed: u64,
    pub reserved: u64,
    pub dead_lettered: u64,
    /// Lifetime enqueue count for conservation checks
    pub total_enqueued: u64,
    /// Lifetime ack count for conservation checks
    pub total_acked: u64,
}

/// Backend health probe result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendHealth {
    pub healthy: bool,
    pub detail: String,
    pub checked_at: DateTime<Utc>,
}

impl BackendHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            detail: "ok".to_string(),
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: detail.into(),
            checked_at: Utc::now(),
        }
    }
}

/// Operation counters since backend construction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendStats {
    pub enqueues: u64,
    pub reserves: u64,
    pub acks: u64,
    pub nacks: u64,
    pub reclaims: u64,
    pub errors: u64,
}

/// Durable queue primitives.
///
/// Multi-step operations (reserve, ack, nack, DLQ move, reclaim) are atomic
/// against the backend; Redis implementations execute them as single Lua
/// scripts. Capabilities are advertised as a bit-set and never probed.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Persist a job and append it to its priority class (or the delayed
    /// set when `run_at` is in the future)
    async fn enqueue(&self, job: &Job) -> QueueResult<()>;

    /// Atomically pop the highest-priority eligible job and reserve it for
    /// the worker under a fresh fencing token. Returns `None` when no job
    /// is eligible; waiting is the caller's concern.
    async fn reserve(
        &self,
        scope: &QueueScope,
        req: &ReserveRequest,
    ) -> QueueResult<Option<ReservedJob>>;

    /// Remove a reserved job. Requires the current fencing token.
    async fn ack(
        &self,
        scope: &QueueScope,
        job_id: &JobId,
        token: &ReservationToken,
    ) -> QueueResult<AckOutcome>;

    /// Fail a reserved job: count the failed delivery, then retry or
    /// dead-letter per the disposition. Requires the current fencing token.
    /// The backend dead-letters regardless of disposition once the job's
    /// failure count reaches `max_attempts`.
    async fn nack(
        &self,
        scope: &QueueScope,
        job_id: &JobId,
        token: &ReservationToken,
        disposition: NackDisposition,
    ) -> QueueResult<()>;

    /// Extend the visibility deadline of a reservation. Idempotent for the
    /// same target deadline. Requires the current fencing token.
    async fn extend(
        &self,
        scope: &QueueScope,
        job_id: &JobId,
        token: &ReservationToken,
        extend_by: Duration,
    ) -> QueueResult<()>;

    /// Cancel a job (cancel-wins). Returns false when already terminal.
    async fn cancel(&self, scope: &QueueScope, job_id: &JobId) -> QueueResult<bool>;

    /// Explicitly move a job between structures (DLQ remediation, operator
    /// requeue). The job must not be reserved.
    async fn move_job(
        &self,
        scope: &QueueScope,
        job_id: &JobId,
        target: MoveTarget,
    ) -> QueueResult<()>;

    /// Return expired reservations to their priority class, counting one
    /// failed delivery each; dead-letter those out of attempts. Returns the
    /// number of jobs reclaimed. This is the liveness mechanism for crashed
    /// workers.
    async fn reclaim_expired(&self, scope: &QueueScope, limit: usize) -> QueueResult<u64>;

    /// Promote delayed jobs whose eligibility time has passed into their
    /// priority class. Returns the number promoted.
    async fn promote_due(&self, scope: &QueueScope, limit: usize) -> QueueResult<u64>;

    /// Delete one job and its bookkeeping entirely. Returns false when the
    /// job is unknown. A reserved job cannot be purged.
    async fn purge(&self, scope: &QueueScope, job_id: &JobId) -> QueueResult<bool>;

    /// Delete every job in the scope. Returns the number removed.
    async fn purge_queue(&self, scope: &QueueScope) -> QueueResult<u64>;

    /// Structure sizes for the scope
    async fn counts(&self, scope: &QueueScope) -> QueueResult<CountsSnapshot>;

    /// Read jobs without mutating state
    async fn peek(
        &self,
        scope: &QueueScope,
        source: JobSource,
        offset: usize,
        limit: usize,
    ) -> QueueResult<Vec<Job>>;

    /// Fetch one job record by id
    async fn get_job(&self, scope: &QueueScope, job_id: &JobId) -> QueueResult<Job>;

    /// Advertised capability bit-set
    fn capabilities(&self) -> Capabilities;

    /// Operation counters
    fn stats(&self) -> BackendStats;

    /// Connectivity / integrity probe
    async fn health(&self) -> BackendHealth;

    /// Event stream for observability subscribers
    fn events(&self) -> tokio::sync::broadcast::Receiver<JobEvent>;

    /// Release resources. Further calls may fail.
    async fn close(&self) -> QueueResult<()>;
}

/// Batched iterator over one job source, built on [`StorageBackend::peek`].
/// Used by migration and operator tooling to walk a queue without loading
/// it whole.
pub struct JobIter {
    backend: std::sync::Arc<dyn StorageBackend>,
    scope: QueueScope,
    source: JobSource,
    offset: usize,
    batch: usize,
    done: bool,
}

impl JobIter {
    pub fn new(
        backend: std::sync::Arc<dyn StorageBackend>,
        scope: QueueScope,
        source: JobSource,
        batch: usize,
    ) -> Self {
        Self {
            backend,
            scope,
            source,
            offset: 0,
            batch: batch.max(1),
            done: false,
        }
    }

    /// Fetch the next batch; empty means the iteration is finished
    pub async fn next_batch(&mut self) -> QueueResult<Vec<Job>> {
        if self.done {
            return Ok(Vec::new());
        }
        let jobs = self
            .backend
            .peek(&self.scope, self.source, self.offset, self.batch)
            .await?;
        if jobs.len() < self.batch {
            self.done = true;
        }
        self.offset += jobs.len();
        Ok(jobs)
    }
}
