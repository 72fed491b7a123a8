//! In-memory backend for tests and local development.
//!
//! Implements the full contract, including priority ordering, delayed
//! eligibility, fencing tokens, visibility reclaim and the DLQ. Everything
//! lives under one lock per call, so every operation is atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

use hoist_core::{
    Capabilities, Job, JobEvent, JobId, JobState, PendingCounts, Priority, QueueError,
    QueueResult, ReservationToken, ReservedJob, WorkerId,
};

use crate::backend::{
    AckOutcome, BackendHealth, BackendStats, CountsSnapshot, JobSource, MoveTarget,
    NackDisposition, QueueScope, ReserveRequest, StorageBackend,
};

/// State for one (tenant, queue) scope
#[derive(Default)]
struct Shard {
    /// Job records indexed by id; terminal acked jobs are removed
    jobs: HashMap<JobId, Job>,
    /// Pending ids per priority class, FIFO within a class
    pending: HashMap<Priority, VecDeque<JobId>>,
    /// Scheduled or backing-off ids with their eligibility time
    delayed: Vec<(DateTime<Utc>, JobId)>,
    /// Reserved ids with deadline and fencing token
    reserved: HashMap<JobId, Reservation>,
    /// Dead-lettered ids in arrival order
    dlq: VecDeque<JobId>,
    total_enqueued: u64,
    total_acked: u64,
}

struct Reservation {
    token: ReservationToken,
    #[allow(dead_code)]
    worker: WorkerId,
    deadline: DateTime<Utc>,
}

/// Process-local backend with full queue semantics
pub struct MemoryBackend {
    shards: RwLock<HashMap<QueueScope, Shard>>,
    events: broadcast::Sender<JobEvent>,
    enqueues: AtomicU64,
    reserves: AtomicU64,
    acks: AtomicU64,
    nacks: AtomicU64,
    reclaims: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            shards: RwLock::new(HashMap::new()),
            events,
            enqueues: AtomicU64::new(0),
            reserves: AtomicU64::new(0),
            acks: AtomicU64::new(0),
            nacks: AtomicU64::new(0),
            reclaims: AtomicU64::new(0),
        }
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    /// Force a reservation to expire (test helper)
    pub fn force_expire(&self, scope: &QueueScope, job_id: &JobId) {
        let mut shards = self.shards.write();
        if let Some(shard) = shards.get_mut(scope) {
            let expired = Utc::now() - chrono::Duration::seconds(1);
            if let Some(res) = shard.reserved.get_mut(job_id) {
                res.deadline = expired;
            }
            if let Some(job) = shard.jobs.get_mut(job_id) {
                if let JobState::Reserved { deadline, .. } = &mut job.state {
                    *deadline = expired;
                }
            }
        }
    }

    /// Make a delayed job due immediately (test helper)
    pub fn force_due(&self, scope: &QueueScope, job_id: &JobId) {
        let mut shards = self.shards.write();
        if let Some(shard) = shards.get_mut(scope) {
            let due = Utc::now() - chrono::Duration::seconds(1);
            for entry in shard.delayed.iter_mut() {
                if &entry.1 == job_id {
                    entry.0 = due;
                }
            }
            if let Some(job) = shard.jobs.get_mut(job_id) {
                if let JobState::Retrying { retry_at } = &mut job.state {
                    *retry_at = due;
                }
                if let Some(run_at) = &mut job.run_at {
                    if *run_at > due {
                        *run_at = due;
                    }
                }
            }
        }
    }

    fn promote_locked(shard: &mut Shard, now: DateTime<Utc>, limit: usize) -> u64 {
        let mut promoted = 0u64;
        let mut remaining = Vec::with_capacity(shard.delayed.len());
        // Oldest due entries first so retry order stays stable
        shard.delayed.sort_by_key(|(due, _)| *due);
        for (due, id) in shard.delayed.drain(..) {
            if due <= now && (promoted as usize) < limit {
                if let Some(job) = shard.jobs.get_mut(&id) {
                    let was_retry = matches!(job.state, JobState::Retrying { .. });
                    job.state = JobState::Pending;
                    job.updated_at = now;
                    let queue = shard.pending.entry(job.priority).or_default();
                    if was_retry {
                        // Retries rejoin at the head of their class
                        queue.push_front(id);
                    } else {
                        queue.push_back(id);
                    }
                    promoted += 1;
                }
            } else {
                remaining.push((due, id));
            }
        }
        shard.delayed = remaining;
        promoted
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        let scope = QueueScope::new(job.tenant_id.clone(), job.queue.clone());
        let now = Utc::now();
        let mut shards = self.shards.write();
        let shard = shards.entry(scope).or_default();

        let mut stored = job.clone();
        match stored.run_at {
            Some(run_at) if run_at > now => {
                shard.delayed.push((run_at, stored.id.clone()));
            }
            _ => {
                stored.state = JobState::Pending;
                shard
                    .pending
                    .entry(stored.priority)
                    .or_default()
                    .push_back(stored.id.clone());
            }
        }
        shard.total_enqueued += 1;
        let event = JobEvent::Enqueued {
            job_id: stored.id.clone(),
            tenant_id: stored.tenant_id.to_string(),
            queue: stored.queue.clone(),
            priority: stored.priority,
            at: now,
        };
        shard.jobs.insert(stored.id.clone(), stored);
        drop(shards);

        self.enqueues.fetch_add(1, Ordering::Relaxed);
        self.emit(event);
        Ok(())
    }

    async fn reserve(
        &self,
        scope: &QueueScope,
        req: &ReserveRequest,
    ) -> QueueResult<Option<ReservedJob>> {
        let now = Utc::now();
        let mut shards = self.shards.write();
        let Some(shard) = shards.get_mut(scope) else {
            return Ok(None);
        };

        Self::promote_locked(shard, now, 128);

        for priority in Priority::descending() {
            let Some(queue) = shard.pending.get_mut(priority) else {
                continue;
            };
            while let Some(id) = queue.pop_front() {
                let Some(job) = shard.jobs.get_mut(&id) else {
                    continue;
                };
                if !job.is_eligible(now) {
                    continue;
                }

                let token = ReservationToken::new();
                let deadline = now
                    + chrono::Duration::from_std(req.visibility_timeout)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));
                job.start_reservation(token.clone(), req.worker_id.clone(), deadline);
                shard.reserved.insert(
                    id.clone(),
                    Reservation {
                        token: token.clone(),
                        worker: req.worker_id.clone(),
                        deadline,
                    },
                );

                let reserved = ReservedJob::new(job.clone(), token, deadline);
                let event = JobEvent::Reserved {
                    job_id: id,
                    tenant_id: scope.tenant.to_string(),
                    queue: scope.queue.clone(),
                    worker_id: req.worker_id.clone(),
                    deadline,
                    at: now,
                };
                drop(shards);

                self.reserves.fetch_add(1, Ordering::Relaxed);
                self.emit(event);
                return Ok(Some(reserved));
            }
        }
        Ok(None)
    }

    async fn ack(
        &self,
        scope: &QueueScope,
        job_id: &JobId,
        token: &ReservationToken,
    ) -> QueueResult<AckOutcome> {
        let now = Utc::now();
        let mut shards = self.shards.write();
        let Some(shard) = shards.get_mut(scope) else {
            return Ok(AckOutcome::AlreadyGone);
        };

        if let Some(job) = shard.jobs.get(job_id) {
            if matches!(job.state, JobState::Cancelled { .. }) {
                return Err(QueueError::JobCancelled);
            }
        }

        let Some(reservation) = shard.reserved.get(job_id) else {
            return Ok(AckOutcome::AlreadyGone);
        };
        if &reservation.token != token {
            return Err(QueueError::InvalidReservation);
        }
        if reservation.deadline < now {
            return Err(QueueError::ReservationExpired);
        }

        shard.reserved.remove(job_id);
        shard.jobs.remove(job_id);
        shard.total_acked += 1;
        drop(shards);

        self.acks.fetch_add(1, Ordering::Relaxed);
        self.emit(JobEvent::Acked {
            job_id: job_id.clone(),
            tenant_id: scope.tenant.to_string(),
            queue: scope.queue.clone(),
            at: now,
        });
        Ok(AckOutcome::Acked)
    }

    async fn nack(
        &self,
        scope: &QueueScope,
        job_id: &JobId,
        token: &ReservationToken,
        disposition: NackDisposition,
    ) -> QueueResult<()> {
        let now = Utc::now();
        let mut shards = self.shards.write();
        let shard = shards
            .get_mut(scope)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        if let Some(job) = shard.jobs.get(job_id) {
            if matches!(job.state, JobState::Cancelled { .. }) {
                return Err(QueueError::JobCancelled);
            }
        }

        let reservation = shard
            .reserved
            .get(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        if &reservation.token != token {
            return Err(QueueError::InvalidReservation);
        }
        if reservation.deadline < now {
            return Err(QueueError::ReservationExpired);
        }

        shard.reserved.remove(job_id);
        let job = shard
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        job.record_failure();

        let event = match disposition {
            NackDisposition::Retry { retry_at, error } if job.attempts < job.max_attempts => {
                job.schedule_retry(retry_at, error.clone());
                shard.delayed.push((retry_at, job_id.clone()));
                JobEvent::Retried {
                    job_id: job_id.clone(),
                    tenant_id: scope.tenant.to_string(),
                    queue: scope.queue.clone(),
                    retry_at,
                    error,
                    at: now,
                }
            }
            NackDisposition::Retry { error, .. } => {
                let reason = format!("max attempts exhausted: {}", error);
                job.dead_letter(reason.clone());
                shard.dlq.push_back(job_id.clone());
                JobEvent::DeadLettered {
                    job_id: job_id.clone(),
                    tenant_id: scope.tenant.to_string(),
                    queue: scope.queue.clone(),
                    reason,
                    at: now,
                }
            }
            NackDisposition::DeadLetter { reason } => {
                job.dead_letter(reason.clone());
                shard.dlq.push_back(job_id.clone());
                JobEvent::DeadLettered {
                    job_id: job_id.clone(),
                    tenant_id: scope.tenant.to_string(),
                    queue: scope.queue.clone(),
                    reason,
                    at: now,
                }
            }
        };
        drop(shards);

        self.nacks.fetch_add(1, Ordering::Relaxed);
        self.emit(event);
        Ok(())
    }

    async fn extend(
        &self,
        scope: &QueueScope,
        job_id: &JobId,
        token: &ReservationToken,
        extend_by: Duration,
    ) -> QueueResult<()> {
        let mut shards = self.shards.write();
        let shard = shards
            .get_mut(scope)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        if let Some(job) = shard.jobs.get(job_id) {
            if matches!(job.state, JobState::Cancelled { .. }) {
                return Err(QueueError::JobCancelled);
            }
        }

        let reservation = shard
            .reserved
            .get_mut(job_id)
            .ok_or(QueueError::InvalidReservation)?;
        if &reservation.token != token {
            return Err(QueueError::InvalidReservation);
        }

        let extra = chrono::Duration::from_std(extend_by)
            .map_err(|e| QueueError::Validation(format!("extension out of range: {}", e)))?;
        reservation.deadline += extra;
        let deadline = reservation.deadline;
        if let Some(job) = shard.jobs.get_mut(job_id) {
            if let JobState::Reserved { deadline: d, .. } = &mut job.state {
                *d = deadline;
            }
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn cancel(&self, scope: &QueueScope, job_id: &JobId) -> QueueResult<bool> {
        let now = Utc::now();
        let mut shards = self.shards.write();
        let shard = shards
            .get_mut(scope)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        let job = shard
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        if job.state.is_terminal() {
            return Ok(false);
        }
        job.cancel();
        for queue in shard.pending.values_mut() {
            queue.retain(|id| id != job_id);
        }
        shard.delayed.retain(|(_, id)| id != job_id);
        drop(shards);

        self.emit(JobEvent::Cancelled {
            job_id: job_id.clone(),
            tenant_id: scope.tenant.to_string(),
            queue: scope.queue.clone(),
            at: now,
        });
        Ok(true)
    }

    async fn move_job(
        &self,
        scope: &QueueScope,
        job_id: &JobId,
        target: MoveTarget,
    ) -> QueueResult<()> {
        let now = Utc::now();
        let mut shards = self.shards.write();
        let shard = shards
            .get_mut(scope)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        if shard.reserved.contains_key(job_id) {
            return Err(QueueError::Conflict(format!(
                "job {} is reserved and cannot be moved",
                job_id
            )));
        }
        let mut job = shard
            .jobs
            .remove(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        for queue in shard.pending.values_mut() {
            queue.retain(|id| id != job_id);
        }
        shard.delayed.retain(|(_, id)| id != job_id);
        shard.dlq.retain(|id| id != job_id);

        match target {
            MoveTarget::DeadLetter { reason } => {
                job.dead_letter(reason.clone());
                shard.dlq.push_back(job_id.clone());
                shard.jobs.insert(job_id.clone(), job);
                drop(shards);
                self.emit(JobEvent::DeadLettered {
                    job_id: job_id.clone(),
                    tenant_id: scope.tenant.to_string(),
                    queue: scope.queue.clone(),
                    reason,
                    at: now,
                });
            }
            MoveTarget::Pending { queue, priority } => {
                if let Some(p) = priority {
                    job.priority = p;
                }
                job.state = JobState::Pending;
                job.updated_at = now;
                let dest_scope = match queue {
                    Some(q) if q != scope.queue => {
                        job.queue = q.clone();
                        QueueScope::new(scope.tenant.clone(), q)
                    }
                    _ => scope.clone(),
                };
                let priority = job.priority;
                let id = job.id.clone();
                let dest = shards.entry(dest_scope).or_default();
                dest.pending.entry(priority).or_default().push_back(id);
                dest.jobs.insert(job_id.clone(), job);
            }
        }
        Ok(())
    }

    async fn reclaim_expired(&self, scope: &QueueScope, limit: usize) -> QueueResult<u64> {
        let now = Utc::now();
        let mut shards = self.shards.write();
        let Some(shard) = shards.get_mut(scope) else {
            return Ok(0);
        };

        let expired: Vec<JobId> = shard
            .reserved
            .iter()
            .filter(|(_, r)| r.deadline < now)
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect();

        let mut events = Vec::with_capacity(expired.len());
        for id in &expired {
            shard.reserved.remove(id);
            let Some(job) = shard.jobs.get_mut(id) else {
                continue;
            };
            job.record_failure();
            if job.attempts >= job.max_attempts {
                let reason = "visibility timeout exceeded, max attempts exhausted".to_string();
                job.dead_letter(reason.clone());
                shard.dlq.push_back(id.clone());
                events.push(JobEvent::DeadLettered {
                    job_id: id.clone(),
                    tenant_id: scope.tenant.to_string(),
                    queue: scope.queue.clone(),
                    reason,
                    at: now,
                });
            } else {
                job.state = JobState::Pending;
                job.reservation = None;
                job.last_error = Some("visibility timeout exceeded".to_string());
                job.updated_at = now;
                // Reclaimed jobs rejoin at the head of their class
                shard
                    .pending
                    .entry(job.priority)
                    .or_default()
                    .push_front(id.clone());
            }
        }
        let reclaimed = expired.len() as u64;
        drop(shards);

        self.reclaims.fetch_add(reclaimed, Ordering::Relaxed);
        for event in events {
            self.emit(event);
        }
        Ok(reclaimed)
    }

    async fn promote_due(&self, scope: &QueueScope, limit: usize) -> QueueResult<u64> {
        let now = Utc::now();
        let mut shards = self.shards.write();
        let Some(shard) = shards.get_mut(scope) else {
            return Ok(0);
        };
        Ok(Self::promote_locked(shard, now, limit))
    }

    async fn purge(&self, scope: &QueueScope, job_id: &JobId) -> QueueResult<bool> {
        let mut shards = self.shards.write();
        let Some(shard) = shards.get_mut(scope) else {
            return Ok(false);
        };
        if shard.reserved.contains_key(job_id) {
            return Err(QueueError::Conflict(format!(
                "job {} is reserved and cannot be purged",
                job_id
            )));
        }
        let existed = shard.jobs.remove(job_id).is_some();
        for queue in shard.pending.values_mut() {
            queue.retain(|id| id != job_id);
        }
        shard.delayed.retain(|(_, id)| id != job_id);
        shard.dlq.retain(|id| id != job_id);
        Ok(existed)
    }

    async fn purge_queue(&self, scope: &QueueScope) -> QueueResult<u64> {
        let mut shards = self.shards.write();
        let Some(shard) = shards.get_mut(scope) else {
            return Ok(0);
        };
        let removed = shard.jobs.len() as u64;
        shard.jobs.clear();
        shard.pending.clear();
        shard.delayed.clear();
        shard.reserved.clear();
        shard.dlq.clear();
        Ok(removed)
    }

    async fn counts(&self, scope: &QueueScope) -> QueueResult<CountsSnapshot> {
        let shards = self.shards.read();
        let Some(shard) = shards.get(scope) else {
            return Ok(CountsSnapshot::default());
        };
        let mut pending = PendingCounts::default();
        for priority in Priority::ascending() {
            let len = shard
                .pending
                .get(priority)
                .map(|q| q.len() as u64)
                .unwrap_or(0);
            pending.set(*priority, len);
        }
        Ok(CountsSnapshot {
            pending,
            delayed: shard.delayed.len() as u64,
            reserved: shard.reserved.len() as u64,
            dead_lettered: shard.dlq.len() as u64,
            total_enqueued: shard.total_enqueued,
            total_acked: shard.total_acked,
        })
    }

    async fn peek(
        &self,
        scope: &QueueScope,
        source: JobSource,
        offset: usize,
        limit: usize,
    ) -> QueueResult<Vec<Job>> {
        let shards = self.shards.read();
        let Some(shard) = shards.get(scope) else {
            return Ok(Vec::new());
        };
        let ids: Vec<JobId> = match source {
            JobSource::Pending => Priority::descending()
                .iter()
                .filter_map(|p| shard.pending.get(p))
                .flatten()
                .cloned()
                .collect(),
            JobSource::Reserved => shard.reserved.keys().cloned().collect(),
            JobSource::DeadLetter => shard.dlq.iter().cloned().collect(),
        };
        Ok(ids
            .into_iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| shard.jobs.get(&id).cloned())
            .collect())
    }

    async fn get_job(&self, scope: &QueueScope, job_id: &JobId) -> QueueResult<Job> {
        let shards = self.shards.read();
        shards
            .get(scope)
            .and_then(|shard| shard.jobs.get(job_id))
            .cloned()
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ATOMIC_ACK
            | Capabilities::TRANSACTIONS
            | Capabilities::PRIORITIZATION
            | Capabilities::BATCH
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            enqueues: self.enqueues.load(Ordering::Relaxed),
            reserves: self.reserves.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            nacks: self.nacks.load(Ordering::Relaxed),
            reclaims: self.reclaims.load(Ordering::Relaxed),
            errors: 0,
        }
    }

    async fn health(&self) -> BackendHealth {
        BackendHealth::healthy()
    }

    fn events(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoist_core::{EnqueueOptions, TenantId};

    fn scope() -> QueueScope {
        QueueScope::new(TenantId::new("test-tenant").unwrap(), "default")
    }

    fn job(opts: EnqueueOptions) -> Job {
        Job::new(
            TenantId::new("test-tenant").unwrap(),
            "default",
            b"payload".to_vec(),
            opts,
        )
    }

    fn reserve_req() -> ReserveRequest {
        ReserveRequest {
            worker_id: WorkerId::from("w1"),
            visibility_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn enqueue_reserve_ack() {
        let backend = MemoryBackend::new();
        let j = job(EnqueueOptions::new());
        let id = j.id.clone();
        backend.enqueue(&j).await.unwrap();

        let reserved = backend
            .reserve(&scope(), &reserve_req())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reserved.job.id, id);
        assert_eq!(reserved.job.attempts, 0);

        let outcome = backend
            .ack(&scope(), &id, &reserved.token)
            .await
            .unwrap();
        assert_eq!(outcome, AckOutcome::Acked);

        let counts = backend.counts(&scope()).await.unwrap();
        assert_eq!(counts.pending.total(), 0);
        assert_eq!(counts.reserved, 0);
        assert_eq!(counts.total_acked, 1);
    }

    #[tokio::test]
    async fn ack_is_idempotent() {
        let backend = MemoryBackend::new();
        let j = job(EnqueueOptions::new());
        let id = j.id.clone();
        backend.enqueue(&j).await.unwrap();
        let reserved = backend
            .reserve(&scope(), &reserve_req())
            .await
            .unwrap()
            .unwrap();

        backend.ack(&scope(), &id, &reserved.token).await.unwrap();
        let second = backend.ack(&scope(), &id, &reserved.token).await.unwrap();
        assert_eq!(second, AckOutcome::AlreadyGone);
    }

    #[tokio::test]
    async fn stale_token_rejected() {
        let backend = MemoryBackend::new();
        let j = job(EnqueueOptions::new());
        let id = j.id.clone();
        backend.enqueue(&j).await.unwrap();
        backend
            .reserve(&scope(), &reserve_req())
            .await
            .unwrap()
            .unwrap();

        let result = backend
            .ack(&scope(), &id, &ReservationToken::from("stale"))
            .await;
        assert!(matches!(result, Err(QueueError::InvalidReservation)));
    }

    #[tokio::test]
    async fn priority_order_then_fifo() {
        let backend = MemoryBackend::new();
        let low = job(EnqueueOptions::new().with_priority(Priority::Low));
        let first_normal = job(EnqueueOptions::new());
        let second_normal = job(EnqueueOptions::new());
        let critical = job(EnqueueOptions::new().with_priority(Priority::Critical));
        for j in [&low, &first_normal, &second_normal, &critical] {
            backend.enqueue(j).await.unwrap();
        }

        let mut order = Vec::new();
        for _ in 0..4 {
            let reserved = backend
                .reserve(&scope(), &reserve_req())
                .await
                .unwrap()
                .unwrap();
            order.push(reserved.job.id.clone());
        }

        assert_eq!(
            order,
            vec![
                critical.id.clone(),
                first_normal.id.clone(),
                second_normal.id.clone(),
                low.id.clone()
            ]
        );
    }

    #[tokio::test]
    async fn expired_reservation_reclaims_with_failure_counted() {
        let backend = MemoryBackend::new();
        let j = job(EnqueueOptions::new());
        let id = j.id.clone();
        backend.enqueue(&j).await.unwrap();
        backend
            .reserve(&scope(), &reserve_req())
            .await
            .unwrap()
            .unwrap();

        backend.force_expire(&scope(), &id);
        let reclaimed = backend.reclaim_expired(&scope(), 100).await.unwrap();
        assert_eq!(reclaimed, 1);

        let again = backend
            .reserve(&scope(), &reserve_req())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.job.id, id);
        assert_eq!(again.job.attempts, 1);
    }

    #[tokio::test]
    async fn nack_exhaustion_dead_letters() {
        let backend = MemoryBackend::new();
        let j = job(EnqueueOptions::new().with_max_attempts(3));
        let id = j.id.clone();
        backend.enqueue(&j).await.unwrap();

        for attempt in 1..=3u32 {
            let reserved = backend
                .reserve(&scope(), &reserve_req())
                .await
                .unwrap()
                .unwrap();
            backend
                .nack(
                    &scope(),
                    &id,
                    &reserved.token,
                    NackDisposition::Retry {
                        retry_at: Utc::now() - chrono::Duration::seconds(1),
                        error: format!("boom {}", attempt),
                    },
                )
                .await
                .unwrap();
        }

        // Third nack exhausted attempts
        assert!(backend.reserve(&scope(), &reserve_req()).await.unwrap().is_none());
        let counts = backend.counts(&scope()).await.unwrap();
        assert_eq!(counts.dead_lettered, 1);
        let dead = backend.get_job(&scope(), &id).await.unwrap();
        assert!(matches!(dead.state, JobState::DeadLettered { .. }));
        assert_eq!(dead.attempts, 3);
    }

    #[tokio::test]
    async fn cancel_wins_over_ack() {
        let backend = MemoryBackend::new();
        let j = job(EnqueueOptions::new());
        let id = j.id.clone();
        backend.enqueue(&j).await.unwrap();
        let reserved = backend
            .reserve(&scope(), &reserve_req())
            .await
            .unwrap()
            .unwrap();

        assert!(backend.cancel(&scope(), &id).await.unwrap());
        let result = backend.ack(&scope(), &id, &reserved.token).await;
        assert!(matches!(result, Err(QueueError::JobCancelled)));
    }

    #[tokio::test]
    async fn delayed_job_not_reservable_until_due() {
        let backend = MemoryBackend::new();
        let mut opts = EnqueueOptions::new();
        opts.run_at = Some(Utc::now() + chrono::Duration::minutes(10));
        let j = job(opts);
        let id = j.id.clone();
        backend.enqueue(&j).await.unwrap();

        assert!(backend.reserve(&scope(), &reserve_req()).await.unwrap().is_none());

        backend.force_due(&scope(), &id);
        let reserved = backend.reserve(&scope(), &reserve_req()).await.unwrap();
        assert_eq!(reserved.unwrap().job.id, id);
    }

    #[tokio::test]
    async fn move_dead_letter_back_to_pending() {
        let backend = MemoryBackend::new();
        let j = job(EnqueueOptions::new().with_max_attempts(1));
        let id = j.id.clone();
        backend.enqueue(&j).await.unwrap();
        let reserved = backend
            .reserve(&scope(), &reserve_req())
            .await
            .unwrap()
            .unwrap();
        backend
            .nack(
                &scope(),
                &id,
                &reserved.token,
                NackDisposition::DeadLetter {
                    reason: "poison".to_string(),
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
                    priority: Some(Priority::High),
                },
            )
            .await
            .unwrap();

        let counts = backend.counts(&scope()).await.unwrap();
        assert_eq!(counts.dead_lettered, 0);
        assert_eq!(counts.pending.high, 1);
    }

    #[tokio::test]
    async fn tenant_scopes_are_disjoint() {
        let backend = MemoryBackend::new();
        let j = job(EnqueueOptions::new());
        backend.enqueue(&j).await.unwrap();

        let other = QueueScope::new(TenantId::new("other").unwrap(), "default");
        assert!(backend.reserve(&other, &reserve_req()).await.unwrap().is_none());
        assert_eq!(backend.counts(&other).await.unwrap().pending.total(), 0);
    }

    #[tokio::test]
    async fn conservation_under_mixed_operations() {
        let backend = MemoryBackend::new();
        let mut ids = Vec::new();
        for i in 0..10 {
            let j = job(EnqueueOptions::new().with_max_attempts(2));
            ids.push(j.id.clone());
            backend.enqueue(&j).await.unwrap();
            let _ = i;
        }

        // Ack half, nack-to-dlq two, leave the rest pending or reserved
        for i in 0..5 {
            let reserved = backend
                .reserve(&scope(), &reserve_req())
                .await
                .unwrap()
                .unwrap();
            if i < 3 {
                backend
                    .ack(&scope(), &reserved.job.id.clone(), &reserved.token)
                    .await
                    .unwrap();
            } else {
                backend
                    .nack(
                        &scope(),
                        &reserved.job.id.clone(),
                        &reserved.token,
                        NackDisposition::DeadLetter {
                            reason: "x".to_string(),
                        },
                    )
                    .await
                    .unwrap();
            }
        }

        let counts = backend.counts(&scope()).await.unwrap();
        let accounted = counts.total_acked
            + counts.pending.total()
            + counts.delayed
            + counts.reserved
            + counts.dead_lettered;
        assert_eq!(counts.total_enqueued, accounted);
    }
}
