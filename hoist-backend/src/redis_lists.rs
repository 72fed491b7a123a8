//! Redis Lists backend.
//!
//! Pending jobs live in one list per priority class; job bodies in a hash;
//! reservations in a deadline-scored sorted set with a lease hash carrying
//! the fencing token; delayed and backing-off jobs in a due-time sorted set.
//! Every multi-key mutation runs as a single Lua script, so reserve, ack,
//! nack, reclaim and moves are atomic. Visibility reclaim is driven by the
//! sweeper calling [`StorageBackend::reclaim_expired`].
//!
//! Does not advertise `consumer_groups` or `replay`; clustering requires the
//! hash-tagged key layout so each scope's keys share a slot.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use hoist_core::{
    BackendConfig, Capabilities, Job, JobEvent, JobId, JobState, PendingCounts, Priority,
    QueueError, QueueResult, ReservationToken, ReservedJob, WorkerId,
};

use crate::backend::{
    AckOutcome, BackendHealth, BackendStats, CountsSnapshot, JobSource, MoveTarget,
    NackDisposition, QueueScope, ReserveRequest, StorageBackend,
};
use crate::keys::KeySpace;
use crate::registry::BackendFactory;

/// Promote due delayed members, then pop the first eligible id from the
/// highest-priority list and reserve it.
///
/// KEYS: delayed, jobs, reserved, leases, proc, p:critical, p:high,
///       p:normal, p:low, cancelled
/// ARGV: now_ms, deadline_ms, token, worker_id, promote_limit
const RESERVE_SCRIPT: &str = r#"
local listmap = {['4']=KEYS[6], ['3']=KEYS[7], ['2']=KEYS[8], ['1']=KEYS[9]}
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[5]))
for _, member in ipairs(due) do
  local sep = string.find(member, '|', 1, true)
  local prio = string.sub(member, 1, sep - 1)
  local id = string.sub(member, sep + 1)
  redis.call('ZREM', KEYS[1], member)
  redis.call('LPUSH', listmap[prio], id)
end
for i = 6, 9 do
  local id = redis.call('LPOP', KEYS[i])
  while id do
    if redis.call('SISMEMBER', KEYS[10], id) == 1 then
      redis.call('SREM', KEYS[10], id)
    else
      local body = redis.call('HGET', KEYS[2], id)
      if body then
        redis.call('ZADD', KEYS[3], ARGV[2], id)
        redis.call('HSET', KEYS[4], id, ARGV[3] .. '|' .. ARGV[4])
        redis.call('RPUSH', KEYS[5], id)
        return {id, body}
      end
    end
    id = redis.call('LPOP', KEYS[i])
  end
end
return false
"#;

/// KEYS: reserved, leases, jobs, attempts, errors, counters, cancelled
/// ARGV: id, token, now_ms, proc_prefix
const ACK_SCRIPT: &str = r#"
local id = ARGV[1]
if redis.call('SISMEMBER', KEYS[7], id) == 1 then return 'cancelled' end
local score = redis.call('ZSCORE', KEYS[1], id)
if not score then return 'gone' end
local lease = redis.call('HGET', KEYS[2], id)
if not lease then return 'gone' end
local sep = string.find(lease, '|', 1, true)
if string.sub(lease, 1, sep - 1) ~= ARGV[2] then return 'badtoken' end
if tonumber(score) < tonumber(ARGV[3]) then return 'expired' end
local worker = string.sub(lease, sep + 1)
redis.call('ZREM', KEYS[1], id)
redis.call('HDEL', KEYS[2], id)
redis.call('HDEL', KEYS[3], id)
redis.call('HDEL', KEYS[4], id)
redis.call('HDEL', KEYS[5], id)
redis.call('LREM', ARGV[4] .. worker, 0, id)
redis.call('HINCRBY', KEYS[6], 'acked', 1)
return 'acked'
"#;

/// KEYS: reserved, leases, jobs, attempts, errors, delayed, dlq, dlqmeta,
///       cancelled
/// ARGV: id, token, now_ms, mode, retry_at_ms, error, max_attempts,
///       priority, proc_prefix
const NACK_SCRIPT: &str = r#"
local id = ARGV[1]
if redis.call('SISMEMBER', KEYS[9], id) == 1 then return 'cancelled' end
local score = redis.call('ZSCORE', KEYS[1], id)
if not score then return 'gone' end
local lease = redis.call('HGET', KEYS[2], id)
if not lease then return 'gone' end
local sep = string.find(lease, '|', 1, true)
if string.sub(lease, 1, sep - 1) ~= ARGV[2] then return 'badtoken' end
if tonumber(score) < tonumber(ARGV[3]) then return 'expired' end
local worker = string.sub(lease, sep + 1)
redis.call('ZREM', KEYS[1], id)
redis.call('HDEL', KEYS[2], id)
redis.call('LREM', ARGV[9] .. worker, 0, id)
local attempts = redis.call('HINCRBY', KEYS[4], id, 1)
if ARGV[4] == 'retry' and attempts < tonumber(ARGV[7]) then
  redis.call('HSET', KEYS[5], id, ARGV[6])
  redis.call('ZADD', KEYS[6], tonumber(ARGV[5]), ARGV[8] .. '|' .. id)
  return 'retry'
end
redis.call('RPUSH', KEYS[7], id)
redis.call('HSET', KEYS[8], id, cjson.encode({reason=ARGV[6], at=tonumber(ARGV[3]), attempts=attempts}))
return 'dead'
"#;

/// KEYS: reserved, leases, cancelled
/// ARGV: id, token, extend_ms
const EXTEND_SCRIPT: &str = r#"
local id = ARGV[1]
if redis.call('SISMEMBER', KEYS[3], id) == 1 then return 'cancelled' end
local score = redis.call('ZSCORE', KEYS[1], id)
if not score then return 'gone' end
local lease = redis.call('HGET', KEYS[2], id)
if not lease then return 'gone' end
local sep = string.find(lease, '|', 1, true)
if string.sub(lease, 1, sep - 1) ~= ARGV[2] then return 'badtoken' end
redis.call('ZADD', KEYS[1], 'XX', tonumber(score) + tonumber(ARGV[3]), id)
return 'extended'
"#;

/// KEYS: reserved, leases, jobs, attempts, dlq, dlqmeta, p:critical,
///       p:high, p:normal, p:low
/// ARGV: now_ms, limit, proc_prefix
const RECLAIM_SCRIPT: &str = r#"
local listmap = {critical=KEYS[7], high=KEYS[8], normal=KEYS[9], low=KEYS[10]}
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local n = 0
for _, id in ipairs(expired) do
  local lease = redis.call('HGET', KEYS[2], id)
  redis.call('ZREM', KEYS[1], id)
  redis.call('HDEL', KEYS[2], id)
  if lease then
    local sep = string.find(lease, '|', 1, true)
    redis.call('LREM', ARGV[3] .. string.sub(lease, sep + 1), 0, id)
  end
  local body = redis.call('HGET', KEYS[3], id)
  if body then
    local job = cjson.decode(body)
    local attempts = redis.call('HINCRBY', KEYS[4], id, 1)
    if attempts >= job.max_attempts then
      redis.call('RPUSH', KEYS[5], id)
      redis.call('HSET', KEYS[6], id, cjson.encode({reason='visibility timeout exceeded, max attempts exhausted', at=tonumber(ARGV[1]), attempts=attempts}))
    else
      redis.call('LPUSH', listmap[job.priority], id)
    end
    n = n + 1
  end
end
return n
"#;

/// KEYS: jobs, delayed, counters, pending
/// ARGV: id, body, now_ms, run_at_ms, priority
const ENQUEUE_SCRIPT: &str = r#"
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HINCRBY', KEYS[3], 'enqueued', 1)
if tonumber(ARGV[4]) > tonumber(ARGV[3]) then
  redis.call('ZADD', KEYS[2], tonumber(ARGV[4]), ARGV[5] .. '|' .. ARGV[1])
else
  redis.call('RPUSH', KEYS[4], ARGV[1])
end
return 1
"#;

/// KEYS: jobs, attempts, errors, delayed, dlqmeta, cancelled, reserved,
///       p:critical, p:high, p:normal, p:low
/// ARGV: id, priority
const CANCEL_SCRIPT: &str = r#"
local id = ARGV[1]
local body = redis.call('HGET', KEYS[1], id)
if not body then return 'missing' end
if redis.call('HEXISTS', KEYS[5], id) == 1 then return 'terminal' end
if redis.call('ZSCORE', KEYS[7], id) then
  redis.call('SADD', KEYS[6], id)
  return 'cancelled'
end
for i = 8, 11 do
  if redis.call('LREM', KEYS[i], 0, id) > 0 then
    redis.call('HDEL', KEYS[1], id)
    redis.call('HDEL', KEYS[2], id)
    redis.call('HDEL', KEYS[3], id)
    return 'cancelled'
  end
end
if redis.call('ZREM', KEYS[4], ARGV[2] .. '|' .. id) > 0 then
  redis.call('HDEL', KEYS[1], id)
  redis.call('HDEL', KEYS[2], id)
  redis.call('HDEL', KEYS[3], id)
  return 'cancelled'
end
return 'missing'
"#;

/// Same-scope move between structures. A reserved job cannot be moved.
/// KEYS: jobs, attempts, errors, delayed, dlq, dlqmeta, reserved,
///       p:critical, p:high, p:normal, p:low
/// ARGV: id, mode, reason_or_body, now_ms, priority
const MOVE_SCRIPT: &str = r#"
local id = ARGV[1]
if redis.call('ZSCORE', KEYS[7], id) then return 'reserved' end
local body = redis.call('HGET', KEYS[1], id)
if not body then return 'missing' end
local job = cjson.decode(body)
for i = 8, 11 do redis.call('LREM', KEYS[i], 0, id) end
redis.call('ZREM', KEYS[4], tostring(ARGV[5]) .. '|' .. id)
redis.call('LREM', KEYS[5], 0, id)
redis.call('HDEL', KEYS[6], id)
if ARGV[2] == 'dead' then
  local attempts = redis.call('HGET', KEYS[2], id) or 0
  redis.call('RPUSH', KEYS[5], id)
  redis.call('HSET', KEYS[6], id, cjson.encode({reason=ARGV[3], at=tonumber(ARGV[4]), attempts=tonumber(attempts)}))
else
  redis.call('HSET', KEYS[1], id, ARGV[3])
  local newjob = cjson.decode(ARGV[3])
  local listmap = {critical=KEYS[8], high=KEYS[9], normal=KEYS[10], low=KEYS[11]}
  redis.call('RPUSH', listmap[newjob.priority], id)
end
return 'moved'
"#;

/// Delete a job and its bookkeeping from every structure except the
/// reserved set (used when relocating to another queue).
/// KEYS: jobs, attempts, errors, delayed, dlq, dlqmeta, reserved,
///       p:critical, p:high, p:normal, p:low
/// ARGV: id, priority
const REMOVE_SCRIPT: &str = r#"
local id = ARGV[1]
if redis.call('ZSCORE', KEYS[7], id) then return 'reserved' end
if redis.call('HEXISTS', KEYS[1], id) == 0 then return 'missing' end
for i = 8, 11 do redis.call('LREM', KEYS[i], 0, id) end
redis.call('ZREM', KEYS[4], ARGV[2] .. '|' .. id)
redis.call('LREM', KEYS[5], 0, id)
redis.call('HDEL', KEYS[6], id)
redis.call('HDEL', KEYS[1], id)
redis.call('HDEL', KEYS[2], id)
redis.call('HDEL', KEYS[3], id)
return 'removed'
"#;

fn backend_err(err: redis::RedisError) -> QueueError {
    if err.is_io_error() || err.is_timeout() || err.is_connection_refusal() {
        QueueError::BackendUnavailable(err.to_string())
    } else {
        QueueError::Internal(err.to_string())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[derive(serde::Deserialize)]
struct DlqMeta {
    reason: String,
    at: i64,
    #[serde(default)]
    attempts: u32,
}

/// Lists-family backend over a shared connection manager
pub struct RedisListBackend {
    conn: ConnectionManager,
    keys: KeySpace,
    events: broadcast::Sender<JobEvent>,
    enqueue_script: Script,
    reserve_script: Script,
    ack_script: Script,
    nack_script: Script,
    extend_script: Script,
    reclaim_script: Script,
    cancel_script: Script,
    move_script: Script,
    remove_script: Script,
    enqueues: AtomicU64,
    reserves: AtomicU64,
    acks: AtomicU64,
    nacks: AtomicU64,
    reclaims: AtomicU64,
    errors: AtomicU64,
}

impl RedisListBackend {
    pub async fn connect(config: &BackendConfig) -> QueueResult<Self> {
        let url = config
            .addresses
            .first()
            .ok_or_else(|| QueueError::Validation("no redis address configured".to_string()))?;
        let client = redis::Client::open(url.as_str()).map_err(backend_err)?;
        let conn = ConnectionManager::new(client).await.map_err(backend_err)?;
        Ok(Self::with_connection(conn, KeySpace::default()))
    }

    pub fn with_connection(conn: ConnectionManager, keys: KeySpace) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            conn,
            keys,
            events,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            reserve_script: Script::new(RESERVE_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
            nack_script: Script::new(NACK_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
            reclaim_script: Script::new(RECLAIM_SCRIPT),
            cancel_script: Script::new(CANCEL_SCRIPT),
            move_script: Script::new(MOVE_SCRIPT),
            remove_script: Script::new(REMOVE_SCRIPT),
            enqueues: AtomicU64::new(0),
            reserves: AtomicU64::new(0),
            acks: AtomicU64::new(0),
            nacks: AtomicU64::new(0),
            reclaims: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    fn track<T>(&self, result: QueueResult<T>) -> QueueResult<T> {
        if result.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// The stored body is the job as enqueued; failure count and state are
    /// bookkeeping overlays applied here.
    fn materialize(&self, body: &str, attempts: u32, state: JobState) -> QueueResult<Job> {
        let mut job: Job = serde_json::from_str(body)
            .map_err(|e| QueueError::BackendCorrupt(format!("job body: {}", e)))?;
        job.attempts = attempts;
        job.state = state;
        Ok(job)
    }

    async fn attempts_for(&self, scope: &QueueScope, id: &str) -> QueueResult<u32> {
        let mut conn = self.conn.clone();
        let attempts: Option<u32> = conn
            .hget(self.keys.attempts(scope), id)
            .await
            .map_err(backend_err)?;
        Ok(attempts.unwrap_or(0))
    }

    async fn fetch_jobs(
        &self,
        scope: &QueueScope,
        ids: &[String],
        state_of: impl Fn(&str) -> JobState,
    ) -> QueueResult<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let bodies: Vec<Option<String>> = conn
            .hget(self.keys.jobs(scope), ids)
            .await
            .map_err(backend_err)?;
        let mut jobs = Vec::with_capacity(ids.len());
        for (id, body) in ids.iter().zip(bodies) {
            let Some(body) = body else { continue };
            let attempts = self.attempts_for(scope, id).await?;
            jobs.push(self.materialize(&body, attempts, state_of(id))?);
        }
        Ok(jobs)
    }
}

#[async_trait]
impl StorageBackend for RedisListBackend {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue))]
    async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        let scope = QueueScope::new(job.tenant_id.clone(), job.queue.clone());
        let mut stored = job.clone();
        stored.state = JobState::Pending;
        stored.attempts = 0;
        stored.reservation = None;
        let body = serde_json::to_string(&stored)?;
        let run_at_ms = job.run_at.map(|t| t.timestamp_millis()).unwrap_or(0);

        let mut conn = self.conn.clone();
        let result: QueueResult<i64> = self
            .enqueue_script
            .key(self.keys.jobs(&scope))
            .key(self.keys.delayed(&scope))
            .key(self.keys.counters(&scope))
            .key(self.keys.pending(&scope, job.priority))
            .arg(job.id.as_str())
            .arg(&body)
            .arg(now_ms())
            .arg(run_at_ms)
            .arg(job.priority.as_u8())
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err);
        self.track(result)?;

        self.enqueues.fetch_add(1, Ordering::Relaxed);
        self.emit(JobEvent::Enqueued {
            job_id: job.id.clone(),
            tenant_id: job.tenant_id.to_string(),
            queue: job.queue.clone(),
            priority: job.priority,
            at: Utc::now(),
        });
        Ok(())
    }

    #[instrument(skip(self, req), fields(scope = %scope, worker = %req.worker_id))]
    async fn reserve(
        &self,
        scope: &QueueScope,
        req: &ReserveRequest,
    ) -> QueueResult<Option<ReservedJob>> {
        let token = ReservationToken::new();
        let now = now_ms();
        let deadline_ms = now + req.visibility_timeout.as_millis() as i64;

        let mut invocation = self.reserve_script.prepare_invoke();
        invocation
            .key(self.keys.delayed(scope))
            .key(self.keys.jobs(scope))
            .key(self.keys.reserved(scope))
            .key(self.keys.leases(scope))
            .key(self.keys.processing(scope, req.worker_id.as_str()));
        for key in self.keys.pending_descending(scope) {
            invocation.key(key);
        }
        invocation
            .key(self.keys.cancelled(scope))
            .arg(now)
            .arg(deadline_ms)
            .arg(token.as_str())
            .arg(req.worker_id.as_str())
            .arg(128);

        let mut conn = self.conn.clone();
        let result: QueueResult<Option<(String, String)>> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err);
        let Some((id, body)) = self.track(result)? else {
            return Ok(None);
        };

        let deadline = ms_to_datetime(deadline_ms);
        let attempts = self.attempts_for(scope, &id).await?;
        let mut job = self.materialize(
            &body,
            attempts,
            JobState::Reserved {
                deadline,
                worker_id: req.worker_id.clone(),
            },
        )?;
        job.reservation = Some(token.clone());

        self.reserves.fetch_add(1, Ordering::Relaxed);
        self.emit(JobEvent::Reserved {
            job_id: job.id.clone(),
            tenant_id: scope.tenant.to_string(),
            queue: scope.queue.clone(),
            worker_id: req.worker_id.clone(),
            deadline,
            at: Utc::now(),
        });
        debug!(job_id = %job.id, "reserved job");
        Ok(Some(ReservedJob::new(job, token, deadline)))
    }

    async fn ack(
        &self,
        scope: &QueueScope,
        job_id: &JobId,
        token: &ReservationToken,
    ) -> QueueResult<AckOutcome> {
        let mut conn = self.conn.clone();
        let proc_prefix = format!("{}:proc:", self.keys.scope_prefix(scope));
        let result: QueueResult<String> = self
            .ack_script
            .key(self.keys.reserved(scope))
            .key(self.keys.leases(scope))
            .key(self.keys.jobs(scope))
            .key(self.keys.attempts(scope))
            .key(self.keys.errors(scope))
            .key(self.keys.counters(scope))
            .key(self.keys.cancelled(scope))
            .arg(job_id.as_str())
            .arg(token.as_str())
            .arg(now_ms())
            .arg(&proc_prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err);

        match self.track(result)?.as_str() {
            "acked" => {
                self.acks.fetch_add(1, Ordering::Relaxed);
                self.emit(JobEvent::Acked {
                    job_id: job_id.clone(),
                    tenant_id: scope.tenant.to_string(),
                    queue: scope.queue.clone(),
                    at: Utc::now(),
                });
                Ok(AckOutcome::Acked)
            }
            "gone" => Ok(AckOutcome::AlreadyGone),
            "cancelled" => Err(QueueError::JobCancelled),
            "badtoken" => Err(QueueError::InvalidReservation),
            "expired" => Err(QueueError::ReservationExpired),
            other => Err(QueueError::Internal(format!("ack returned {}", other))),
        }
    }

    async fn nack(
        &self,
        scope: &QueueScope,
        job_id: &JobId,
        token: &ReservationToken,
        disposition: NackDisposition,
    ) -> QueueResult<()> {
        let job = self.get_job(scope, job_id).await?;
        let (mode, retry_at_ms, error) = match &disposition {
            NackDisposition::Retry { retry_at, error } => {
                ("retry", retry_at.timestamp_millis(), error.clone())
            }
            NackDisposition::DeadLetter { reason } => ("dead", 0, reason.clone()),
        };

        let proc_prefix = format!("{}:proc:", self.keys.scope_prefix(scope));
        let mut conn = self.conn.clone();
        let result: QueueResult<String> = self
            .nack_script
            .key(self.keys.reserved(scope))
            .key(self.keys.leases(scope))
            .key(self.keys.jobs(scope))
            .key(self.keys.attempts(scope))
            .key(self.keys.errors(scope))
            .key(self.keys.delayed(scope))
            .key(self.keys.dlq(scope))
            .key(self.keys.dlq_meta(scope))
            .key(self.keys.cancelled(scope))
            .arg(job_id.as_str())
            .arg(token.as_str())
            .arg(now_ms())
            .arg(mode)
            .arg(retry_at_ms)
            .arg(&error)
            .arg(job.max_attempts)
            .arg(job.priority.as_u8())
            .arg(&proc_prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err);

        let outcome = self.track(result)?;
        self.nacks.fetch_add(1, Ordering::Relaxed);
        match outcome.as_str() {
            "retry" => {
                if let NackDisposition::Retry { retry_at, error } = disposition {
                    self.emit(JobEvent::Retried {
                        job_id: job_id.clone(),
                        tenant_id: scope.tenant.to_string(),
                        queue: scope.queue.clone(),
                        retry_at,
                        error,
                        at: Utc::now(),
                    });
                }
                Ok(())
            }
            "dead" => {
                self.emit(JobEvent::DeadLettered {
                    job_id: job_id.clone(),
                    tenant_id: scope.tenant.to_string(),
                    queue: scope.queue.clone(),
                    reason: error,
                    at: Utc::now(),
                });
                Ok(())
            }
            "gone" => Err(QueueError::JobNotFound(job_id.to_string())),
            "cancelled" => Err(QueueError::JobCancelled),
            "badtoken" => Err(QueueError::InvalidReservation),
            "expired" => Err(QueueError::ReservationExpired),
            other => Err(QueueError::Internal(format!("nack returned {}", other))),
        }
    }

    async fn extend(
        &self,
        scope: &QueueScope,
        job_id: &JobId,
        token: &ReservationToken,
        extend_by: Duration,
    ) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let result: QueueResult<String> = self
            .extend_script
            .key(self.keys.reserved(scope))
            .key(self.keys.leases(scope))
            .key(self.keys.cancelled(scope))
            .arg(job_id.as_str())
            .arg(token.as_str())
            .arg(extend_by.as_millis() as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err);

        match self.track(result)?.as_str() {
            "extended" => Ok(()),
            "gone" => Err(QueueError::InvalidReservation),
            "cancelled" => Err(QueueError::JobCancelled),
            "badtoken" => Err(QueueError::InvalidReservation),
            other => Err(QueueError::Internal(format!("extend returned {}", other))),
        }
    }

    async fn cancel(&self, scope: &QueueScope, job_id: &JobId) -> QueueResult<bool> {
        let job = self.get_job(scope, job_id).await?;
        if job.state.is_terminal() {
            return Ok(false);
        }

        let mut invocation = self.cancel_script.prepare_invoke();
        invocation
            .key(self.keys.jobs(scope))
            .key(self.keys.attempts(scope))
            .key(self.keys.errors(scope))
            .key(self.keys.delayed(scope))
            .key(self.keys.dlq_meta(scope))
            .key(self.keys.cancelled(scope))
            .key(self.keys.reserved(scope));
        for key in self.keys.pending_descending(scope) {
            invocation.key(key);
        }
        invocation.arg(job_id.as_str()).arg(job.priority.as_u8());

        let mut conn = self.conn.clone();
        let result: QueueResult<String> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err);

        match self.track(result)?.as_str() {
            "cancelled" => {
                self.emit(JobEvent::Cancelled {
                    job_id: job_id.clone(),
                    tenant_id: scope.tenant.to_string(),
                    queue: scope.queue.clone(),
                    at: Utc::now(),
                });
                Ok(true)
            }
            "terminal" => Ok(false),
            "missing" => Err(QueueError::JobNotFound(job_id.to_string())),
            other => Err(QueueError::Internal(format!("cancel returned {}", other))),
        }
    }

    async fn move_job(
        &self,
        scope: &QueueScope,
        job_id: &JobId,
        target: MoveTarget,
    ) -> QueueResult<()> {
        let job = self.get_job(scope, job_id).await?;

        // Cross-queue relocation: enqueue into the target scope first, then
        // remove from the source, so a crash duplicates instead of losing.
        if let MoveTarget::Pending {
            queue: Some(ref new_queue),
            priority,
        } = target
        {
            if new_queue != &scope.queue {
                let mut relocated = job.clone();
                relocated.queue = new_queue.clone();
                if let Some(p) = priority {
                    relocated.priority = p;
                }
                relocated.state = JobState::Pending;
                self.enqueue(&relocated).await?;
                return self.remove_from_scope(scope, job_id, job.priority).await;
            }
        }

        let (mode, payload) = match &target {
            MoveTarget::DeadLetter { reason } => ("dead", reason.clone()),
            MoveTarget::Pending { priority, .. } => {
                let mut updated = job.clone();
                if let Some(p) = priority {
                    updated.priority = *p;
                }
                updated.state = JobState::Pending;
                updated.reservation = None;
                ("pending", serde_json::to_string(&updated)?)
            }
        };

        let mut invocation = self.move_script.prepare_invoke();
        invocation
            .key(self.keys.jobs(scope))
            .key(self.keys.attempts(scope))
            .key(self.keys.errors(scope))
            .key(self.keys.delayed(scope))
            .key(self.keys.dlq(scope))
            .key(self.keys.dlq_meta(scope))
            .key(self.keys.reserved(scope));
        for key in self.keys.pending_descending(scope) {
            invocation.key(key);
        }
        invocation
            .arg(job_id.as_str())
            .arg(mode)
            .arg(&payload)
            .arg(now_ms())
            .arg(job.priority.as_u8());

        let mut conn = self.conn.clone();
        let result: QueueResult<String> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err);

        match self.track(result)?.as_str() {
            "moved" => Ok(()),
            "reserved" => Err(QueueError::Conflict(format!(
                "job {} is reserved and cannot be moved",
                job_id
            ))),
            "missing" => Err(QueueError::JobNotFound(job_id.to_string())),
            other => Err(QueueError::Internal(format!("move returned {}", other))),
        }
    }

    async fn reclaim_expired(&self, scope: &QueueScope, limit: usize) -> QueueResult<u64> {
        let proc_prefix = format!("{}:proc:", self.keys.scope_prefix(scope));
        let mut invocation = self.reclaim_script.prepare_invoke();
        invocation
            .key(self.keys.reserved(scope))
            .key(self.keys.leases(scope))
            .key(self.keys.jobs(scope))
            .key(self.keys.attempts(scope))
            .key(self.keys.dlq(scope))
            .key(self.keys.dlq_meta(scope));
        for key in self.keys.pending_descending(scope) {
            invocation.key(key);
        }
        invocation.arg(now_ms()).arg(limit).arg(&proc_prefix);

        let mut conn = self.conn.clone();
        let result: QueueResult<u64> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err);
        let reclaimed = self.track(result)?;
        self.reclaims.fetch_add(reclaimed, Ordering::Relaxed);
        Ok(reclaimed)
    }

    async fn promote_due(&self, scope: &QueueScope, limit: usize) -> QueueResult<u64> {
        // Promotion runs inside the reserve script; this standalone pass
        // exists for queues with no active consumers.
        let mut conn = self.conn.clone();
        let now = now_ms();
        let due: Vec<String> = conn
            .zrangebyscore_limit(self.keys.delayed(scope), "-inf", now, 0, limit as isize)
            .await
            .map_err(backend_err)?;
        let mut promoted = 0u64;
        for member in due {
            let Some((priority, id)) = crate::keys::parse_delayed_member(&member) else {
                continue;
            };
            let removed: i64 = conn
                .zrem(self.keys.delayed(scope), &member)
                .await
                .map_err(backend_err)?;
            if removed > 0 {
                let _: i64 = conn
                    .lpush(self.keys.pending(scope, priority), id)
                    .await
                    .map_err(backend_err)?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn purge(&self, scope: &QueueScope, job_id: &JobId) -> QueueResult<bool> {
        let job = match self.get_job(scope, job_id).await {
            Ok(job) => job,
            Err(QueueError::JobNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        self.remove_from_scope(scope, job_id, job.priority).await?;
        Ok(true)
    }

    async fn purge_queue(&self, scope: &QueueScope) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let total: u64 = conn
            .hlen(self.keys.jobs(scope))
            .await
            .map_err(backend_err)?;
        let mut keys = vec![
            self.keys.jobs(scope),
            self.keys.attempts(scope),
            self.keys.errors(scope),
            self.keys.delayed(scope),
            self.keys.reserved(scope),
            self.keys.leases(scope),
            self.keys.dlq(scope),
            self.keys.dlq_meta(scope),
            self.keys.cancelled(scope),
            self.keys.counters(scope),
        ];
        keys.extend(self.keys.pending_descending(scope));
        let _: i64 = conn.del(keys).await.map_err(backend_err)?;
        Ok(total)
    }

    async fn counts(&self, scope: &QueueScope) -> QueueResult<CountsSnapshot> {
        let mut conn = self.conn.clone();
        let mut pending = PendingCounts::default();
        for priority in Priority::ascending() {
            let len: u64 = conn
                .llen(self.keys.pending(scope, *priority))
                .await
                .map_err(backend_err)?;
            pending.set(*priority, len);
        }
        let delayed: u64 = conn
            .zcard(self.keys.delayed(scope))
            .await
            .map_err(backend_err)?;
        let reserved: u64 = conn
            .zcard(self.keys.reserved(scope))
            .await
            .map_err(backend_err)?;
        let dead_lettered: u64 = conn
            .llen(self.keys.dlq(scope))
            .await
            .map_err(backend_err)?;
        let total_enqueued: Option<u64> = conn
            .hget(self.keys.counters(scope), "enqueued")
            .await
            .map_err(backend_err)?;
        let total_acked: Option<u64> = conn
            .hget(self.keys.counters(scope), "acked")
            .await
            .map_err(backend_err)?;

        Ok(CountsSnapshot {
            pending,
            delayed,
            reserved,
            dead_lettered,
            total_enqueued: total_enqueued.unwrap_or(0),
            total_acked: total_acked.unwrap_or(0),
        })
    }

    async fn peek(
        &self,
        scope: &QueueScope,
        source: JobSource,
        offset: usize,
        limit: usize,
    ) -> QueueResult<Vec<Job>> {
        let mut conn = self.conn.clone();
        match source {
            JobSource::Pending => {
                let mut ids = Vec::new();
                for priority in Priority::descending() {
                    let chunk: Vec<String> = conn
                        .lrange(self.keys.pending(scope, *priority), 0, -1)
                        .await
                        .map_err(backend_err)?;
                    ids.extend(chunk);
                }
                let window: Vec<String> =
                    ids.into_iter().skip(offset).take(limit).collect();
                self.fetch_jobs(scope, &window, |_| JobState::Pending).await
            }
            JobSource::Reserved => {
                let entries: Vec<(String, i64)> = conn
                    .zrange_withscores(
                        self.keys.reserved(scope),
                        offset as isize,
                        (offset + limit) as isize - 1,
                    )
                    .await
                    .map_err(backend_err)?;
                let mut jobs = Vec::with_capacity(entries.len());
                for (id, deadline_ms) in entries {
                    let body: Option<String> = conn
                        .hget(self.keys.jobs(scope), &id)
                        .await
                        .map_err(backend_err)?;
                    let Some(body) = body else { continue };
                    let attempts = self.attempts_for(scope, &id).await?;
                    jobs.push(self.materialize(
                        &body,
                        attempts,
                        JobState::Reserved {
                            deadline: ms_to_datetime(deadline_ms),
                            worker_id: WorkerId::from("unknown"),
                        },
                    )?);
                }
                Ok(jobs)
            }
            JobSource::DeadLetter => {
                let ids: Vec<String> = conn
                    .lrange(
                        self.keys.dlq(scope),
                        offset as isize,
                        (offset + limit) as isize - 1,
                    )
                    .await
                    .map_err(backend_err)?;
                let mut jobs = Vec::with_capacity(ids.len());
                for id in ids {
                    let body: Option<String> = conn
                        .hget(self.keys.jobs(scope), &id)
                        .await
                        .map_err(backend_err)?;
                    let Some(body) = body else { continue };
                    let meta: Option<String> = conn
                        .hget(self.keys.dlq_meta(scope), &id)
                        .await
                        .map_err(backend_err)?;
                    let (state, attempts) = match meta
                        .as_deref()
                        .and_then(|m| serde_json::from_str::<DlqMeta>(m).ok())
                    {
                        Some(meta) => (
                            JobState::DeadLettered {
                                at: ms_to_datetime(meta.at),
                                reason: meta.reason,
                            },
                            meta.attempts,
                        ),
                        None => (
                            JobState::DeadLettered {
                                at: Utc::now(),
                                reason: "unknown".to_string(),
                            },
                            self.attempts_for(scope, &id).await?,
                        ),
                    };
                    jobs.push(self.materialize(&body, attempts, state)?);
                }
                Ok(jobs)
            }
        }
    }

    async fn get_job(&self, scope: &QueueScope, job_id: &JobId) -> QueueResult<Job> {
        let mut conn = self.conn.clone();
        let body: Option<String> = conn
            .hget(self.keys.jobs(scope), job_id.as_str())
            .await
            .map_err(backend_err)?;
        let body = body.ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        let attempts = self.attempts_for(scope, job_id.as_str()).await?;

        let cancelled: bool = conn
            .sismember(self.keys.cancelled(scope), job_id.as_str())
            .await
            .map_err(backend_err)?;
        if cancelled {
            return self.materialize(
                &body,
                attempts,
                JobState::Cancelled { at: Utc::now() },
            );
        }

        let deadline: Option<i64> = conn
            .zscore(self.keys.reserved(scope), job_id.as_str())
            .await
            .map_err(backend_err)?;
        if let Some(deadline_ms) = deadline {
            let lease: Option<String> = conn
                .hget(self.keys.leases(scope), job_id.as_str())
                .await
                .map_err(backend_err)?;
            let worker = lease
                .and_then(|l| l.split_once('|').map(|(_, w)| w.to_string()))
                .unwrap_or_else(|| "unknown".to_string());
            return self.materialize(
                &body,
                attempts,
                JobState::Reserved {
                    deadline: ms_to_datetime(deadline_ms),
                    worker_id: WorkerId::from(worker.as_str()),
                },
            );
        }

        let meta: Option<String> = conn
            .hget(self.keys.dlq_meta(scope), job_id.as_str())
            .await
            .map_err(backend_err)?;
        if let Some(meta) = meta.and_then(|m| serde_json::from_str::<DlqMeta>(&m).ok()) {
            return self.materialize(
                &body,
                meta.attempts.max(attempts),
                JobState::DeadLettered {
                    at: ms_to_datetime(meta.at),
                    reason: meta.reason,
                },
            );
        }

        self.materialize(&body, attempts, JobState::Pending)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::TRANSACTIONS
            | Capabilities::PERSISTENCE
            | Capabilities::CLUSTERING
            | Capabilities::TTL
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
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    async fn health(&self) -> BackendHealth {
        let mut conn = self.conn.clone();
        match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(_) => BackendHealth::healthy(),
            Err(e) => BackendHealth::unhealthy(e.to_string()),
        }
    }

    fn events(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }
}

impl RedisListBackend {
    async fn remove_from_scope(
        &self,
        scope: &QueueScope,
        job_id: &JobId,
        priority: Priority,
    ) -> QueueResult<()> {
        let mut invocation = self.remove_script.prepare_invoke();
        invocation
            .key(self.keys.jobs(scope))
            .key(self.keys.attempts(scope))
            .key(self.keys.errors(scope))
            .key(self.keys.delayed(scope))
            .key(self.keys.dlq(scope))
            .key(self.keys.dlq_meta(scope))
            .key(self.keys.reserved(scope));
        for key in self.keys.pending_descending(scope) {
            invocation.key(key);
        }
        invocation.arg(job_id.as_str()).arg(priority.as_u8());

        let mut conn = self.conn.clone();
        let result: QueueResult<String> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err);
        match self.track(result)?.as_str() {
            "removed" | "missing" => Ok(()),
            "reserved" => Err(QueueError::Conflict(format!(
                "job {} is reserved and cannot be moved",
                job_id
            ))),
            other => Err(QueueError::Internal(format!("remove returned {}", other))),
        }
    }
}

/// Factory for the registry
pub struct RedisListFactory;

#[async_trait]
impl BackendFactory for RedisListFactory {
    async fn create(
        &self,
        config: &BackendConfig,
    ) -> QueueResult<std::sync::Arc<dyn StorageBackend>> {
        Ok(std::sync::Arc::new(RedisListBackend::connect(config).await?))
    }

    fn kind(&self) -> &'static str {
        "redis_lists"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_cover_every_mutation_path() {
        // The scripts are the atomicity boundary; keep the key lists in the
        // headers in sync with the invocations above.
        for script in [
            RESERVE_SCRIPT,
            ACK_SCRIPT,
            NACK_SCRIPT,
            EXTEND_SCRIPT,
            RECLAIM_SCRIPT,
            ENQUEUE_SCRIPT,
            CANCEL_SCRIPT,
            MOVE_SCRIPT,
            REMOVE_SCRIPT,
        ] {
            assert!(script.contains("KEYS[1]"));
        }
    }

    #[test]
    fn ms_round_trip() {
        let now = Utc::now();
        let back = ms_to_datetime(now.timestamp_millis());
        assert!((back - now).num_milliseconds().abs() < 2);
    }

    #[test]
    fn dlq_meta_parses() {
        let meta: DlqMeta =
            serde_json::from_str(r#"{"reason":"boom","at":1700000000000,"attempts":3}"#).unwrap();
        assert_eq!(meta.reason, "boom");
        assert_eq!(meta.attempts, 3);
    }
}
