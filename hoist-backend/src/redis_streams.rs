//! Redis Streams backend.
//!
//! One stream per priority class with a shared consumer group. XREADGROUP
//! moves an entry into the pending-entries list atomically; a lease record
//! (deadline-scored set + fencing token hash) is written immediately after
//! and drives visibility reclaim, with an XAUTOCLAIM-style orphan sweep
//! catching entries that never got a lease. Ack is XACK + XDEL inside one
//! script, so delivery bookkeeping and removal are a single backend step.
//!
//! Advertises `atomic_ack`, `consumer_groups` and `replay`.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Script};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use hoist_core::{
    BackendConfig, Capabilities, Job, JobEvent, JobId, JobState, PendingCounts, Priority,
    QueueError, QueueResult, ReservationToken, ReservedJob,
};

use crate::backend::{
    AckOutcome, BackendHealth, BackendStats, CountsSnapshot, JobSource, MoveTarget,
    NackDisposition, QueueScope, ReserveRequest, StorageBackend,
};
use crate::keys::KeySpace;
use crate::registry::BackendFactory;

const GROUP: &str = "hoist";
const REAPER_CONSUMER: &str = "reaper";

/// KEYS: jobs, delayed, counters, entries, stream
/// ARGV: id, body, now_ms, run_at_ms, priority
const ENQUEUE_SCRIPT: &str = r#"
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HINCRBY', KEYS[3], 'enqueued', 1)
if tonumber(ARGV[4]) > tonumber(ARGV[3]) then
  redis.call('ZADD', KEYS[2], tonumber(ARGV[4]), ARGV[5] .. '|' .. ARGV[1])
else
  local entry = redis.call('XADD', KEYS[5], '*', 'id', ARGV[1])
  redis.call('HSET', KEYS[4], ARGV[1], ARGV[5] .. '|' .. entry)
end
return 1
"#;

/// Record the lease for an entry just read from the group.
/// KEYS: reserved, leases
/// ARGV: id, deadline_ms, token, worker
const LEASE_SCRIPT: &str = r#"
redis.call('ZADD', KEYS[1], tonumber(ARGV[2]), ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3] .. '|' .. ARGV[4])
return 1
"#;

/// KEYS: reserved, leases, jobs, attempts, errors, counters, cancelled,
///       entries, s:critical, s:high, s:normal, s:low
/// ARGV: id, token, now_ms
const ACK_SCRIPT: &str = r#"
local id = ARGV[1]
local streams = {['4']=KEYS[9], ['3']=KEYS[10], ['2']=KEYS[11], ['1']=KEYS[12]}
if redis.call('SISMEMBER', KEYS[7], id) == 1 then return 'cancelled' end
local score = redis.call('ZSCORE', KEYS[1], id)
if not score then return 'gone' end
local lease = redis.call('HGET', KEYS[2], id)
if not lease then return 'gone' end
local sep = string.find(lease, '|', 1, true)
if string.sub(lease, 1, sep - 1) ~= ARGV[2] then return 'badtoken' end
if tonumber(score) < tonumber(ARGV[3]) then return 'expired' end
local entry = redis.call('HGET', KEYS[8], id)
if entry then
  local esep = string.find(entry, '|', 1, true)
  local stream = streams[string.sub(entry, 1, esep - 1)]
  local eid = string.sub(entry, esep + 1)
  redis.call('XACK', stream, 'hoist', eid)
  redis.call('XDEL', stream, eid)
end
redis.call('ZREM', KEYS[1], id)
redis.call('HDEL', KEYS[2], id)
redis.call('HDEL', KEYS[3], id)
redis.call('HDEL', KEYS[4], id)
redis.call('HDEL', KEYS[5], id)
redis.call('HDEL', KEYS[8], id)
redis.call('HINCRBY', KEYS[6], 'acked', 1)
return 'acked'
"#;

/// KEYS: reserved, leases, jobs, attempts, errors, delayed, dlq, dlqmeta,
///       cancelled, entries, s:critical, s:high, s:normal, s:low
/// ARGV: id, token, now_ms, mode, retry_at_ms, error, max_attempts, priority
const NACK_SCRIPT: &str = r#"
local id = ARGV[1]
local streams = {['4']=KEYS[11], ['3']=KEYS[12], ['2']=KEYS[13], ['1']=KEYS[14]}
if redis.call('SISMEMBER', KEYS[9], id) == 1 then return 'cancelled' end
local score = redis.call('ZSCORE', KEYS[1], id)
if not score then return 'gone' end
local lease = redis.call('HGET', KEYS[2], id)
if not lease then return 'gone' end
local sep = string.find(lease, '|', 1, true)
if string.sub(lease, 1, sep - 1) ~= ARGV[2] then return 'badtoken' end
if tonumber(score) < tonumber(ARGV[3]) then return 'expired' end
local entry = redis.call('HGET', KEYS[10], id)
if entry then
  local esep = string.find(entry, '|', 1, true)
  local stream = streams[string.sub(entry, 1, esep - 1)]
  local eid = string.sub(entry, esep + 1)
  redis.call('XACK', stream, 'hoist', eid)
  redis.call('XDEL', stream, eid)
end
redis.call('ZREM', KEYS[1], id)
redis.call('HDEL', KEYS[2], id)
redis.call('HDEL', KEYS[10], id)
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

/// Reclaim expired leases: count the failure, then requeue a fresh stream
/// entry or dead-letter.
/// KEYS: reserved, leases, jobs, attempts, dlq, dlqmeta, entries,
///       s:critical, s:high, s:normal, s:low
/// ARGV: now_ms, limit
const RECLAIM_SCRIPT: &str = r#"
local streams = {critical=KEYS[8], high=KEYS[9], normal=KEYS[10], low=KEYS[11]}
local prios = {critical='4', high='3', normal='2', low='1'}
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local n = 0
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('HDEL', KEYS[2], id)
  local entry = redis.call('HGET', KEYS[7], id)
  local body = redis.call('HGET', KEYS[3], id)
  if body then
    local job = cjson.decode(body)
    local stream = streams[job.priority]
    if entry then
      local esep = string.find(entry, '|', 1, true)
      redis.call('XACK', stream, 'hoist', string.sub(entry, esep + 1))
      redis.call('XDEL', stream, string.sub(entry, esep + 1))
    end
    local attempts = redis.call('HINCRBY', KEYS[4], id, 1)
    if attempts >= job.max_attempts then
      redis.call('HDEL', KEYS[7], id)
      redis.call('RPUSH', KEYS[5], id)
      redis.call('HSET', KEYS[6], id, cjson.encode({reason='visibility timeout exceeded, max attempts exhausted', at=tonumber(ARGV[1]), attempts=attempts}))
    else
      local eid = redis.call('XADD', stream, '*', 'id', id)
      redis.call('HSET', KEYS[7], id, prios[job.priority] .. '|' .. eid)
    end
    n = n + 1
  end
end
return n
"#;

/// Promote due delayed members into their priority stream.
/// KEYS: delayed, entries, s:critical, s:high, s:normal, s:low
/// ARGV: now_ms, limit
const PROMOTE_SCRIPT: &str = r#"
local streams = {['4']=KEYS[3], ['3']=KEYS[4], ['2']=KEYS[5], ['1']=KEYS[6]}
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local n = 0
for _, member in ipairs(due) do
  local sep = string.find(member, '|', 1, true)
  local prio = string.sub(member, 1, sep - 1)
  local id = string.sub(member, sep + 1)
  redis.call('ZREM', KEYS[1], member)
  local eid = redis.call('XADD', streams[prio], '*', 'id', id)
  redis.call('HSET', KEYS[2], id, prio .. '|' .. eid)
  n = n + 1
end
return n
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

/// Streams-family backend over a shared connection manager
pub struct RedisStreamBackend {
    conn: ConnectionManager,
    keys: KeySpace,
    events: broadcast::Sender<JobEvent>,
    enqueue_script: Script,
    lease_script: Script,
    ack_script: Script,
    nack_script: Script,
    reclaim_script: Script,
    promote_script: Script,
    enqueues: AtomicU64,
    reserves: AtomicU64,
    acks: AtomicU64,
    nacks: AtomicU64,
    reclaims: AtomicU64,
    errors: AtomicU64,
}

impl RedisStreamBackend {
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
            lease_script: Script::new(LEASE_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
            nack_script: Script::new(NACK_SCRIPT),
            reclaim_script: Script::new(RECLAIM_SCRIPT),
            promote_script: Script::new(PROMOTE_SCRIPT),
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

    /// Create the consumer group on every priority stream; no-op once created
    async fn ensure_groups(&self, scope: &QueueScope) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        for stream in self.keys.streams_descending(scope) {
            let result: Result<(), redis::RedisError> = conn
                .xgroup_create_mkstream(&stream, GROUP, "0")
                .await;
            if let Err(e) = result {
                // BUSYGROUP means the group already exists
                if !e.to_string().contains("BUSYGROUP") {
                    return Err(backend_err(e));
                }
            }
        }
        Ok(())
    }

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

    /// Re-attach entries that made it into the pending-entries list but never
    /// received a lease (crash between read and lease write).
    async fn sweep_orphans(
        &self,
        scope: &QueueScope,
        min_idle: Duration,
        limit: usize,
    ) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let mut swept = 0u64;
        for stream in self.keys.streams_descending(scope) {
            let reply: redis::streams::StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
                .arg(&stream)
                .arg(GROUP)
                .arg(REAPER_CONSUMER)
                .arg(min_idle.as_millis() as i64)
                .arg("0-0")
                .arg("COUNT")
                .arg(limit)
                .query_async(&mut conn)
                .await
                .map_err(backend_err)?;
            for entry in reply.claimed {
                let Some(id) = entry_job_id(&entry) else { continue };
                let leased: Option<String> = conn
                    .hget(self.keys.leases(scope), &id)
                    .await
                    .map_err(backend_err)?;
                if leased.is_some() {
                    // Lease exists; the deadline sweep owns this entry
                    continue;
                }
                let _: i64 = conn
                    .xack(&stream, GROUP, &[&entry.id])
                    .await
                    .map_err(backend_err)?;
                let _: i64 = conn.xdel(&stream, &[&entry.id]).await.map_err(backend_err)?;
                let new_entry: String = conn
                    .xadd(&stream, "*", &[("id", id.as_str())])
                    .await
                    .map_err(backend_err)?;
                warn!(job_id = %id, "reattached orphaned stream entry");
                let priority = stream_priority_tag(&stream).unwrap_or('2');
                let _: i64 = conn
                    .hset(
                        self.keys.stream_entries(scope),
                        &id,
                        format!("{}|{}", priority, new_entry),
                    )
                    .await
                    .map_err(backend_err)?;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

fn entry_job_id(entry: &StreamId) -> Option<String> {
    entry.get::<String>("id")
}

fn stream_priority_tag(stream_key: &str) -> Option<char> {
    let name = stream_key.rsplit(':').next()?;
    let priority: Priority = name.parse().ok()?;
    char::from_digit(priority.as_u8() as u32, 10)
}

#[async_trait]
impl StorageBackend for RedisStreamBackend {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue))]
    async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        let scope = QueueScope::new(job.tenant_id.clone(), job.queue.clone());
        self.ensure_groups(&scope).await?;

        let mut stored = job.clone();
        stored.state = JobState::Pending;
        stored.attempts = 0;
        stored.reservation = None;
        let body = serde_json::to_string(&stored)?;
        let run_at_ms = job.run_at.map(|t| t.timestamp_millis()).unwrap_or(0);

        let mut conn = self.conn.clone();
        let result: Result<i64, redis::RedisError> = self
            .enqueue_script
            .key(self.keys.jobs(&scope))
            .key(self.keys.delayed(&scope))
            .key(self.keys.counters(&scope))
            .key(self.keys.stream_entries(&scope))
            .key(self.keys.stream(&scope, job.priority))
            .arg(job.id.as_str())
            .arg(&body)
            .arg(now_ms())
            .arg(run_at_ms)
            .arg(job.priority.as_u8())
            .invoke_async(&mut conn)
            .await;
        result.map_err(|e| {
            self.errors.fetch_add(1, Ordering::Relaxed);
            backend_err(e)
        })?;

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
        self.ensure_groups(scope).await?;
        self.promote_due(scope, 128).await?;

        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(GROUP, req.worker_id.as_str())
            .count(1);

        for stream in self.keys.streams_descending(scope) {
            let reply: StreamReadReply = conn
                .xread_options(&[&stream], &[">"], &opts)
                .await
                .map_err(backend_err)?;
            let entry = reply
                .keys
                .into_iter()
                .flat_map(|k| k.ids)
                .next();
            let Some(entry) = entry else { continue };
            let Some(id) = entry_job_id(&entry) else {
                debug!(entry = %entry.id, "stream entry without job id, dropping");
                let _: i64 = conn.xack(&stream, GROUP, &[&entry.id]).await.map_err(backend_err)?;
                let _: i64 = conn.xdel(&stream, &[&entry.id]).await.map_err(backend_err)?;
                continue;
            };

            let cancelled: bool = conn
                .sismember(self.keys.cancelled(scope), &id)
                .await
                .map_err(backend_err)?;
            let body: Option<String> = conn
                .hget(self.keys.jobs(scope), &id)
                .await
                .map_err(backend_err)?;
            let Some(body) = body.filter(|_| !cancelled) else {
                let _: i64 = conn.xack(&stream, GROUP, &[&entry.id]).await.map_err(backend_err)?;
                let _: i64 = conn.xdel(&stream, &[&entry.id]).await.map_err(backend_err)?;
                if cancelled {
                    let _: i64 = conn
                        .srem(self.keys.cancelled(scope), &id)
                        .await
                        .map_err(backend_err)?;
                }
                continue;
            };

            let token = ReservationToken::new();
            let deadline_ms = now_ms() + req.visibility_timeout.as_millis() as i64;
            let _: i64 = self
                .lease_script
                .key(self.keys.reserved(scope))
                .key(self.keys.leases(scope))
                .arg(&id)
                .arg(deadline_ms)
                .arg(token.as_str())
                .arg(req.worker_id.as_str())
                .invoke_async(&mut conn)
                .await
                .map_err(backend_err)?;

            let deadline = chrono::TimeZone::timestamp_millis_opt(&Utc, deadline_ms)
                .single()
                .unwrap_or_else(Utc::now);
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
            return Ok(Some(ReservedJob::new(job, token, deadline)));
        }
        Ok(None)
    }

    async fn ack(
        &self,
        scope: &QueueScope,
        job_id: &JobId,
        token: &ReservationToken,
    ) -> QueueResult<AckOutcome> {
        let mut invocation = self.ack_script.prepare_invoke();
        invocation
            .key(self.keys.reserved(scope))
            .key(self.keys.leases(scope))
            .key(self.keys.jobs(scope))
            .key(self.keys.attempts(scope))
            .key(self.keys.errors(scope))
            .key(self.keys.counters(scope))
            .key(self.keys.cancelled(scope))
            .key(self.keys.stream_entries(scope));
        for stream in self.keys.streams_descending(scope) {
            invocation.key(stream);
        }
        invocation
            .arg(job_id.as_str())
            .arg(token.as_str())
            .arg(now_ms());

        let mut conn = self.conn.clone();
        let outcome: String = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;

        match outcome.as_str() {
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

        let mut invocation = self.nack_script.prepare_invoke();
        invocation
            .key(self.keys.reserved(scope))
            .key(self.keys.leases(scope))
            .key(self.keys.jobs(scope))
            .key(self.keys.attempts(scope))
            .key(self.keys.errors(scope))
            .key(self.keys.delayed(scope))
            .key(self.keys.dlq(scope))
            .key(self.keys.dlq_meta(scope))
            .key(self.keys.cancelled(scope))
            .key(self.keys.stream_entries(scope));
        for stream in self.keys.streams_descending(scope) {
            invocation.key(stream);
        }
        invocation
            .arg(job_id.as_str())
            .arg(token.as_str())
            .arg(now_ms())
            .arg(mode)
            .arg(retry_at_ms)
            .arg(&error)
            .arg(job.max_attempts)
            .arg(job.priority.as_u8());

        let mut conn = self.conn.clone();
        let outcome: String = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;

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
        // Lease bookkeeping is shared with the lists layout
        let mut conn = self.conn.clone();
        let script = Script::new(
            r#"
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
"#,
        );
        let outcome: String = script
            .key(self.keys.reserved(scope))
            .key(self.keys.leases(scope))
            .key(self.keys.cancelled(scope))
            .arg(job_id.as_str())
            .arg(token.as_str())
            .arg(extend_by.as_millis() as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;
        match outcome.as_str() {
            "extended" => Ok(()),
            "gone" | "badtoken" => Err(QueueError::InvalidReservation),
            "cancelled" => Err(QueueError::JobCancelled),
            other => Err(QueueError::Internal(format!("extend returned {}", other))),
        }
    }

    async fn cancel(&self, scope: &QueueScope, job_id: &JobId) -> QueueResult<bool> {
        let job = self.get_job(scope, job_id).await?;
        if job.state.is_terminal() {
            return Ok(false);
        }
        // Mark cancelled; reserve and ack paths observe and drop the entry.
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .sadd(self.keys.cancelled(scope), job_id.as_str())
            .await
            .map_err(backend_err)?;
        self.emit(JobEvent::Cancelled {
            job_id: job_id.clone(),
            tenant_id: scope.tenant.to_string(),
            queue: scope.queue.clone(),
            at: Utc::now(),
        });
        Ok(true)
    }

    async fn move_job(
        &self,
        scope: &QueueScope,
        job_id: &JobId,
        target: MoveTarget,
    ) -> QueueResult<()> {
        let job = self.get_job(scope, job_id).await?;
        if job.state.is_reserved() {
            return Err(QueueError::Conflict(format!(
                "job {} is reserved and cannot be moved",
                job_id
            )));
        }
        let mut conn = self.conn.clone();
        match target {
            MoveTarget::DeadLetter { reason } => {
                let _: i64 = conn
                    .lrem(self.keys.dlq(scope), 0, job_id.as_str())
                    .await
                    .map_err(backend_err)?;
                let _: i64 = conn
                    .rpush(self.keys.dlq(scope), job_id.as_str())
                    .await
                    .map_err(backend_err)?;
                let meta = serde_json::json!({
                    "reason": reason,
                    "at": now_ms(),
                    "attempts": job.attempts,
                });
                let _: i64 = conn
                    .hset(self.keys.dlq_meta(scope), job_id.as_str(), meta.to_string())
                    .await
                    .map_err(backend_err)?;
                Ok(())
            }
            MoveTarget::Pending { queue, priority } => {
                let mut relocated = job.clone();
                if let Some(p) = priority {
                    relocated.priority = p;
                }
                if let Some(q) = queue {
                    relocated.queue = q;
                }
                relocated.state = JobState::Pending;
                relocated.reservation = None;
                // Enqueue first so a crash duplicates instead of losing
                self.enqueue(&relocated).await?;
                if relocated.queue != scope.queue {
                    let _: i64 = conn
                        .hdel(self.keys.jobs(scope), job_id.as_str())
                        .await
                        .map_err(backend_err)?;
                }
                let _: i64 = conn
                    .lrem(self.keys.dlq(scope), 0, job_id.as_str())
                    .await
                    .map_err(backend_err)?;
                let _: i64 = conn
                    .hdel(self.keys.dlq_meta(scope), job_id.as_str())
                    .await
                    .map_err(backend_err)?;
                let _: i64 = conn
                    .hdel(self.keys.attempts(scope), job_id.as_str())
                    .await
                    .map_err(backend_err)?;
                Ok(())
            }
        }
    }

    async fn reclaim_expired(&self, scope: &QueueScope, limit: usize) -> QueueResult<u64> {
        self.ensure_groups(scope).await?;

        let mut invocation = self.reclaim_script.prepare_invoke();
        invocation
            .key(self.keys.reserved(scope))
            .key(self.keys.leases(scope))
            .key(self.keys.jobs(scope))
            .key(self.keys.attempts(scope))
            .key(self.keys.dlq(scope))
            .key(self.keys.dlq_meta(scope))
            .key(self.keys.stream_entries(scope));
        for stream in self.keys.streams_descending(scope) {
            invocation.key(stream);
        }
        invocation.arg(now_ms()).arg(limit);

        let mut conn = self.conn.clone();
        let reclaimed: u64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;
        self.reclaims.fetch_add(reclaimed, Ordering::Relaxed);

        // Orphan pass: entries read but never leased
        let orphans = self
            .sweep_orphans(scope, Duration::from_secs(60), limit)
            .await?;
        Ok(reclaimed + orphans)
    }

    async fn promote_due(&self, scope: &QueueScope, limit: usize) -> QueueResult<u64> {
        let mut invocation = self.promote_script.prepare_invoke();
        invocation
            .key(self.keys.delayed(scope))
            .key(self.keys.stream_entries(scope));
        for stream in self.keys.streams_descending(scope) {
            invocation.key(stream);
        }
        invocation.arg(now_ms()).arg(limit);

        let mut conn = self.conn.clone();
        invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn purge(&self, scope: &QueueScope, job_id: &JobId) -> QueueResult<bool> {
        let job = match self.get_job(scope, job_id).await {
            Ok(job) => job,
            Err(QueueError::JobNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if job.state.is_reserved() {
            return Err(QueueError::Conflict(format!(
                "job {} is reserved and cannot be purged",
                job_id
            )));
        }
        let mut conn = self.conn.clone();
        let entry: Option<String> = conn
            .hget(self.keys.stream_entries(scope), job_id.as_str())
            .await
            .map_err(backend_err)?;
        if let Some(entry) = entry {
            if let Some((prio_tag, entry_id)) = entry.split_once('|') {
                if let Some(priority) =
                    prio_tag.parse::<u8>().ok().and_then(Priority::from_u8)
                {
                    let stream = self.keys.stream(scope, priority);
                    let _: i64 = conn.xack(&stream, GROUP, &[entry_id]).await.map_err(backend_err)?;
                    let _: i64 = conn.xdel(&stream, &[entry_id]).await.map_err(backend_err)?;
                }
            }
        }
        for key in [
            self.keys.jobs(scope),
            self.keys.attempts(scope),
            self.keys.errors(scope),
            self.keys.stream_entries(scope),
            self.keys.dlq_meta(scope),
        ] {
            let _: i64 = conn.hdel(&key, job_id.as_str()).await.map_err(backend_err)?;
        }
        let _: i64 = conn
            .lrem(self.keys.dlq(scope), 0, job_id.as_str())
            .await
            .map_err(backend_err)?;
        let _: i64 = conn
            .zrem(
                self.keys.delayed(scope),
                crate::keys::delayed_member(job.priority, job_id.as_str()),
            )
            .await
            .map_err(backend_err)?;
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
            self.keys.stream_entries(scope),
        ];
        keys.extend(self.keys.streams_descending(scope));
        let _: i64 = conn.del(keys).await.map_err(backend_err)?;
        Ok(total)
    }

    async fn counts(&self, scope: &QueueScope) -> QueueResult<CountsSnapshot> {
        let mut conn = self.conn.clone();
        let mut pending = PendingCounts::default();
        for priority in Priority::ascending() {
            let len: u64 = conn
                .xlen(self.keys.stream(scope, *priority))
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
        // XLEN counts reserved entries too; subtract to get pending
        let mut remaining = reserved;
        for priority in Priority::descending() {
            let current = pending.get(*priority);
            let take = remaining.min(current);
            pending.set(*priority, current - take);
            remaining -= take;
        }
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
                let mut jobs = Vec::new();
                for priority in Priority::descending() {
                    if jobs.len() >= offset + limit {
                        break;
                    }
                    let reply: redis::streams::StreamRangeReply = conn
                        .xrange_count(
                            self.keys.stream(scope, *priority),
                            "-",
                            "+",
                            offset + limit,
                        )
                        .await
                        .map_err(backend_err)?;
                    for entry in reply.ids {
                        let Some(id) = entry_job_id(&entry) else { continue };
                        let body: Option<String> = conn
                            .hget(self.keys.jobs(scope), &id)
                            .await
                            .map_err(backend_err)?;
                        if let Some(body) = body {
                            let attempts = self.attempts_for(scope, &id).await?;
                            jobs.push(self.materialize(&body, attempts, JobState::Pending)?);
                        }
                    }
                }
                Ok(jobs.into_iter().skip(offset).take(limit).collect())
            }
            JobSource::Reserved | JobSource::DeadLetter => {
                // Shared layout with the lists backend for these structures
                let key = match source {
                    JobSource::Reserved => self.keys.reserved(scope),
                    _ => self.keys.dlq(scope),
                };
                let ids: Vec<String> = match source {
                    JobSource::Reserved => conn
                        .zrange(key, offset as isize, (offset + limit) as isize - 1)
                        .await
                        .map_err(backend_err)?,
                    _ => conn
                        .lrange(key, offset as isize, (offset + limit) as isize - 1)
                        .await
                        .map_err(backend_err)?,
                };
                let mut jobs = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.get_job(scope, &JobId::from(id)).await {
                        Ok(job) => jobs.push(job),
                        Err(QueueError::JobNotFound(_)) => continue,
                        Err(e) => return Err(e),
                    }
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
            return self.materialize(&body, attempts, JobState::Cancelled { at: Utc::now() });
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
                    deadline: chrono::TimeZone::timestamp_millis_opt(&Utc, deadline_ms)
                        .single()
                        .unwrap_or_else(Utc::now),
                    worker_id: hoist_core::WorkerId::from(worker.as_str()),
                },
            );
        }

        let meta: Option<String> = conn
            .hget(self.keys.dlq_meta(scope), job_id.as_str())
            .await
            .map_err(backend_err)?;
        if let Some(meta) = meta {
            #[derive(serde::Deserialize)]
            struct Meta {
                reason: String,
                at: i64,
                #[serde(default)]
                attempts: u32,
            }
            if let Ok(meta) = serde_json::from_str::<Meta>(&meta) {
                return self.materialize(
                    &body,
                    meta.attempts.max(attempts),
                    JobState::DeadLettered {
                        at: chrono::TimeZone::timestamp_millis_opt(&Utc, meta.at)
                            .single()
                            .unwrap_or_else(Utc::now),
                        reason: meta.reason,
                    },
                );
            }
        }

        self.materialize(&body, attempts, JobState::Pending)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ATOMIC_ACK
            | Capabilities::CONSUMER_GROUPS
            | Capabilities::REPLAY
            | Capabilities::TRANSACTIONS
            | Capabilities::PERSISTENCE
            | Capabilities::CLUSTERING
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

/// Factory for the registry
pub struct RedisStreamFactory;

#[async_trait]
impl BackendFactory for RedisStreamFactory {
    async fn create(
        &self,
        config: &BackendConfig,
    ) -> QueueResult<std::sync::Arc<dyn StorageBackend>> {
        Ok(std::sync::Arc::new(
            RedisStreamBackend::connect(config).await?,
        ))
    }

    fn kind(&self) -> &'static str {
        "redis_streams"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_priority_tags() {
        assert_eq!(stream_priority_tag("t:a:q:b:s:critical"), Some('4'));
        assert_eq!(stream_priority_tag("t:a:q:b:s:low"), Some('1'));
        assert_eq!(stream_priority_tag("t:a:q:b:s:bogus"), None);
    }

    #[test]
    fn scripts_reference_group_by_name() {
        for script in [ACK_SCRIPT, NACK_SCRIPT, RECLAIM_SCRIPT] {
            assert!(script.contains("'hoist'"));
        }
    }
}
