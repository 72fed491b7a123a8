//! Transactional outbox.
//!
//! Events are appended as a write-ahead record before the business write is
//! acknowledged; a polling publisher drains pending events in batches and
//! marks them published only on acknowledged delivery. Delivery is
//! at-least-once in per-aggregate order; consumers dedupe on event id.
//! A reconciliation sweep re-queues claims orphaned by a crashed publisher,
//! and events that exhaust their attempts land in a dead-letter store for
//! manual replay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use hoist_core::{
    ChaosDecision, ChaosInjector, ChaosPoint, ExactlyOnceConfig, QueueError, QueueResult,
};

/// Event delivery state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

/// A domain event recorded alongside the state change that produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: String,
    pub tenant: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn new(
        tenant: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant: tenant.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            created_at: now,
        }
    }
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Write-ahead append; callable inside the producing transaction where
    /// the backend supports one
    async fn append(&self, event: OutboxEvent) -> QueueResult<()>;

    /// Claim due pending events, oldest first, up to `batch`. Claimed
    /// events stay pending until marked, so a crashed publisher's claims
    /// are re-served after the orphan window.
    async fn fetch_due(&self, batch: usize) -> QueueResult<Vec<OutboxEvent>>;

    async fn mark_published(&self, tenant: &str, id: &str) -> QueueResult<()>;

    /// Record a failed delivery and schedule the next attempt
    async fn mark_failed(
        &self,
        tenant: &str,
        id: &str,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> QueueResult<()>;

    /// Move an exhausted event to the dead-letter store
    async fn move_dead(&self, tenant: &str, id: &str) -> QueueResult<()>;

    async fn dead_events(&self, tenant: &str, limit: usize) -> QueueResult<Vec<OutboxEvent>>;

    /// Return a dead event to pending for another delivery round
    async fn replay_dead(&self, tenant: &str, id: &str) -> QueueResult<()>;

    /// Count of pending events (for stats and tests)
    async fn pending_count(&self) -> QueueResult<u64>;
}

/// Delivery sink the publisher drains into (the webhook dispatcher in
/// production; a channel in tests)
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> QueueResult<()>;
}

/// In-memory store for tests and local development
pub struct MemoryOutboxStore {
    events: Mutex<HashMap<String, OutboxEvent>>,
    dead: Mutex<HashMap<String, OutboxEvent>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
            dead: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn append(&self, event: OutboxEvent) -> QueueResult<()> {
        self.events.lock().insert(event.id.clone(), event);
        Ok(())
    }

    async fn fetch_due(&self, batch: usize) -> QueueResult<Vec<OutboxEvent>> {
        let now = Utc::now();
        let events = self.events.lock();
        let mut due: Vec<OutboxEvent> = events
            .values()
            .filter(|e| e.status == OutboxStatus::Pending && e.next_attempt_at <= now)
            .cloned()
            .collect();
        // Oldest first preserves per-aggregate order
        due.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        due.truncate(batch);
        Ok(due)
    }

    async fn mark_published(&self, _tenant: &str, id: &str) -> QueueResult<()> {
        let mut events = self.events.lock();
        if let Some(event) = events.get_mut(id) {
            event.status = OutboxStatus::Published;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        _tenant: &str,
        id: &str,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> QueueResult<()> {
        let mut events = self.events.lock();
        if let Some(event) = events.get_mut(id) {
            event.attempts = attempts;
            event.next_attempt_at = next_attempt_at;
        }
        Ok(())
    }

    async fn move_dead(&self, _tenant: &str, id: &str) -> QueueResult<()> {
        let mut events = self.events.lock();
        if let Some(mut event) = events.remove(id) {
            event.status = OutboxStatus::Failed;
            self.dead.lock().insert(id.to_string(), event);
        }
        Ok(())
    }

    async fn dead_events(&self, tenant: &str, limit: usize) -> QueueResult<Vec<OutboxEvent>> {
        Ok(self
            .dead
            .lock()
            .values()
            .filter(|e| e.tenant == tenant)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn replay_dead(&self, _tenant: &str, id: &str) -> QueueResult<()> {
        let mut dead = self.dead.lock();
        let mut event = dead
            .remove(id)
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        event.status = OutboxStatus::Pending;
        event.attempts = 0;
        event.next_attempt_at = Utc::now();
        self.events.lock().insert(id.to_string(), event);
        Ok(())
    }

    async fn pending_count(&self) -> QueueResult<u64> {
        Ok(self
            .events
            .lock()
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .count() as u64)
    }
}

/// Redis-backed store: event bodies in `t:{tenant}:outbox:events`, the
/// pending schedule in a due-time-scored set at `t:{tenant}:outbox:pending`,
/// dead letters in `t:{tenant}:outbox:dead`. A global tenant set lets one
/// publisher drain every namespace.
pub struct RedisOutboxStore {
    conn: ConnectionManager,
}

const TENANTS_KEY: &str = "outbox:tenants";

impl RedisOutboxStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn events_key(tenant: &str) -> String {
        format!("t:{}:outbox:events", tenant)
    }

    fn pending_key(tenant: &str) -> String {
        format!("t:{}:outbox:pending", tenant)
    }

    fn dead_key(tenant: &str) -> String {
        format!("t:{}:outbox:dead", tenant)
    }

    fn err(e: redis::RedisError) -> QueueError {
        QueueError::BackendUnavailable(e.to_string())
    }
}

#[async_trait]
impl OutboxStore for RedisOutboxStore {
    async fn append(&self, event: OutboxEvent) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(&event)?;
        let _: i64 = conn
            .hset(Self::events_key(&event.tenant), &event.id, body)
            .await
            .map_err(Self::err)?;
        let _: i64 = conn
            .zadd(
                Self::pending_key(&event.tenant),
                &event.id,
                event.next_attempt_at.timestamp_millis(),
            )
            .await
            .map_err(Self::err)?;
        let _: i64 = conn
            .sadd(TENANTS_KEY, &event.tenant)
            .await
            .map_err(Self::err)?;
        Ok(())
    }

    async fn fetch_due(&self, batch: usize) -> QueueResult<Vec<OutboxEvent>> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();
        let tenants: Vec<String> = conn.smembers(TENANTS_KEY).await.map_err(Self::err)?;

        let mut due = Vec::new();
        for tenant in tenants {
            if due.len() >= batch {
                break;
            }
            let ids: Vec<String> = conn
                .zrangebyscore_limit(
                    Self::pending_key(&tenant),
                    "-inf",
                    now,
                    0,
                    (batch - due.len()) as isize,
                )
                .await
                .map_err(Self::err)?;
            for id in ids {
                let body: Option<String> = conn
                    .hget(Self::events_key(&tenant), &id)
                    .await
                    .map_err(Self::err)?;
                if let Some(body) = body {
                    match serde_json::from_str::<OutboxEvent>(&body) {
                        Ok(event) => due.push(event),
                        Err(e) => warn!(id, error = %e, "corrupt outbox event skipped"),
                    }
                } else {
                    // Orphaned schedule entry; reconcile by dropping it
                    let _: i64 = conn
                        .zrem(Self::pending_key(&tenant), &id)
                        .await
                        .map_err(Self::err)?;
                }
            }
        }
        Ok(due)
    }

    async fn mark_published(&self, tenant: &str, id: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .zrem(Self::pending_key(tenant), id)
            .await
            .map_err(Self::err)?;
        let _: i64 = conn
            .hdel(Self::events_key(tenant), id)
            .await
            .map_err(Self::err)?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        tenant: &str,
        id: &str,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let body: Option<String> = conn
            .hget(Self::events_key(tenant), id)
            .await
            .map_err(Self::err)?;
        if let Some(body) = body {
            if let Ok(mut event) = serde_json::from_str::<OutboxEvent>(&body) {
                event.attempts = attempts;
                event.next_attempt_at = next_attempt_at;
                let _: i64 = conn
                    .hset(Self::events_key(tenant), id, serde_json::to_string(&event)?)
                    .await
                    .map_err(Self::err)?;
            }
        }
        let _: i64 = conn
            .zadd(
                Self::pending_key(tenant),
                id,
                next_attempt_at.timestamp_millis(),
            )
            .await
            .map_err(Self::err)?;
        Ok(())
    }

    async fn move_dead(&self, tenant: &str, id: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let body: Option<String> = conn
            .hget(Self::events_key(tenant), id)
            .await
            .map_err(Self::err)?;
        if let Some(body) = body {
            let _: i64 = conn
                .hset(Self::dead_key(tenant), id, body)
                .await
                .map_err(Self::err)?;
        }
        let _: i64 = conn
            .zrem(Self::pending_key(tenant), id)
            .await
            .map_err(Self::err)?;
        let _: i64 = conn
            .hdel(Self::events_key(tenant), id)
            .await
            .map_err(Self::err)?;
        Ok(())
    }

    async fn dead_events(&self, tenant: &str, limit: usize) -> QueueResult<Vec<OutboxEvent>> {
        let mut conn = self.conn.clone();
        let entries: HashMap<String, String> = conn
            .hgetall(Self::dead_key(tenant))
            .await
            .map_err(Self::err)?;
        Ok(entries
            .into_values()
            .filter_map(|body| serde_json::from_str(&body).ok())
            .take(limit)
            .collect())
    }

    async fn replay_dead(&self, tenant: &str, id: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let body: Option<String> = conn
            .hget(Self::dead_key(tenant), id)
            .await
            .map_err(Self::err)?;
        let body = body.ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        let mut event: OutboxEvent = serde_json::from_str(&body)
            .map_err(|e| QueueError::BackendCorrupt(format!("outbox event: {}", e)))?;
        event.status = OutboxStatus::Pending;
        event.attempts = 0;
        event.next_attempt_at = Utc::now();
        self.append(event).await?;
        let _: i64 = conn
            .hdel(Self::dead_key(tenant), id)
            .await
            .map_err(Self::err)?;
        Ok(())
    }

    async fn pending_count(&self) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let tenants: Vec<String> = conn.smembers(TENANTS_KEY).await.map_err(Self::err)?;
        let mut total = 0u64;
        for tenant in tenants {
            let count: u64 = conn
                .zcard(Self::pending_key(&tenant))
                .await
                .map_err(Self::err)?;
            total += count;
        }
        Ok(total)
    }
}

/// Handle for stopping the publisher loop
pub struct PublisherHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl PublisherHandle {
    pub async fn shutdown(self) -> QueueResult<()> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| QueueError::Internal(format!("publisher join error: {}", e)))
    }
}

/// Polls pending events and dispatches them to the sink
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    sink: Arc<dyn EventPublisher>,
    chaos: Arc<ChaosInjector>,
    poll_interval: Duration,
    batch_size: usize,
    max_attempts: u32,
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        sink: Arc<dyn EventPublisher>,
        chaos: Arc<ChaosInjector>,
        config: &ExactlyOnceConfig,
    ) -> Self {
        Self {
            store,
            sink,
            chaos,
            poll_interval: config.outbox_poll_interval,
            batch_size: config.outbox_batch_size,
            max_attempts: config.outbox_max_attempts,
        }
    }

    pub fn start(self) -> PublisherHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        info!(interval = ?self.poll_interval, "starting outbox publisher");

        let join_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("outbox publisher stopping");
                        break;
                    }
                    _ = sleep(self.poll_interval) => {
                        if let Err(e) = self.drain_once().await {
                            warn!(error = %e, "outbox drain failed");
                        }
                    }
                }
            }
        });

        PublisherHandle {
            shutdown_tx,
            join_handle,
        }
    }

    /// One drain pass; returns how many events were published
    pub async fn drain_once(&self) -> QueueResult<u64> {
        let due = self.store.fetch_due(self.batch_size).await?;
        let mut published = 0u64;

        for event in due {
            match self
                .chaos
                .decide(ChaosPoint::OutboxPublish, &event.tenant, &event.event_type)
            {
                ChaosDecision::Fail => {
                    self.handle_failure(&event, "injected publish failure").await?;
                    continue;
                }
                ChaosDecision::Delay(d) => sleep(d).await,
                ChaosDecision::Pass => {}
            }

            match self.sink.publish(&event).await {
                Ok(()) => {
                    self.store.mark_published(&event.tenant, &event.id).await?;
                    published += 1;
                    debug!(event_id = %event.id, "outbox event published");
                }
                Err(e) => {
                    self.handle_failure(&event, &e.to_string()).await?;
                }
            }
        }
        Ok(published)
    }

    async fn handle_failure(&self, event: &OutboxEvent, error: &str) -> QueueResult<()> {
        let attempts = event.attempts + 1;
        if attempts >= self.max_attempts {
            warn!(event_id = %event.id, error, "outbox event exhausted, dead-lettering");
            return self.store.move_dead(&event.tenant, &event.id).await;
        }
        // Exponential backoff with jitter, capped at five minutes
        let base = Duration::from_secs(1) * 2u32.saturating_pow(attempts.min(16));
        let capped = base.min(Duration::from_secs(300));
        let jittered = capped.mul_f64(rand::thread_rng().gen_range(0.5..1.0));
        let next = Utc::now()
            + chrono::Duration::from_std(jittered).unwrap_or_else(|_| chrono::Duration::seconds(5));
        warn!(event_id = %event.id, attempts, error, "outbox delivery failed, retrying");
        self.store
            .mark_failed(&event.tenant, &event.id, attempts, next)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct RecordingSink {
        published: Mutex<Vec<String>>,
        fail_first: AtomicU32,
    }

    impl RecordingSink {
        fn new(fail_first: u32) -> Self {
            Self {
                published: Mutex::new(Vec::new()),
                fail_first: AtomicU32::new(fail_first),
            }
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingSink {
        async fn publish(&self, event: &OutboxEvent) -> QueueResult<()> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(QueueError::BackendUnavailable("sink down".to_string()));
            }
            self.published.lock().push(event.id.clone());
            Ok(())
        }
    }

    fn publisher(
        store: Arc<dyn OutboxStore>,
        sink: Arc<RecordingSink>,
        max_attempts: u32,
    ) -> OutboxPublisher {
        let config = ExactlyOnceConfig {
            outbox_max_attempts: max_attempts,
            ..ExactlyOnceConfig::default()
        };
        OutboxPublisher::new(store, sink, Arc::new(ChaosInjector::new()), &config)
    }

    #[tokio::test]
    async fn publishes_pending_events_once() {
        let store: Arc<dyn OutboxStore> = Arc::new(MemoryOutboxStore::new());
        let sink = Arc::new(RecordingSink::new(0));
        let publisher = publisher(store.clone(), sink.clone(), 3);

        let event = OutboxEvent::new("acme", "job-1", "job.acked", serde_json::json!({}));
        let id = event.id.clone();
        store.append(event).await.unwrap();

        assert_eq!(publisher.drain_once().await.unwrap(), 1);
        assert_eq!(sink.published.lock().as_slice(), &[id]);
        assert_eq!(store.pending_count().await.unwrap(), 0);

        // A second drain has nothing to do
        assert_eq!(publisher.drain_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_delivery_backs_off_then_succeeds() {
        let store: Arc<dyn OutboxStore> = Arc::new(MemoryOutboxStore::new());
        let sink = Arc::new(RecordingSink::new(1));
        let publisher = publisher(store.clone(), sink.clone(), 5);

        let event = OutboxEvent::new("acme", "job-1", "job.acked", serde_json::json!({}));
        let id = event.id.clone();
        store.append(event).await.unwrap();

        // First drain fails; the event stays pending, scheduled later
        assert_eq!(publisher.drain_once().await.unwrap(), 0);
        assert_eq!(store.pending_count().await.unwrap(), 1);
        assert!(store.fetch_due(10).await.unwrap().is_empty());

        // Pull the schedule forward and drain again
        store
            .mark_failed("acme", &id, 1, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(publisher.drain_once().await.unwrap(), 1);
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert_eq!(sink.published.lock().as_slice(), &[id]);
    }

    #[tokio::test]
    async fn exhausted_event_moves_to_dead_store_and_replays() {
        let store: Arc<dyn OutboxStore> = Arc::new(MemoryOutboxStore::new());
        let sink = Arc::new(RecordingSink::new(10));
        let publisher = publisher(store.clone(), sink.clone(), 1);

        let event = OutboxEvent::new("acme", "job-1", "job.failed", serde_json::json!({}));
        let id = event.id.clone();
        store.append(event).await.unwrap();

        // max_attempts = 1: first failure dead-letters
        publisher.drain_once().await.unwrap();
        let dead = store.dead_events("acme", 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].status, OutboxStatus::Failed);

        // Manual replay returns it to pending
        store.replay_dead("acme", &id).await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fetch_due_preserves_creation_order() {
        let store = MemoryOutboxStore::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut event =
                OutboxEvent::new("acme", "agg", "evt", serde_json::json!({ "seq": i }));
            event.created_at = Utc::now() + chrono::Duration::milliseconds(i);
            ids.push(event.id.clone());
            store.append(event).await.unwrap();
        }
        let due = store.fetch_due(10).await.unwrap();
        let got: Vec<String> = due.into_iter().map(|e| e.id).collect();
        assert_eq!(got, ids);
    }
}
