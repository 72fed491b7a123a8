//! Event hooks: signed webhook deliveries.
//!
//! Subscribers register a URL, a shared secret and filters (event types,
//! queues, minimum priority). Qualifying events are composed into a JSON
//! payload and signed with `HMAC-SHA256(secret, "<timestamp>." + body)`,
//! sent with the `X-Webhook-*` header set. Each subscription has a bounded
//! send buffer (overflow drops the oldest delivery), a token-bucket rate
//! limit and a circuit breaker; failed sends retry with exponential backoff
//! and jitter, and exhausted deliveries land in a dead-letter store for
//! manual replay. Delivery ids are unique so consumers can dedupe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use hoist_core::{
    ChaosDecision, ChaosInjector, ChaosPoint, Priority, QueueError, QueueResult,
};
use hoist_exactly_once::{EventPublisher, OutboxEvent};

type HmacSha256 = Hmac<Sha256>;

/// Sign a webhook body: base string is `"<timestamp>." + body`
pub fn sign_payload(secret: &str, timestamp: i64, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(format!("{}.{}", timestamp, body).as_bytes());
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("sha256={}", hex)
}

/// Consumer-side verification: true iff the signature matches and the
/// timestamp is within the freshness window.
pub fn verify_signature(
    secret: &str,
    timestamp: i64,
    body: &str,
    signature: &str,
    freshness: Duration,
    now: DateTime<Utc>,
) -> bool {
    let skew = (now.timestamp() - timestamp).unsigned_abs();
    if skew > freshness.as_secs() {
        return false;
    }
    let expected = sign_payload(secret, timestamp, body);
    // Constant-time comparison
    expected.len() == signature.len()
        && expected
            .bytes()
            .zip(signature.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// A registered subscriber
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookSubscription {
    pub id: String,
    pub url: String,
    pub secret: String,
    /// Event names; empty subscribes to everything
    #[serde(default)]
    pub events: Vec<String>,
    /// Queue filter; empty matches every queue
    #[serde(default)]
    pub queues: Vec<String>,
    #[serde(default = "default_min_priority")]
    pub min_priority: Priority,
    /// Deliveries per minute
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub redact_fields: Vec<String>,
    #[serde(default = "default_true")]
    pub include_payload: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_min_priority() -> Priority {
    Priority::Low
}

fn default_rate_limit() -> u32 {
    600
}

fn default_true() -> bool {
    true
}

impl HookSubscription {
    pub fn new(url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            secret: secret.into(),
            events: Vec::new(),
            queues: Vec::new(),
            min_priority: Priority::Low,
            rate_limit: 600,
            headers: HashMap::new(),
            redact_fields: Vec::new(),
            include_payload: true,
            enabled: true,
        }
    }

    pub fn validate(&self) -> QueueResult<()> {
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(QueueError::Validation(format!(
                "subscription url '{}' must be http(s)",
                self.url
            )));
        }
        if self.secret.len() < 16 {
            return Err(QueueError::Validation(
                "subscription secret must be at least 16 bytes".to_string(),
            ));
        }
        Ok(())
    }

    fn wants(&self, event: &OutboxEvent, queue: &str, priority: Priority) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.events.is_empty() && !self.events.iter().any(|e| e == &event.event_type) {
            return false;
        }
        if !self.queues.is_empty() && !self.queues.iter().any(|q| q == queue) {
            return false;
        }
        priority >= self.min_priority
    }
}

/// A delivery ready to send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub delivery_id: String,
    pub subscription_id: String,
    pub url: String,
    pub body: String,
    pub headers: Vec<(String, String)>,
    pub attempts: u32,
    pub replay: bool,
}

/// An exhausted delivery held for manual replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadDelivery {
    pub delivery_id: String,
    pub subscription_id: String,
    pub url: String,
    pub body: String,
    pub last_error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Transport seam so deliveries are testable without a network
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Returns the response status code
    async fn deliver(&self, request: &DeliveryRequest) -> QueueResult<u16>;
}

/// Production transport over reqwest
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> QueueResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("hoist-webhook/1.0")
            .build()
            .map_err(|e| QueueError::Internal(format!("http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DeliveryTransport for ReqwestTransport {
    async fn deliver(&self, request: &DeliveryRequest) -> QueueResult<u16> {
        let mut builder = self
            .client
            .post(&request.url)
            .header("Content-Type", "application/json")
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder
            .send()
            .await
            .map_err(|e| QueueError::BackendUnavailable(format!("webhook send: {}", e)))?;
        Ok(response.status().as_u16())
    }
}

struct SubscriptionState {
    breaker_failures: u32,
    breaker_open_until: Option<Instant>,
    tokens: f64,
    last_refill: Instant,
    buffer: VecDeque<DeliveryRequest>,
}

impl SubscriptionState {
    fn new() -> Self {
        // Backdated refill time fills the bucket on first use
        let backdated = Instant::now()
            .checked_sub(Duration::from_secs(3600))
            .unwrap_or_else(Instant::now);
        Self {
            breaker_failures: 0,
            breaker_open_until: None,
            tokens: 0.0,
            last_refill: backdated,
            buffer: VecDeque::new(),
        }
    }

    fn take_token(&mut self, per_minute: u32) -> bool {
        let now = Instant::now();
        let rate = per_minute as f64 / 60.0;
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(per_minute as f64);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Composes, signs and delivers webhook payloads
pub struct HookDispatcher {
    subscriptions: RwLock<HashMap<String, HookSubscription>>,
    states: Mutex<HashMap<String, SubscriptionState>>,
    dead: RwLock<VecDeque<DeadDelivery>>,
    transport: Arc<dyn DeliveryTransport>,
    chaos: Arc<ChaosInjector>,
    max_attempts: u32,
    /// Per-subscription send buffer; overflow drops the oldest delivery
    buffer_cap: usize,
    breaker_threshold: u32,
    breaker_cooldown: Duration,
}

impl HookDispatcher {
    pub fn new(transport: Arc<dyn DeliveryTransport>, chaos: Arc<ChaosInjector>) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            dead: RwLock::new(VecDeque::new()),
            transport,
            chaos,
            max_attempts: 5,
            buffer_cap: 100,
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn subscribe(&self, subscription: HookSubscription) -> QueueResult<String> {
        subscription.validate()?;
        let id = subscription.id.clone();
        info!(subscription = %id, url = %subscription.url, "event hook registered");
        self.subscriptions.write().insert(id.clone(), subscription);
        Ok(id)
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        self.states.lock().remove(id);
        self.subscriptions.write().remove(id).is_some()
    }

    pub fn subscriptions(&self) -> Vec<HookSubscription> {
        self.subscriptions.read().values().cloned().collect()
    }

    pub fn dead_deliveries(&self, limit: usize) -> Vec<DeadDelivery> {
        self.dead.read().iter().rev().take(limit).cloned().collect()
    }

    /// Compose the signed request for one subscription and event
    fn compose(
        &self,
        subscription: &HookSubscription,
        event: &OutboxEvent,
        queue: &str,
        replay: bool,
    ) -> DeliveryRequest {
        let mut payload = serde_json::json!({
            "id": event.id,
            "event": event.event_type,
            "aggregate_id": event.aggregate_id,
            "tenant": event.tenant,
            "queue": queue,
            "created_at": event.created_at.to_rfc3339(),
        });
        if subscription.include_payload {
            let mut data = event.payload.clone();
            if let Some(object) = data.as_object_mut() {
                for field in &subscription.redact_fields {
                    if object.contains_key(field) {
                        object.insert(
                            field.clone(),
                            serde_json::Value::String("[redacted]".to_string()),
                        );
                    }
                }
            }
            payload["data"] = data;
        }
        let body = payload.to_string();

        let timestamp = Utc::now().timestamp();
        let delivery_id = uuid::Uuid::new_v4().to_string();
        let mut headers = vec![
            ("X-Webhook-Delivery".to_string(), delivery_id.clone()),
            ("X-Webhook-Event".to_string(), event.event_type.clone()),
            ("X-Webhook-Timestamp".to_string(), timestamp.to_string()),
            ("X-Webhook-Job-ID".to_string(), event.aggregate_id.clone()),
            ("X-Webhook-Queue".to_string(), queue.to_string()),
            (
                "X-Webhook-Signature".to_string(),
                sign_payload(&subscription.secret, timestamp, &body),
            ),
        ];
        if replay {
            headers.push(("X-Webhook-Replay".to_string(), "true".to_string()));
        }
        for (name, value) in &subscription.headers {
            headers.push((name.clone(), value.clone()));
        }

        DeliveryRequest {
            delivery_id,
            subscription_id: subscription.id.clone(),
            url: subscription.url.clone(),
            body,
            headers,
            attempts: 0,
            replay,
        }
    }

    fn breaker_allows(&self, state: &mut SubscriptionState) -> bool {
        match state.breaker_open_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                // Half-open: one probe
                state.breaker_open_until = None;
                true
            }
            None => true,
        }
    }

    fn record_result(&self, state: &mut SubscriptionState, success: bool) {
        if success {
            state.breaker_failures = 0;
        } else {
            state.breaker_failures += 1;
            if state.breaker_failures >= self.breaker_threshold {
                warn!("subscription circuit opened");
                state.breaker_open_until = Some(Instant::now() + self.breaker_cooldown);
                state.breaker_failures = 0;
            }
        }
    }

    /// Send one request with retries and backoff; exhausted requests go to
    /// the dead store.
    async fn send_with_retries(&self, mut request: DeliveryRequest) -> QueueResult<()> {
        let mut last_error = String::new();
        while request.attempts < self.max_attempts {
            request.attempts += 1;

            match self
                .chaos
                .decide(ChaosPoint::WebhookSend, &request.subscription_id, "")
            {
                ChaosDecision::Fail => {
                    last_error = "injected webhook failure".to_string();
                    self.backoff(request.attempts).await;
                    continue;
                }
                ChaosDecision::Delay(d) => sleep(d).await,
                ChaosDecision::Pass => {}
            }

            match self.transport.deliver(&request).await {
                Ok(status) if (200..300).contains(&status) => {
                    debug!(delivery = %request.delivery_id, status, "webhook delivered");
                    let mut states = self.states.lock();
                    if let Some(state) = states.get_mut(&request.subscription_id) {
                        self.record_result(state, true);
                    }
                    return Ok(());
                }
                Ok(status) => {
                    last_error = format!("receiver returned status {}", status);
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            {
                let mut states = self.states.lock();
                let state = states
                    .entry(request.subscription_id.clone())
                    .or_insert_with(SubscriptionState::new);
                self.record_result(state, false);
            }
            if request.attempts < self.max_attempts {
                self.backoff(request.attempts).await;
            }
        }

        warn!(delivery = %request.delivery_id, last_error, "delivery exhausted, dead-lettering");
        let mut dead = self.dead.write();
        if dead.len() >= 4096 {
            dead.pop_front();
        }
        dead.push_back(DeadDelivery {
            delivery_id: request.delivery_id,
            subscription_id: request.subscription_id,
            url: request.url,
            body: request.body,
            last_error: last_error.clone(),
            attempts: request.attempts,
            failed_at: Utc::now(),
        });
        Err(QueueError::BackendUnavailable(last_error))
    }

    async fn backoff(&self, attempt: u32) {
        let base = Duration::from_millis(200) * 2u32.saturating_pow(attempt.min(8));
        let capped = base.min(Duration::from_secs(30));
        let jittered = capped.mul_f64(rand::thread_rng().gen_range(0.5..1.0));
        sleep(jittered).await;
    }

    /// Dispatch one event to every matching subscription. Returns an error
    /// only when every matching delivery failed terminally, so the outbox
    /// retries; partial failures are parked in the dead store.
    pub async fn dispatch(&self, event: &OutboxEvent) -> QueueResult<()> {
        let queue = event
            .payload
            .get("queue")
            .and_then(|q| q.as_str())
            .unwrap_or("")
            .to_string();
        let priority = event
            .payload
            .get("priority")
            .and_then(|p| p.as_str())
            .and_then(|p| p.parse().ok())
            .unwrap_or(Priority::Low);

        let matching: Vec<HookSubscription> = self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.wants(event, &queue, priority))
            .cloned()
            .collect();
        if matching.is_empty() {
            return Ok(());
        }

        let mut delivered = 0usize;
        let mut attempted = 0usize;
        for subscription in matching {
            // Rate limit and breaker guard the receiver
            {
                let mut states = self.states.lock();
                let state = states
                    .entry(subscription.id.clone())
                    .or_insert_with(SubscriptionState::new);
                if !self.breaker_allows(state) {
                    debug!(subscription = %subscription.id, "circuit open, buffering");
                    let request = self.compose(&subscription, event, &queue, false);
                    if state.buffer.len() >= self.buffer_cap {
                        state.buffer.pop_front();
                    }
                    state.buffer.push_back(request);
                    continue;
                }
                if !state.take_token(subscription.rate_limit) {
                    debug!(subscription = %subscription.id, "rate limited, buffering");
                    let request = self.compose(&subscription, event, &queue, false);
                    if state.buffer.len() >= self.buffer_cap {
                        state.buffer.pop_front();
                    }
                    state.buffer.push_back(request);
                    continue;
                }
            }

            attempted += 1;
            let request = self.compose(&subscription, event, &queue, false);
            if self.send_with_retries(request).await.is_ok() {
                delivered += 1;
            }
        }

        if attempted > 0 && delivered == 0 {
            return Err(QueueError::BackendUnavailable(
                "no webhook delivery succeeded".to_string(),
            ));
        }
        Ok(())
    }

    /// Drain buffered deliveries (breaker reopened or tokens refilled)
    pub async fn flush_buffers(&self) -> u64 {
        let pending: Vec<DeliveryRequest> = {
            let mut states = self.states.lock();
            states
                .values_mut()
                .flat_map(|state| state.buffer.drain(..).collect::<Vec<_>>())
                .collect()
        };
        let mut flushed = 0;
        for mut request in pending {
            request.attempts = 0;
            if self.send_with_retries(request).await.is_ok() {
                flushed += 1;
            }
        }
        flushed
    }

    /// Replay one dead delivery, marked with `X-Webhook-Replay: true`
    pub async fn replay_dead(&self, delivery_id: &str) -> QueueResult<()> {
        let dead = {
            let mut store = self.dead.write();
            let index = store
                .iter()
                .position(|d| d.delivery_id == delivery_id)
                .ok_or_else(|| QueueError::JobNotFound(delivery_id.to_string()))?;
            store.remove(index).expect("index just found")
        };

        let subscription = self
            .subscriptions
            .read()
            .get(&dead.subscription_id)
            .cloned()
            .ok_or_else(|| {
                QueueError::JobNotFound(format!("subscription {}", dead.subscription_id))
            })?;

        // Re-sign with a fresh timestamp; the body is replayed verbatim
        let timestamp = Utc::now().timestamp();
        let request = DeliveryRequest {
            delivery_id: dead.delivery_id.clone(),
            subscription_id: dead.subscription_id,
            url: dead.url,
            headers: vec![
                ("X-Webhook-Delivery".to_string(), dead.delivery_id),
                ("X-Webhook-Timestamp".to_string(), timestamp.to_string()),
                (
                    "X-Webhook-Signature".to_string(),
                    sign_payload(&subscription.secret, timestamp, &dead.body),
                ),
                ("X-Webhook-Replay".to_string(), "true".to_string()),
            ],
            body: dead.body,
            attempts: 0,
            replay: true,
        };
        self.send_with_retries(request).await
    }
}

#[async_trait]
impl EventPublisher for HookDispatcher {
    async fn publish(&self, event: &OutboxEvent) -> QueueResult<()> {
        self.dispatch(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeTransport {
        fail_first: AtomicU32,
        deliveries: Mutex<Vec<DeliveryRequest>>,
    }

    impl FakeTransport {
        fn new(fail_first: u32) -> Self {
            Self {
                fail_first: AtomicU32::new(fail_first),
                deliveries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DeliveryTransport for FakeTransport {
        async fn deliver(&self, request: &DeliveryRequest) -> QueueResult<u16> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Ok(503);
            }
            self.deliveries.lock().push(request.clone());
            Ok(200)
        }
    }

    fn event(queue: &str, priority: &str) -> OutboxEvent {
        OutboxEvent::new(
            "acme",
            "job-1",
            "job.dead_lettered",
            serde_json::json!({ "queue": queue, "priority": priority, "card": "4111" }),
        )
    }

    fn dispatcher(transport: Arc<FakeTransport>) -> HookDispatcher {
        HookDispatcher::new(transport, Arc::new(ChaosInjector::new())).with_max_attempts(2)
    }

    #[test]
    fn signature_round_trip_and_tamper_detection() {
        let body = r#"{"id":"e1"}"#;
        let now = Utc::now();
        let signature = sign_payload("hook-secret-0123456789", now.timestamp(), body);
        assert!(signature.starts_with("sha256="));

        assert!(verify_signature(
            "hook-secret-0123456789",
            now.timestamp(),
            body,
            &signature,
            Duration::from_secs(300),
            now
        ));
        // Tampered body
        assert!(!verify_signature(
            "hook-secret-0123456789",
            now.timestamp(),
            r#"{"id":"evil"}"#,
            &signature,
            Duration::from_secs(300),
            now
        ));
        // Wrong secret
        assert!(!verify_signature(
            "other-secret-0123456789",
            now.timestamp(),
            body,
            &signature,
            Duration::from_secs(300),
            now
        ));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let body = "{}";
        let then = Utc::now() - chrono::Duration::seconds(600);
        let signature = sign_payload("hook-secret-0123456789", then.timestamp(), body);
        assert!(!verify_signature(
            "hook-secret-0123456789",
            then.timestamp(),
            body,
            &signature,
            Duration::from_secs(300),
            Utc::now()
        ));
    }

    #[tokio::test]
    async fn delivery_carries_required_headers() {
        let transport = Arc::new(FakeTransport::new(0));
        let dispatcher = dispatcher(transport.clone());
        dispatcher
            .subscribe(HookSubscription::new(
                "https://receiver.example/hook",
                "hook-secret-0123456789",
            ))
            .unwrap();

        dispatcher.dispatch(&event("work", "normal")).await.unwrap();

        let deliveries = transport.deliveries.lock();
        assert_eq!(deliveries.len(), 1);
        let names: Vec<&str> = deliveries[0]
            .headers
            .iter()
            .map(|(n, _)| n.as_str())
            .collect();
        for required in [
            "X-Webhook-Delivery",
            "X-Webhook-Event",
            "X-Webhook-Timestamp",
            "X-Webhook-Job-ID",
            "X-Webhook-Queue",
            "X-Webhook-Signature",
        ] {
            assert!(names.contains(&required), "missing {}", required);
        }
    }

    #[tokio::test]
    async fn filters_respect_event_queue_and_priority() {
        let transport = Arc::new(FakeTransport::new(0));
        let dispatcher = dispatcher(transport.clone());
        let mut subscription = HookSubscription::new(
            "https://receiver.example/hook",
            "hook-secret-0123456789",
        );
        subscription.events = vec!["job.dead_lettered".to_string()];
        subscription.queues = vec!["payments".to_string()];
        subscription.min_priority = Priority::High;
        dispatcher.subscribe(subscription).unwrap();

        // Wrong queue
        dispatcher.dispatch(&event("work", "high")).await.unwrap();
        // Right queue, low priority
        dispatcher.dispatch(&event("payments", "low")).await.unwrap();
        assert!(transport.deliveries.lock().is_empty());

        // Matches
        dispatcher
            .dispatch(&event("payments", "critical"))
            .await
            .unwrap();
        assert_eq!(transport.deliveries.lock().len(), 1);
    }

    #[tokio::test]
    async fn redact_fields_scrub_payload() {
        let transport = Arc::new(FakeTransport::new(0));
        let dispatcher = dispatcher(transport.clone());
        let mut subscription = HookSubscription::new(
            "https://receiver.example/hook",
            "hook-secret-0123456789",
        );
        subscription.redact_fields = vec!["card".to_string()];
        dispatcher.subscribe(subscription).unwrap();

        dispatcher.dispatch(&event("work", "normal")).await.unwrap();
        let deliveries = transport.deliveries.lock();
        let body: serde_json::Value = serde_json::from_str(&deliveries[0].body).unwrap();
        assert_eq!(body["data"]["card"], "[redacted]");
    }

    #[tokio::test]
    async fn exhausted_delivery_dead_letters_then_replays() {
        // 2 attempts, 2 failures: dead-lettered
        let transport = Arc::new(FakeTransport::new(2));
        let dispatcher = dispatcher(transport.clone());
        dispatcher
            .subscribe(HookSubscription::new(
                "https://receiver.example/hook",
                "hook-secret-0123456789",
            ))
            .unwrap();

        let result = dispatcher.dispatch(&event("work", "normal")).await;
        assert!(result.is_err());
        let dead = dispatcher.dead_deliveries(10);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);

        // Replay succeeds and carries the replay marker
        dispatcher.replay_dead(&dead[0].delivery_id).await.unwrap();
        let deliveries = transport.deliveries.lock();
        assert_eq!(deliveries.len(), 1);
        assert!(deliveries[0]
            .headers
            .iter()
            .any(|(n, v)| n == "X-Webhook-Replay" && v == "true"));
        assert!(dispatcher.dead_deliveries(10).is_empty());
    }

    #[tokio::test]
    async fn invalid_subscription_rejected() {
        let dispatcher = dispatcher(Arc::new(FakeTransport::new(0)));
        assert!(dispatcher
            .subscribe(HookSubscription::new("ftp://nope", "hook-secret-0123456789"))
            .is_err());
        assert!(dispatcher
            .subscribe(HookSubscription::new("https://ok.example", "short"))
            .is_err());
    }

    #[tokio::test]
    async fn rate_limited_deliveries_buffer_and_flush() {
        let transport = Arc::new(FakeTransport::new(0));
        let dispatcher = dispatcher(transport.clone());
        let mut subscription = HookSubscription::new(
            "https://receiver.example/hook",
            "hook-secret-0123456789",
        );
        // One delivery per minute: the second dispatch buffers
        subscription.rate_limit = 1;
        dispatcher.subscribe(subscription).unwrap();

        dispatcher.dispatch(&event("work", "normal")).await.unwrap();
        dispatcher.dispatch(&event("work", "normal")).await.unwrap();
        assert_eq!(transport.deliveries.lock().len(), 1);

        let flushed = dispatcher.flush_buffers().await;
        assert_eq!(flushed, 1);
        assert_eq!(transport.deliveries.lock().len(), 2);
    }
}
