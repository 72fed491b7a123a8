//! Runtime configuration surface.
//!
//! One constructed [`HoistConfig`] value is built at startup and passed by
//! reference into each subsystem; nothing reads process-global state after
//! init. Defaults are production-shaped; tests override individual fields.

use std::time::Duration;

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    RedisLists,
    RedisStreams,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::RedisLists => "redis_lists",
            Self::RedisStreams => "redis_streams",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = crate::QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "redis_lists" => Ok(Self::RedisLists),
            "redis_streams" => Ok(Self::RedisStreams),
            other => Err(crate::QueueError::Validation(format!(
                "unknown backend kind: {}",
                other
            ))),
        }
    }
}

/// Connection settings for the Redis-family store
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub addresses: Vec<String>,
    pub db: i64,
    pub password: Option<String>,
    pub tls: bool,
    pub pool_size: usize,
    /// Ceiling applied to every backend operation, independent of caller
    /// deadlines
    pub op_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::RedisLists,
            addresses: vec!["redis://127.0.0.1:6379".to_string()],
            db: 0,
            password: None,
            tls: false,
            pool_size: 16,
            op_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// Per-queue defaults, overridable per queue
#[derive(Debug, Clone)]
pub struct QueueDefaults {
    pub max_attempts: u32,
    pub visibility_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_payload_size: usize,
    /// Cadence of the visibility-timeout reclaim sweep
    pub reclaim_interval: Duration,
    /// Base delay of the retry backoff curve
    pub backoff_base: Duration,
    /// Cap applied to the backoff curve
    pub backoff_cap: Duration,
    /// Maximum jobs reserved at once per queue
    pub concurrency_cap: u64,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            visibility_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            max_payload_size: 1 << 20,
            reclaim_interval: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
            concurrency_cap: 1024,
        }
    }
}

/// Token-bucket rate limiting settings
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub global_rps: f64,
    pub global_burst: u64,
    pub default_tenant_rps: f64,
    pub default_tenant_burst: u64,
    /// Cost weights per priority class; higher priority consumes cheaper
    pub weight_critical: f64,
    pub weight_high: f64,
    pub weight_normal: f64,
    pub weight_low: f64,
    /// Fraction of tokens split evenly across classes before weighting
    pub min_share: f64,
    /// A class unfunded for this long receives a forced allocation
    pub max_wait_time: Duration,
    /// Bucket key TTL in the store
    pub key_ttl: Duration,
    /// When true, consume reports the outcome without mutating state
    pub dry_run: bool,
    /// Store unreachable: admit (true) or reject (false)
    pub fail_open: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_rps: 5000.0,
            global_burst: 10_000,
            default_tenant_rps: 100.0,
            default_tenant_burst: 200,
            weight_critical: 4.0,
            weight_high: 3.0,
            weight_normal: 2.0,
            weight_low: 1.0,
            min_share: 0.1,
            max_wait_time: Duration::from_secs(5),
            key_ttl: Duration::from_secs(3600),
            dry_run: false,
            fail_open: true,
        }
    }
}

/// Producer backpressure settings
#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    /// Backlog at or below which no delay applies
    pub green_threshold: u64,
    /// Backlog at or below which a linear delay applies
    pub yellow_threshold: u64,
    /// Red-zone ratio above which sheddable priorities are rejected
    pub shed_ratio: f64,
    /// Consecutive failures that open the circuit
    pub breaker_failure_threshold: u32,
    /// Window in which failures must occur
    pub breaker_window: Duration,
    /// Open-state cooldown before probing
    pub breaker_cooldown: Duration,
    /// Consecutive probe successes that close the circuit
    pub breaker_probe_successes: u32,
    /// Cadence of the backlog stats poll (jittered)
    pub poll_interval: Duration,
    /// Decisions served from cache for at most this long
    pub cache_ttl: Duration,
    /// Stats unavailable: admit (true) or reject (false)
    pub fail_open: bool,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            green_threshold: 1_000,
            yellow_threshold: 10_000,
            shed_ratio: 1.5,
            breaker_failure_threshold: 5,
            breaker_window: Duration::from_secs(30),
            breaker_cooldown: Duration::from_secs(15),
            breaker_probe_successes: 3,
            poll_interval: Duration::from_secs(2),
            cache_ttl: Duration::from_secs(5),
            fail_open: true,
        }
    }
}

/// Idempotency and outbox settings
#[derive(Debug, Clone)]
pub struct ExactlyOnceConfig {
    pub idempotency_ttl: Duration,
    pub key_prefix: String,
    /// Use one hash per queue instead of flat keys
    pub hash_layout: bool,
    pub outbox_enabled: bool,
    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: usize,
    pub outbox_max_attempts: u32,
    /// Cadence of the write-ahead reconciliation sweep
    pub reconcile_interval: Duration,
    /// Write-ahead records older than this are treated as orphaned
    pub orphan_window: Duration,
    /// Cadence of the expired-idempotency GC sweep
    pub gc_interval: Duration,
}

impl Default for ExactlyOnceConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl: Duration::from_secs(86_400),
            key_prefix: "idem".to_string(),
            hash_layout: false,
            outbox_enabled: true,
            outbox_poll_interval: Duration::from_secs(1),
            outbox_batch_size: 100,
            outbox_max_attempts: 8,
            reconcile_interval: Duration::from_secs(30),
            orphan_window: Duration::from_secs(600),
            gc_interval: Duration::from_secs(60),
        }
    }
}

/// SLO and burn-rate settings for the anomaly radar
#[derive(Debug, Clone)]
pub struct SloConfig {
    /// Availability target, e.g. 0.999
    pub availability_target: f64,
    /// P95 latency threshold counted against the SLO
    pub latency_threshold: Duration,
    /// SLO evaluation window
    pub window: Duration,
    pub fast_burn_threshold: f64,
    pub fast_burn_window: Duration,
    pub slow_burn_threshold: f64,
    pub slow_burn_window: Duration,
    /// Radar tick interval
    pub tick_interval: Duration,
    /// Snapshot retention
    pub retention: Duration,
    /// Cap on retained snapshots
    pub max_samples: usize,
    /// Signal must hold above/below threshold this long before transition
    pub dwell: Duration,
    /// Alert clears after the signal stays below threshold this long
    pub cooldown: Duration,
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            availability_target: 0.999,
            latency_threshold: Duration::from_millis(500),
            window: Duration::from_secs(30 * 86_400),
            fast_burn_threshold: 14.4,
            fast_burn_window: Duration::from_secs(3600),
            slow_burn_threshold: 3.0,
            slow_burn_window: Duration::from_secs(6 * 3600),
            tick_interval: Duration::from_secs(10),
            retention: Duration::from_secs(86_400),
            max_samples: 8_640,
            dwell: Duration::from_secs(30),
            cooldown: Duration::from_secs(120),
        }
    }
}

/// Tenancy guard rails
#[derive(Debug, Clone)]
pub struct TenancyConfig {
    pub min_jobs_per_hour: u64,
    pub max_jobs_per_hour: u64,
    pub encryption_default: bool,
    pub audit_retention: Duration,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            min_jobs_per_hour: 100,
            max_jobs_per_hour: 10_000_000,
            encryption_default: false,
            audit_retention: Duration::from_secs(90 * 86_400),
        }
    }
}

/// Distributed tracing settings
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub enabled: bool,
    pub endpoint: String,
    /// "always" | "ratio" | "never"
    pub sampling_strategy: String,
    pub sampling_rate: f64,
    /// Plaintext export; must not be combined with an https endpoint
    pub insecure: bool,
    /// "w3c" | "b3"
    pub propagation: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://127.0.0.1:4317".to_string(),
            sampling_strategy: "ratio".to_string(),
            sampling_rate: 0.1,
            insecure: true,
            propagation: "w3c".to_string(),
        }
    }
}

impl TracingConfig {
    /// An https endpoint combined with the insecure flag is a deployment
    /// mistake; fail fast instead of exporting plaintext.
    pub fn validate(&self) -> crate::QueueResult<()> {
        if self.enabled && self.insecure && self.endpoint.starts_with("https://") {
            return Err(crate::QueueError::Validation(
                "tracing endpoint uses https but the insecure flag is set".to_string(),
            ));
        }
        Ok(())
    }
}

/// RBAC token settings
#[derive(Debug, Clone)]
pub struct RbacConfig {
    pub token_ttl: Duration,
    pub key_rotation_interval: Duration,
    /// Old keys keep verifying for this long after rotation
    pub rotation_grace: Duration,
    pub allowed_algorithms: Vec<String>,
    pub default_deny: bool,
    /// Phrase required in destructive request bodies
    pub confirmation_phrase: String,
}

impl Default for RbacConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(3600),
            key_rotation_interval: Duration::from_secs(30 * 86_400),
            rotation_grace: Duration::from_secs(86_400),
            allowed_algorithms: vec!["HS256".to_string()],
            default_deny: true,
            confirmation_phrase: "CONFIRM_DELETE".to_string(),
        }
    }
}

/// Top-level runtime configuration
#[derive(Debug, Clone, Default)]
pub struct HoistConfig {
    pub backend: BackendConfig,
    pub queue: QueueDefaults,
    pub rate_limit: RateLimitConfig,
    pub backpressure: BackpressureConfig,
    pub exactly_once: ExactlyOnceConfig,
    pub slo: SloConfig,
    pub tenancy: TenancyConfig,
    pub tracing: TracingConfig,
    pub rbac: RbacConfig,
}

impl HoistConfig {
    /// Validate cross-field constraints that individual sections cannot see
    pub fn validate(&self) -> crate::QueueResult<()> {
        self.tracing.validate()?;
        if self.queue.visibility_timeout < self.queue.heartbeat_interval {
            return Err(crate::QueueError::Validation(
                "visibility_timeout must be at least the heartbeat_interval".to_string(),
            ));
        }
        if self.backpressure.yellow_threshold < self.backpressure.green_threshold {
            return Err(crate::QueueError::Validation(
                "yellow_threshold must be at least green_threshold".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        HoistConfig::default().validate().unwrap();
    }

    #[test]
    fn insecure_https_tracing_fails_fast() {
        let mut cfg = HoistConfig::default();
        cfg.tracing.enabled = true;
        cfg.tracing.insecure = true;
        cfg.tracing.endpoint = "https://collector:4317".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn visibility_below_heartbeat_rejected() {
        let mut cfg = HoistConfig::default();
        cfg.queue.visibility_timeout = Duration::from_secs(5);
        cfg.queue.heartbeat_interval = Duration::from_secs(15);
        assert!(cfg.validate().is_err());
    }
}
