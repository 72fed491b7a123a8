//! Token-bucket rate limiting with priority fairness.
//!
//! Buckets are keyed by (tenant | global, scope). The in-process limiter
//! serializes each bucket behind its own mutex; the Redis-backed limiter
//! executes the refill-and-consume as one Lua script against the
//! `t:{tenant}:rl:{scope}` key, so concurrent producers on different
//! processes stay consistent. Refill time is monotonic: a backwards clock
//! step is ignored rather than minting tokens.

use dashmap::DashMap;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

use hoist_core::{Priority, QueueError, QueueResult, RateLimitConfig};

/// Result of a consume call
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    /// Tokens left after the call
    pub remaining: f64,
    /// How long until enough tokens accrue, when denied
    pub retry_after: Option<Duration>,
}

/// One bucket's state. Tokens never exceed `capacity`; refill is strictly
/// monotonic in elapsed time.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Deduct `cost` tokens if available. Mutates nothing on denial beyond
    /// the refill itself.
    pub fn try_consume(&mut self, cost: f64, now: Instant) -> ConsumeOutcome {
        self.refill(now);
        if self.tokens + 1e-9 >= cost {
            self.tokens -= cost;
            ConsumeOutcome {
                allowed: true,
                remaining: self.tokens,
                retry_after: None,
            }
        } else {
            let deficit = cost - self.tokens;
            let wait = if self.refill_rate > 0.0 {
                Duration::from_secs_f64(deficit / self.refill_rate)
            } else {
                Duration::from_secs(u64::MAX / 4)
            };
            ConsumeOutcome {
                allowed: false,
                remaining: self.tokens,
                retry_after: Some(wait),
            }
        }
    }

    /// Like [`try_consume`](Self::try_consume) but without mutating tokens
    pub fn peek_consume(&self, cost: f64, now: Instant) -> ConsumeOutcome {
        let mut copy = self.clone();
        copy.try_consume(cost, now)
    }
}

fn priority_weight(config: &RateLimitConfig, priority: Priority) -> f64 {
    match priority {
        Priority::Critical => config.weight_critical,
        Priority::High => config.weight_high,
        Priority::Normal => config.weight_normal,
        Priority::Low => config.weight_low,
    }
}

/// Token cost of `n` units at a priority: higher-weighted classes pay less
/// per unit, so they retain admission headroom under contention.
fn cost_of(config: &RateLimitConfig, n: u64, priority: Priority) -> f64 {
    let weight = priority_weight(config, priority).max(0.001);
    n as f64 * (config.weight_normal / weight)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    /// None = the global bucket
    tenant: Option<String>,
    scope: String,
}

/// In-process rate limiter. Every consume checks the tenant bucket and the
/// global bucket; both must admit.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<BucketKey, Mutex<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn bucket_settings(&self, key: &BucketKey) -> (f64, f64) {
        match key.tenant {
            None => (self.config.global_burst as f64, self.config.global_rps),
            Some(_) => (
                self.config.default_tenant_burst as f64,
                self.config.default_tenant_rps,
            ),
        }
    }

    fn consume_bucket(&self, key: BucketKey, cost: f64, dry_run: bool) -> ConsumeOutcome {
        let (capacity, rate) = self.bucket_settings(&key);
        let entry = self
            .buckets
            .entry(key)
            .or_insert_with(|| Mutex::new(TokenBucket::new(capacity, rate)));
        let mut bucket = entry.lock();
        let now = Instant::now();
        if dry_run {
            bucket.peek_consume(cost, now)
        } else {
            bucket.try_consume(cost, now)
        }
    }

    /// Consume `n` units for a tenant at a priority. Checks the tenant
    /// bucket first, then the global one; a global denial refunds the
    /// tenant-level deduction.
    pub fn consume(
        &self,
        tenant: &str,
        scope: &str,
        n: u64,
        priority: Priority,
    ) -> ConsumeOutcome {
        self.consume_inner(tenant, scope, n, priority, self.config.dry_run)
    }

    /// Report what a consume would do without spending tokens
    pub fn dry_run(&self, tenant: &str, scope: &str, n: u64, priority: Priority) -> ConsumeOutcome {
        self.consume_inner(tenant, scope, n, priority, true)
    }

    fn consume_inner(
        &self,
        tenant: &str,
        scope: &str,
        n: u64,
        priority: Priority,
        dry_run: bool,
    ) -> ConsumeOutcome {
        let cost = cost_of(&self.config, n, priority);
        let tenant_key = BucketKey {
            tenant: Some(tenant.to_string()),
            scope: scope.to_string(),
        };
        let global_key = BucketKey {
            tenant: None,
            scope: scope.to_string(),
        };

        let tenant_outcome = self.consume_bucket(tenant_key.clone(), cost, dry_run);
        if !tenant_outcome.allowed {
            return tenant_outcome;
        }

        let global_outcome = self.consume_bucket(global_key, cost, dry_run);
        if !global_outcome.allowed && !dry_run {
            // Refund the tenant-level deduction
            if let Some(entry) = self.buckets.get(&tenant_key) {
                let mut bucket = entry.lock();
                bucket.tokens = (bucket.tokens + cost).min(bucket.capacity);
            }
        }
        if global_outcome.allowed {
            tenant_outcome
        } else {
            global_outcome
        }
    }
}

/// Weighted-fair token allocation across priority classes.
///
/// Given available tokens and per-class demand: a guaranteed minimum share
/// is split evenly across demanding classes, the remainder by weight, and a
/// class left unfunded past `max_wait_time` receives a forced minimum on the
/// next round.
pub struct FairnessAllocator {
    config: RateLimitConfig,
    last_funded: Mutex<HashMap<Priority, Instant>>,
}

impl FairnessAllocator {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            last_funded: Mutex::new(HashMap::new()),
        }
    }

    /// Split `available` tokens across the demanding classes. Returned
    /// allocations never exceed demand and sum to at most `available`.
    pub fn allocate(&self, available: f64, demands: &[(Priority, f64)]) -> HashMap<Priority, f64> {
        let mut allocations: HashMap<Priority, f64> = HashMap::new();
        let demanding: Vec<(Priority, f64)> = demands
            .iter()
            .copied()
            .filter(|(_, d)| *d > 0.0)
            .collect();
        if demanding.is_empty() || available <= 0.0 {
            return allocations;
        }

        let mut remaining = available;

        // Guaranteed floor, split evenly
        let floor_pool = available * self.config.min_share;
        let per_class_floor = floor_pool / demanding.len() as f64;
        for (priority, demand) in &demanding {
            let grant = per_class_floor.min(*demand);
            *allocations.entry(*priority).or_insert(0.0) += grant;
            remaining -= grant;
        }

        // Weighted share of the remainder
        let total_weight: f64 = demanding
            .iter()
            .map(|(p, _)| priority_weight(&self.config, *p))
            .sum();
        if total_weight > 0.0 && remaining > 0.0 {
            for (priority, demand) in &demanding {
                let already = allocations.get(priority).copied().unwrap_or(0.0);
                let weight_share =
                    remaining * priority_weight(&self.config, *priority) / total_weight;
                let grant = weight_share.min((*demand - already).max(0.0));
                *allocations.entry(*priority).or_insert(0.0) += grant;
            }
        }

        // Starvation guard: a class unfunded past the wait bound takes a
        // minimum grant from the richest class.
        let now = Instant::now();
        let mut last_funded = self.last_funded.lock();
        for (priority, demand) in &demanding {
            let funded = allocations.get(priority).copied().unwrap_or(0.0) > 0.0;
            if funded {
                last_funded.insert(*priority, now);
                continue;
            }
            let starved_since = *last_funded.entry(*priority).or_insert(now);
            if now.duration_since(starved_since) >= self.config.max_wait_time {
                let minimum = (available * 0.01).max(1.0).min(*demand);
                if let Some((&richest, _)) = allocations
                    .iter()
                    .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                {
                    let taken = minimum.min(allocations[&richest]);
                    *allocations.get_mut(&richest).unwrap() -= taken;
                    *allocations.entry(*priority).or_insert(0.0) += taken;
                    last_funded.insert(*priority, now);
                    warn!(priority = %priority, "starvation guard funded class");
                }
            }
        }

        allocations
    }
}

/// Refill-and-consume in one round trip.
/// KEYS: bucket hash. ARGV: capacity, refill_rate, cost, now_ms, ttl_secs
const CONSUME_SCRIPT: &str = r#"
local tokens = tonumber(redis.call('HGET', KEYS[1], 'tokens') or ARGV[1])
local last = tonumber(redis.call('HGET', KEYS[1], 'last_refill') or ARGV[4])
local now = tonumber(ARGV[4])
local elapsed = (now - last) / 1000.0
if elapsed < 0 then elapsed = 0 end
tokens = math.min(tonumber(ARGV[1]), tokens + elapsed * tonumber(ARGV[2]))
local last_next = math.max(last, now)
local cost = tonumber(ARGV[3])
local allowed = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
end
redis.call('HSET', KEYS[1], 'tokens', tokens, 'last_refill', last_next)
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[5]))
return {allowed, tostring(tokens)}
"#;

/// Redis-backed limiter sharing bucket state across broker processes.
/// Falls back per configuration when the store is unreachable.
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    config: RateLimitConfig,
    script: Script,
}

impl RedisRateLimiter {
    pub fn new(conn: ConnectionManager, config: RateLimitConfig) -> Self {
        Self {
            conn,
            config,
            script: Script::new(CONSUME_SCRIPT),
        }
    }

    pub async fn consume(
        &self,
        tenant: &str,
        scope: &str,
        n: u64,
        priority: Priority,
    ) -> QueueResult<ConsumeOutcome> {
        let cost = cost_of(&self.config, n, priority);
        let key = format!("t:{}:rl:{}", tenant, scope);
        let mut conn = self.conn.clone();
        let result: Result<(i64, String), redis::RedisError> = self
            .script
            .key(&key)
            .arg(self.config.default_tenant_burst as f64)
            .arg(self.config.default_tenant_rps)
            .arg(cost)
            .arg(chrono::Utc::now().timestamp_millis())
            .arg(self.config.key_ttl.as_secs())
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok((allowed, remaining)) => {
                let remaining: f64 = remaining.parse().unwrap_or(0.0);
                if allowed == 1 {
                    Ok(ConsumeOutcome {
                        allowed: true,
                        remaining,
                        retry_after: None,
                    })
                } else {
                    let deficit = cost - remaining;
                    let retry_after = if self.config.default_tenant_rps > 0.0 {
                        Duration::from_secs_f64(deficit.max(0.0) / self.config.default_tenant_rps)
                    } else {
                        Duration::from_secs(60)
                    };
                    Ok(ConsumeOutcome {
                        allowed: false,
                        remaining,
                        retry_after: Some(retry_after),
                    })
                }
            }
            Err(e) => {
                warn!(error = %e, "rate-limit store unreachable, applying fallback");
                if self.config.fail_open {
                    Ok(ConsumeOutcome {
                        allowed: true,
                        remaining: 0.0,
                        retry_after: None,
                    })
                } else {
                    Err(QueueError::RateLimited {
                        retry_after: Duration::from_secs(1),
                    })
                }
            }
        }
    }
}
