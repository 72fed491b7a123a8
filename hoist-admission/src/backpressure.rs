//! Producer backpressure.
//!
//! Backlog thresholds split each queue into three zones: green passes,
//! yellow throttles with a linearly growing delay, red throttles hard and
//! sheds low/normal priority work once the shed ratio is exceeded. High and
//! critical priority is never shed. A per-queue circuit breaker rejects
//! producers outright while the queue's backend is failing. Backlog numbers
//! come from a jittered stats poller through a bounded cache, so the
//! decision path never waits on the backend.

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use hoist_backend::QueueScope;
use hoist_broker::Broker;
use hoist_core::{BackpressureConfig, Priority, QueueError, QueueResult, TenantCtx};

/// What the producer should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackpressureDecision {
    /// Enqueue immediately
    Proceed,
    /// Enqueue after the recommended delay
    Throttle(Duration),
    /// Reject; the caller may retry later or drop
    Shed,
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-queue circuit breaker: closed → open after N consecutive failures
/// within the window; open → half-open after the cooldown; half-open →
/// closed after M consecutive probe successes, else back to open.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    probe_successes: u32,
    failure_threshold: u32,
    window: Duration,
    cooldown: Duration,
    probe_target: u32,
}

impl CircuitBreaker {
    pub fn new(config: &BackpressureConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            first_failure_at: None,
            opened_at: None,
            probe_successes: 0,
            failure_threshold: config.breaker_failure_threshold,
            window: config.breaker_window,
            cooldown: config.breaker_cooldown,
            probe_target: config.breaker_probe_successes,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a call may pass right now. Transitions open → half-open when
    /// the cooldown has elapsed.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if let Some(opened_at) = self.opened_at {
                    if now.duration_since(opened_at) >= self.cooldown {
                        self.state = BreakerState::HalfOpen;
                        self.probe_successes = 0;
                        debug!("circuit half-open, probing");
                        return true;
                    }
                }
                false
            }
        }
    }

    pub fn record_success(&mut self, _now: Instant) {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures = 0;
                self.first_failure_at = None;
            }
            BreakerState::HalfOpen => {
                self.probe_successes += 1;
                if self.probe_successes >= self.probe_target {
                    info!("circuit closed after successful probes");
                    self.state = BreakerState::Closed;
                    self.consecutive_failures = 0;
                    self.first_failure_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            BreakerState::HalfOpen => {
                warn!("probe failed, circuit re-opened");
                self.trip(now);
            }
            BreakerState::Closed => {
                match self.first_failure_at {
                    Some(first) if now.duration_since(first) <= self.window => {
                        self.consecutive_failures += 1;
                    }
                    _ => {
                        self.first_failure_at = Some(now);
                        self.consecutive_failures = 1;
                    }
                }
                if self.consecutive_failures >= self.failure_threshold {
                    warn!(
                        failures = self.consecutive_failures,
                        "failure threshold reached, circuit opened"
                    );
                    self.trip(now);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.probe_successes = 0;
    }
}

struct CachedBacklog {
    backlog: u64,
    fetched_at: Instant,
}

/// Zone evaluation plus breaker bookkeeping per queue
pub struct BackpressureController {
    config: BackpressureConfig,
    breakers: DashMap<QueueScope, Mutex<CircuitBreaker>>,
    cache: DashMap<QueueScope, CachedBacklog>,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            cache: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// Pure zone decision for a known backlog
    pub fn evaluate(&self, backlog: u64, priority: Priority) -> BackpressureDecision {
        let green = self.config.green_threshold;
        let yellow = self.config.yellow_threshold;

        if backlog <= green {
            return BackpressureDecision::Proceed;
        }
        if backlog <= yellow {
            // Linear between 10ms and 500ms across the yellow band
            let span = (yellow - green).max(1) as f64;
            let frac = (backlog - green) as f64 / span;
            let delay_ms = 10.0 + frac * (500.0 - 10.0);
            return BackpressureDecision::Throttle(Duration::from_millis(delay_ms as u64));
        }

        // Red zone: shed sheddable priorities past the shed ratio, throttle
        // everything else between 500ms and 5s, gentler for higher classes.
        let ratio = backlog as f64 / yellow.max(1) as f64;
        if priority.sheddable() && ratio > self.config.shed_ratio {
            return BackpressureDecision::Shed;
        }
        let class_factor = match priority {
            Priority::Critical => 0.0,
            Priority::High => 0.33,
            Priority::Normal => 0.66,
            Priority::Low => 1.0,
        };
        let delay_ms = 500.0 + class_factor * (5000.0 - 500.0);
        BackpressureDecision::Throttle(Duration::from_millis(delay_ms as u64))
    }

    /// Decision for a queue using the cached backlog. Cache misses consult
    /// the supplied fallback; a missing backlog applies the configured
    /// fail-open/closed mode.
    pub fn decide(&self, scope: &QueueScope, priority: Priority) -> QueueResult<BackpressureDecision> {
        // Breaker check first: a failing backend sheds producers outright
        {
            let breaker = self
                .breakers
                .entry(scope.clone())
                .or_insert_with(|| Mutex::new(CircuitBreaker::new(&self.config)));
            if !breaker.lock().allow(Instant::now()) {
                return Err(QueueError::CircuitOpen {
                    queue: scope.queue.clone(),
                });
            }
        }

        let backlog = match self.cache.get(scope) {
            Some(cached) if cached.fetched_at.elapsed() <= self.config.cache_ttl => {
                Some(cached.backlog)
            }
            _ => None,
        };

        match backlog {
            Some(backlog) => {
                let decision = self.evaluate(backlog, priority);
                if decision == BackpressureDecision::Shed {
                    return Err(QueueError::Shed {
                        queue: scope.queue.clone(),
                    });
                }
                Ok(decision)
            }
            None if self.config.fail_open => Ok(BackpressureDecision::Proceed),
            None => Err(QueueError::BackendUnavailable(
                "backlog stats unavailable".to_string(),
            )),
        }
    }

    /// Store a freshly polled backlog
    pub fn record_backlog(&self, scope: QueueScope, backlog: u64) {
        self.cache.insert(
            scope,
            CachedBacklog {
                backlog,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Feed the per-queue breaker with an enqueue outcome
    pub fn record_outcome(&self, scope: &QueueScope, success: bool) {
        let breaker = self
            .breakers
            .entry(scope.clone())
            .or_insert_with(|| Mutex::new(CircuitBreaker::new(&self.config)));
        let mut breaker = breaker.lock();
        let now = Instant::now();
        if success {
            breaker.record_success(now);
        } else {
            breaker.record_failure(now);
        }
    }

    pub fn breaker_state(&self, scope: &QueueScope) -> BreakerState {
        self.breakers
            .get(scope)
            .map(|b| b.lock().state())
            .unwrap_or(BreakerState::Closed)
    }
}

/// Handle for stopping the poller
pub struct PollerHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl PollerHandle {
    pub async fn shutdown(self) -> QueueResult<()> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| QueueError::Internal(format!("poller join error: {}", e)))
    }
}

/// Refreshes backlog numbers for every known scope on a jittered interval
pub struct BackpressurePoller {
    broker: Arc<Broker>,
    controller: Arc<BackpressureController>,
    interval: Duration,
}

impl BackpressurePoller {
    pub fn new(broker: Arc<Broker>, controller: Arc<BackpressureController>) -> Self {
        let interval = controller.config().poll_interval;
        Self {
            broker,
            controller,
            interval,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn start(self) -> PollerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        info!(interval = ?self.interval, "starting backpressure poller");

        let join_handle = tokio::spawn(async move {
            loop {
                let factor = rand::thread_rng().gen_range(0.8..1.2);
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = sleep(self.interval.mul_f64(factor)) => {
                        self.poll_once().await;
                    }
                }
            }
        });

        PollerHandle {
            shutdown_tx,
            join_handle,
        }
    }

    /// One refresh pass
    pub async fn poll_once(&self) {
        for scope in self.broker.known_scopes() {
            let ctx = TenantCtx::new(scope.tenant.clone());
            match self.broker.stats(&ctx, &scope.queue).await {
                Ok(stats) => {
                    self.controller.record_backlog(scope.clone(), stats.backlog());
                    self.controller.record_outcome(&scope, true);
                }
                Err(e) => {
                    debug!(scope = %scope, error = %e, "stats poll failed");
                    self.controller.record_outcome(&scope, false);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoist_core::TenantId;

    fn config() -> BackpressureConfig {
        BackpressureConfig {
            green_threshold: 100,
            yellow_threshold: 1000,
            shed_ratio: 1.5,
            breaker_failure_threshold: 3,
            breaker_window: Duration::from_secs(30),
            breaker_cooldown: Duration::from_millis(50),
            breaker_probe_successes: 2,
            ..BackpressureConfig::default()
        }
    }

    fn scope() -> QueueScope {
        QueueScope::new(TenantId::new("acme").unwrap(), "work")
    }

    #[test]
    fn green_zone_passes() {
        let controller = BackpressureController::new(config());
        assert_eq!(
            controller.evaluate(50, Priority::Low),
            BackpressureDecision::Proceed
        );
    }

    #[test]
    fn yellow_zone_delay_grows_linearly() {
        let controller = BackpressureController::new(config());
        let early = match controller.evaluate(150, Priority::Normal) {
            BackpressureDecision::Throttle(d) => d,
            other => panic!("expected throttle, got {:?}", other),
        };
        let late = match controller.evaluate(950, Priority::Normal) {
            BackpressureDecision::Throttle(d) => d,
            other => panic!("expected throttle, got {:?}", other),
        };
        assert!(early >= Duration::from_millis(10));
        assert!(late <= Duration::from_millis(500));
        assert!(late > early);
    }

    #[test]
    fn red_zone_sheds_only_sheddable_priorities() {
        let controller = BackpressureController::new(config());
        // ratio 2.0 > shed_ratio 1.5
        assert_eq!(
            controller.evaluate(2000, Priority::Low),
            BackpressureDecision::Shed
        );
        assert_eq!(
            controller.evaluate(2000, Priority::Normal),
            BackpressureDecision::Shed
        );
        // High and critical are throttled, never shed
        assert!(matches!(
            controller.evaluate(2000, Priority::High),
            BackpressureDecision::Throttle(_)
        ));
        assert!(matches!(
            controller.evaluate(2000, Priority::Critical),
            BackpressureDecision::Throttle(_)
        ));
    }

    #[test]
    fn red_zone_delay_scales_by_priority() {
        let controller = BackpressureController::new(config());
        let critical = match controller.evaluate(1200, Priority::Critical) {
            BackpressureDecision::Throttle(d) => d,
            other => panic!("{:?}", other),
        };
        let low = match controller.evaluate(1200, Priority::Low) {
            BackpressureDecision::Throttle(d) => d,
            other => panic!("{:?}", other),
        };
        assert_eq!(critical, Duration::from_millis(500));
        assert_eq!(low, Duration::from_millis(5000));
    }

    #[test]
    fn breaker_opens_after_threshold_and_recovers() {
        let cfg = config();
        let mut breaker = CircuitBreaker::new(&cfg);
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(breaker.allow(t0));
            breaker.record_failure(t0);
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow(t0));

        // After cooldown: half-open, probes close it
        let later = t0 + Duration::from_millis(60);
        assert!(breaker.allow(later));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success(later);
        breaker.record_success(later);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cfg = config();
        let mut breaker = CircuitBreaker::new(&cfg);
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(t0);
        }
        let later = t0 + Duration::from_millis(60);
        assert!(breaker.allow(later));
        breaker.record_failure(later);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow(later));
    }

    #[test]
    fn decide_errors_distinguish_shed_and_open() {
        let controller = BackpressureController::new(config());
        let scope = scope();

        controller.record_backlog(scope.clone(), 2000);
        let shed = controller.decide(&scope, Priority::Low);
        assert!(matches!(shed, Err(QueueError::Shed { .. })));

        for _ in 0..3 {
            controller.record_outcome(&scope, false);
        }
        let open = controller.decide(&scope, Priority::Low);
        assert!(matches!(open, Err(QueueError::CircuitOpen { .. })));
    }

    #[test]
    fn stale_cache_fails_open_by_default() {
        let mut cfg = config();
        cfg.cache_ttl = Duration::ZERO;
        let controller = BackpressureController::new(cfg);
        let scope = scope();
        controller.record_backlog(scope.clone(), 1_000_000);
        // TTL zero: the cached entry is already stale, fail-open admits
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(
            controller.decide(&scope, Priority::Low).unwrap(),
            BackpressureDecision::Proceed
        );
    }
}
