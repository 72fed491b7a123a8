//! Probabilistic fault injection.
//!
//! One injector table is consulted at designated points (reserve, ack,
//! outbox publish, webhook send, admission). Disabled by default; the admin
//! API enables it only behind a typed confirmation. Rules are keyed by
//! (point, scope, scope value) so faults can target one tenant or queue
//! without touching the rest of the system.

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// Point in the runtime where injection is consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChaosPoint {
    Reserve,
    Ack,
    OutboxPublish,
    WebhookSend,
    Admit,
}

impl ChaosPoint {
    pub fn name(self) -> &'static str {
        match self {
            Self::Reserve => "reserve",
            Self::Ack => "ack",
            Self::OutboxPublish => "outbox_publish",
            Self::WebhookSend => "webhook_send",
            Self::Admit => "admit",
        }
    }
}

/// What a rule applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "value", rename_all = "snake_case")]
pub enum ChaosScope {
    Global,
    Tenant(String),
    Queue(String),
}

/// One injection rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosRule {
    pub point: ChaosPoint,
    pub scope: ChaosScope,
    /// Probability of returning a synthetic failure
    pub failure_rate: f64,
    /// Probability of injecting latency
    pub latency_rate: f64,
    pub min_latency: Duration,
    pub max_latency: Duration,
}

impl ChaosRule {
    pub fn failing(point: ChaosPoint, scope: ChaosScope, failure_rate: f64) -> Self {
        Self {
            point,
            scope,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            latency_rate: 0.0,
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
        }
    }

    pub fn delaying(
        point: ChaosPoint,
        scope: ChaosScope,
        latency_rate: f64,
        min: Duration,
        max: Duration,
    ) -> Self {
        Self {
            point,
            scope,
            failure_rate: 0.0,
            latency_rate: latency_rate.clamp(0.0, 1.0),
            min_latency: min,
            max_latency: max.max(min),
        }
    }
}

/// Outcome of consulting the injector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChaosDecision {
    /// Proceed normally
    Pass,
    /// Sleep for the given duration, then proceed
    Delay(Duration),
    /// Fail the operation with a synthetic error
    Fail,
}

/// The injector table. Cheap to consult when disabled (one atomic load).
pub struct ChaosInjector {
    enabled: AtomicBool,
    rules: RwLock<HashMap<(ChaosPoint, ChaosScope), ChaosRule>>,
    rng: parking_lot::Mutex<StdRng>,
}

impl ChaosInjector {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            rules: RwLock::new(HashMap::new()),
            rng: parking_lot::Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic injector for tests
    pub fn with_seed(seed: u64) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            rules: RwLock::new(HashMap::new()),
            rng: parking_lot::Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn enable(&self) {
        warn!("chaos injection enabled");
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn upsert_rule(&self, rule: ChaosRule) {
        self.rules
            .write()
            .insert((rule.point, rule.scope.clone()), rule);
    }

    pub fn remove_rule(&self, point: ChaosPoint, scope: &ChaosScope) -> bool {
        self.rules.write().remove(&(point, scope.clone())).is_some()
    }

    pub fn rules(&self) -> Vec<ChaosRule> {
        self.rules.read().values().cloned().collect()
    }

    pub fn clear(&self) {
        self.rules.write().clear();
    }

    /// Consult the table at a designated point. Scope precedence:
    /// queue, then tenant, then global.
    pub fn decide(&self, point: ChaosPoint, tenant: &str, queue: &str) -> ChaosDecision {
        if !self.is_enabled() {
            return ChaosDecision::Pass;
        }

        let rules = self.rules.read();
        let rule = rules
            .get(&(point, ChaosScope::Queue(queue.to_string())))
            .or_else(|| rules.get(&(point, ChaosScope::Tenant(tenant.to_string()))))
            .or_else(|| rules.get(&(point, ChaosScope::Global)));

        let Some(rule) = rule else {
            return ChaosDecision::Pass;
        };

        let (fail_roll, latency_roll, latency_frac): (f64, f64, f64) = {
            let mut rng = self.rng.lock();
            (rng.gen(), rng.gen(), rng.gen())
        };

        if fail_roll < rule.failure_rate {
            return ChaosDecision::Fail;
        }
        if latency_roll < rule.latency_rate {
            let span = rule.max_latency.saturating_sub(rule.min_latency);
            let extra = span.mul_f64(latency_frac);
            return ChaosDecision::Delay(rule.min_latency + extra);
        }
        ChaosDecision::Pass
    }
}

impl Default for ChaosInjector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_injector_always_passes() {
        let injector = ChaosInjector::with_seed(1);
        injector.upsert_rule(ChaosRule::failing(
            ChaosPoint::Reserve,
            ChaosScope::Global,
            1.0,
        ));
        assert_eq!(
            injector.decide(ChaosPoint::Reserve, "acme", "q"),
            ChaosDecision::Pass
        );
    }

    #[test]
    fn certain_failure_rule_fails() {
        let injector = ChaosInjector::with_seed(1);
        injector.enable();
        injector.upsert_rule(ChaosRule::failing(
            ChaosPoint::Reserve,
            ChaosScope::Global,
            1.0,
        ));
        assert_eq!(
            injector.decide(ChaosPoint::Reserve, "acme", "q"),
            ChaosDecision::Fail
        );
    }

    #[test]
    fn queue_scope_takes_precedence_over_global() {
        let injector = ChaosInjector::with_seed(1);
        injector.enable();
        injector.upsert_rule(ChaosRule::failing(
            ChaosPoint::Ack,
            ChaosScope::Global,
            1.0,
        ));
        injector.upsert_rule(ChaosRule::failing(
            ChaosPoint::Ack,
            ChaosScope::Queue("quiet".to_string()),
            0.0,
        ));
        assert_eq!(
            injector.decide(ChaosPoint::Ack, "acme", "quiet"),
            ChaosDecision::Pass
        );
        assert_eq!(
            injector.decide(ChaosPoint::Ack, "acme", "other"),
            ChaosDecision::Fail
        );
    }

    #[test]
    fn delay_rule_stays_within_bounds() {
        let injector = ChaosInjector::with_seed(42);
        injector.enable();
        injector.upsert_rule(ChaosRule::delaying(
            ChaosPoint::WebhookSend,
            ChaosScope::Global,
            1.0,
            Duration::from_millis(10),
            Duration::from_millis(50),
        ));
        for _ in 0..20 {
            match injector.decide(ChaosPoint::WebhookSend, "acme", "q") {
                ChaosDecision::Delay(d) => {
                    assert!(d >= Duration::from_millis(10));
                    assert!(d <= Duration::from_millis(50));
                }
                other => panic!("expected delay, got {:?}", other),
            }
        }
    }

    #[test]
    fn remove_rule_restores_pass() {
        let injector = ChaosInjector::with_seed(7);
        injector.enable();
        let scope = ChaosScope::Tenant("acme".to_string());
        injector.upsert_rule(ChaosRule::failing(ChaosPoint::Admit, scope.clone(), 1.0));
        assert_eq!(
            injector.decide(ChaosPoint::Admit, "acme", "q"),
            ChaosDecision::Fail
        );
        assert!(injector.remove_rule(ChaosPoint::Admit, &scope));
        assert_eq!(
            injector.decide(ChaosPoint::Admit, "acme", "q"),
            ChaosDecision::Pass
        );
    }
}
