//! Canary deployment controller.
//!
//! A deployment pins a queue to two worker lanes with a traffic split.
//! Health is judged per metrics window by comparing the canary lane's
//! error rate, P95 latency and throughput against stable, with minimum
//! sample-size and duration gates. Failing checks (or an explicit
//! rollback) drive the split to zero and mark the deployment failed;
//! auto-promotion walks a percent ladder after each healthy window.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use hoist_core::{Lane, QueueError, QueueResult};

/// How jobs are routed between lanes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Two physical queues with weighted producer routing
    SplitQueue,
    /// One stream with differentiated consumer groups
    StreamGroup,
    /// Deterministic partitioning on a job attribute for sticky routing
    HashRing,
}

/// Gate thresholds per evaluation window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdProfile {
    /// Max tolerated error-rate delta (canary minus stable)
    pub max_error_rate_delta: f64,
    /// Max tolerated P95 latency delta, fractional
    pub max_latency_delta: f64,
    /// Max tolerated throughput drop, fractional
    pub max_throughput_drop: f64,
    /// Minimum canary samples per window
    pub min_sample_size: u64,
    /// Minimum window duration
    pub min_duration: Duration,
}

impl ThresholdProfile {
    pub fn conservative() -> Self {
        Self {
            max_error_rate_delta: 0.01,
            max_latency_delta: 0.10,
            max_throughput_drop: 0.05,
            min_sample_size: 500,
            min_duration: Duration::from_secs(600),
        }
    }

    pub fn default_profile() -> Self {
        Self {
            max_error_rate_delta: 0.05,
            max_latency_delta: 0.25,
            max_throughput_drop: 0.15,
            min_sample_size: 100,
            min_duration: Duration::from_secs(300),
        }
    }

    pub fn aggressive() -> Self {
        Self {
            max_error_rate_delta: 0.10,
            max_latency_delta: 0.50,
            max_throughput_drop: 0.30,
            min_sample_size: 25,
            min_duration: Duration::from_secs(60),
        }
    }
}

/// Observed lane behavior over one window
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaneMetrics {
    pub requests: u64,
    pub errors: u64,
    pub latency_p95: Duration,
    pub throughput: f64,
}

impl LaneMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests as f64
        }
    }
}

/// Health check verdict for one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum HealthVerdict {
    Passing,
    /// Not enough data yet
    Inconclusive { reason: String },
    Failing { reasons: Vec<String> },
}

/// Deployment lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryStatus {
    Active,
    Promoted,
    Failed,
    RolledBack,
}

/// One canary deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryDeployment {
    pub id: String,
    pub queue: String,
    pub stable_version: String,
    pub canary_version: String,
    pub strategy: RoutingStrategy,
    pub current_percent: u8,
    pub status: CanaryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub auto_promote: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub window_started_at: DateTime<Utc>,
}

impl CanaryDeployment {
    /// Which lane a job routes to under sticky hash-ring routing
    pub fn sticky_lane(&self, routing_key: &str) -> Lane {
        // FNV-1a keeps the assignment stable across processes
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in routing_key.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        if (hash % 100) < self.current_percent as u64 {
            Lane::Canary
        } else {
            Lane::Stable
        }
    }
}

/// Promotion ladder walked on each healthy window
const PROMOTION_LADDER: [u8; 6] = [5, 10, 25, 50, 75, 100];

/// Creates, evaluates and promotes/rolls back canary deployments
pub struct CanaryController {
    deployments: RwLock<HashMap<String, CanaryDeployment>>,
    profile: ThresholdProfile,
}

impl CanaryController {
    pub fn new(profile: ThresholdProfile) -> Self {
        Self {
            deployments: RwLock::new(HashMap::new()),
            profile,
        }
    }

    pub fn create(
        &self,
        queue: impl Into<String>,
        stable_version: impl Into<String>,
        canary_version: impl Into<String>,
        strategy: RoutingStrategy,
        initial_percent: u8,
        auto_promote: bool,
    ) -> QueueResult<CanaryDeployment> {
        let queue = queue.into();
        if initial_percent > 100 {
            return Err(QueueError::Validation(
                "initial percent must be 0-100".to_string(),
            ));
        }
        let mut deployments = self.deployments.write();
        if deployments.values().any(|d| {
            d.queue == queue && d.status == CanaryStatus::Active
        }) {
            return Err(QueueError::Conflict(format!(
                "queue '{}' already has an active canary",
                queue
            )));
        }

        let now = Utc::now();
        let deployment = CanaryDeployment {
            id: uuid::Uuid::new_v4().to_string(),
            queue,
            stable_version: stable_version.into(),
            canary_version: canary_version.into(),
            strategy,
            current_percent: initial_percent,
            status: CanaryStatus::Active,
            failure_reason: None,
            auto_promote,
            created_at: now,
            updated_at: now,
            window_started_at: now,
        };
        info!(deployment = %deployment.id, percent = initial_percent, "canary created");
        deployments.insert(deployment.id.clone(), deployment.clone());
        Ok(deployment)
    }

    pub fn get(&self, id: &str) -> QueueResult<CanaryDeployment> {
        self.deployments
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::JobNotFound(format!("canary deployment {}", id)))
    }

    pub fn list(&self) -> Vec<CanaryDeployment> {
        self.deployments.read().values().cloned().collect()
    }

    /// Judge one metrics window
    pub fn evaluate(
        &self,
        deployment: &CanaryDeployment,
        stable: &LaneMetrics,
        canary: &LaneMetrics,
    ) -> HealthVerdict {
        let elapsed = Utc::now() - deployment.window_started_at;
        let min_duration = chrono::Duration::from_std(self.profile.min_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        if elapsed < min_duration {
            return HealthVerdict::Inconclusive {
                reason: format!(
                    "window open {}s of {}s",
                    elapsed.num_seconds(),
                    min_duration.num_seconds()
                ),
            };
        }
        if canary.requests < self.profile.min_sample_size {
            return HealthVerdict::Inconclusive {
                reason: format!(
                    "{} canary samples, need {}",
                    canary.requests, self.profile.min_sample_size
                ),
            };
        }

        let mut reasons = Vec::new();

        let error_delta = canary.error_rate() - stable.error_rate();
        if error_delta > self.profile.max_error_rate_delta {
            reasons.push(format!(
                "error_rate delta {:.4} exceeds {:.4}",
                error_delta, self.profile.max_error_rate_delta
            ));
        }

        if stable.latency_p95 > Duration::ZERO {
            let latency_delta = canary.latency_p95.as_secs_f64() / stable.latency_p95.as_secs_f64()
                - 1.0;
            if latency_delta > self.profile.max_latency_delta {
                reasons.push(format!(
                    "latency_p95 delta {:.2} exceeds {:.2}",
                    latency_delta, self.profile.max_latency_delta
                ));
            }
        }

        if stable.throughput > 0.0 {
            let drop = 1.0 - canary.throughput / stable.throughput;
            if drop > self.profile.max_throughput_drop {
                reasons.push(format!(
                    "throughput drop {:.2} exceeds {:.2}",
                    drop, self.profile.max_throughput_drop
                ));
            }
        }

        if reasons.is_empty() {
            HealthVerdict::Passing
        } else {
            HealthVerdict::Failing { reasons }
        }
    }

    /// Evaluate a window and act: rollback on failure, promote a step when
    /// auto-promotion is on. Returns the updated deployment.
    pub fn tick(
        &self,
        id: &str,
        stable: &LaneMetrics,
        canary: &LaneMetrics,
    ) -> QueueResult<CanaryDeployment> {
        let deployment = self.get(id)?;
        if deployment.status != CanaryStatus::Active {
            return Ok(deployment);
        }

        match self.evaluate(&deployment, stable, canary) {
            HealthVerdict::Failing { reasons } => {
                let reason = reasons.join("; ");
                warn!(deployment = %id, reason, "canary failing, rolling back");
                self.finish(id, CanaryStatus::Failed, Some(reason))
            }
            HealthVerdict::Passing if deployment.auto_promote => self.promote_step(id),
            _ => Ok(deployment),
        }
    }

    /// Advance the split one rung up the ladder; 100% completes promotion
    pub fn promote_step(&self, id: &str) -> QueueResult<CanaryDeployment> {
        let mut deployments = self.deployments.write();
        let deployment = deployments
            .get_mut(id)
            .ok_or_else(|| QueueError::JobNotFound(format!("canary deployment {}", id)))?;
        if deployment.status != CanaryStatus::Active {
            return Err(QueueError::Conflict(format!(
                "deployment is {:?}",
                deployment.status
            )));
        }

        let next = PROMOTION_LADDER
            .iter()
            .copied()
            .find(|p| *p > deployment.current_percent)
            .unwrap_or(100);
        deployment.current_percent = next;
        deployment.window_started_at = Utc::now();
        deployment.updated_at = Utc::now();
        if next >= 100 {
            deployment.status = CanaryStatus::Promoted;
            deployment.stable_version = deployment.canary_version.clone();
            info!(deployment = %id, "canary promoted to 100%");
        } else {
            info!(deployment = %id, percent = next, "canary promoted a step");
        }
        Ok(deployment.clone())
    }

    /// Drive the split to zero and mark the deployment finished
    pub fn rollback(&self, id: &str, reason: impl Into<String>) -> QueueResult<CanaryDeployment> {
        self.finish(id, CanaryStatus::RolledBack, Some(reason.into()))
    }

    fn finish(
        &self,
        id: &str,
        status: CanaryStatus,
        reason: Option<String>,
    ) -> QueueResult<CanaryDeployment> {
        let mut deployments = self.deployments.write();
        let deployment = deployments
            .get_mut(id)
            .ok_or_else(|| QueueError::JobNotFound(format!("canary deployment {}", id)))?;
        deployment.current_percent = 0;
        deployment.status = status;
        deployment.failure_reason = reason;
        deployment.updated_at = Utc::now();
        Ok(deployment.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> CanaryController {
        // Zero gates so evaluation is immediate in tests
        CanaryController::new(ThresholdProfile {
            min_sample_size: 10,
            min_duration: Duration::ZERO,
            ..ThresholdProfile::default_profile()
        })
    }

    fn metrics(requests: u64, errors: u64, p95_ms: u64, throughput: f64) -> LaneMetrics {
        LaneMetrics {
            requests,
            errors,
            latency_p95: Duration::from_millis(p95_ms),
            throughput,
        }
    }

    #[test]
    fn create_rejects_duplicate_active_canary() {
        let controller = controller();
        controller
            .create("q", "1.0", "1.1", RoutingStrategy::SplitQueue, 10, false)
            .unwrap();
        let result = controller.create("q", "1.0", "1.2", RoutingStrategy::SplitQueue, 10, false);
        assert!(matches!(result, Err(QueueError::Conflict(_))));
    }

    #[test]
    fn elevated_error_rate_rolls_back_with_reason() {
        let controller = controller();
        let deployment = controller
            .create("q", "1.0", "1.1", RoutingStrategy::SplitQueue, 10, false)
            .unwrap();

        // Canary error rate 20 points above stable
        let stable = metrics(1000, 10, 100, 100.0);
        let canary = metrics(100, 21, 100, 10.0);
        let updated = controller.tick(&deployment.id, &stable, &canary).unwrap();

        assert_eq!(updated.status, CanaryStatus::Failed);
        assert_eq!(updated.current_percent, 0);
        assert!(updated.failure_reason.unwrap().contains("error_rate"));
    }

    #[test]
    fn small_sample_is_inconclusive() {
        let controller = controller();
        let deployment = controller
            .create("q", "1.0", "1.1", RoutingStrategy::SplitQueue, 10, false)
            .unwrap();
        let verdict = controller.evaluate(
            &deployment,
            &metrics(1000, 0, 100, 100.0),
            &metrics(3, 3, 100, 1.0),
        );
        assert!(matches!(verdict, HealthVerdict::Inconclusive { .. }));
    }

    #[test]
    fn auto_promotion_walks_ladder_to_completion() {
        let controller = controller();
        let deployment = controller
            .create("q", "1.0", "1.1", RoutingStrategy::StreamGroup, 5, true)
            .unwrap();

        let stable = metrics(1000, 5, 100, 100.0);
        let canary = metrics(500, 2, 100, 50.0);

        let mut current = deployment;
        for expected in [10, 25, 50, 75, 100] {
            current = controller.tick(&current.id, &stable, &canary).unwrap();
            assert_eq!(current.current_percent, expected);
        }
        assert_eq!(current.status, CanaryStatus::Promoted);
        assert_eq!(current.stable_version, "1.1");
    }

    #[test]
    fn explicit_rollback_drives_percent_to_zero() {
        let controller = controller();
        let deployment = controller
            .create("q", "1.0", "1.1", RoutingStrategy::HashRing, 50, false)
            .unwrap();
        let updated = controller.rollback(&deployment.id, "operator call").unwrap();
        assert_eq!(updated.status, CanaryStatus::RolledBack);
        assert_eq!(updated.current_percent, 0);
    }

    #[test]
    fn sticky_routing_is_deterministic_and_split_tracks_percent() {
        let controller = controller();
        let mut deployment = controller
            .create("q", "1.0", "1.1", RoutingStrategy::HashRing, 20, false)
            .unwrap();

        // Deterministic: same key, same lane
        for key in ["job-a", "job-b", "tenant-7"] {
            assert_eq!(deployment.sticky_lane(key), deployment.sticky_lane(key));
        }

        // Split roughly tracks the percent
        let canary_share = (0..10_000)
            .filter(|i| deployment.sticky_lane(&format!("key-{}", i)) == Lane::Canary)
            .count() as f64
            / 10_000.0;
        assert!((canary_share - 0.20).abs() < 0.05, "share {}", canary_share);

        deployment.current_percent = 0;
        assert_eq!(deployment.sticky_lane("anything"), Lane::Stable);
    }
}
