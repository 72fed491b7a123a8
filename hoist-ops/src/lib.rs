//! # hoist-ops: reliability engineering subsystems
//!
//! The control loops that keep a Hoist deployment healthy:
//!
//! - [`FleetController`]: worker registration, heartbeat tracking,
//!   pause/drain/stop/restart with safety gates and rolling restarts
//! - [`CanaryController`]: two-lane deployments with traffic splits,
//!   health gating and auto-rollback
//! - [`AnomalyRadar`]: rolling-window metrics, two-tier thresholds, SLO
//!   burn-rate evaluation and alert hysteresis
//! - [`CapacityPlanner`]: arrival-rate forecasting, M/M/c sizing and
//!   scaling-plan generation
//! - [`RemediationPipeline`]: rule-matched DLQ classification with ordered
//!   actions, safety caps, dry-run and an audit trail

pub mod canary;
pub mod fleet;
pub mod planner;
pub mod radar;
pub mod remediation;

pub use canary::{
    CanaryController, CanaryDeployment, CanaryStatus, HealthVerdict, LaneMetrics,
    RoutingStrategy, ThresholdProfile,
};
pub use fleet::{
    ActionAudit, ControlAction, ControlOutcome, FleetController, FleetError, RollingRestartPlan,
    RollingRestartReport,
};
pub use planner::{
    CapacityPlan, CapacityPlanner, Forecast, ForecastModel, PlanConstraints, QueueingAssessment,
    ScalingStep,
};
pub use radar::{Alert, AlertSeverity, AnomalyRadar, BudgetRecord, MetricSnapshot, Signal};
pub use remediation::{
    ActionOutcome, AuditEntry, CompareOp, JobTypePredicate, Matcher, Notification,
    RemediationAction, RemediationPipeline, RemediationRule, RuleReport, RunReport, SafetyLimits,
};
