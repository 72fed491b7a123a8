use std::sync::Arc;

use hoist_admission::{BackpressureController, RateLimiter};
use hoist_backend::TenantStore;
use hoist_broker::Broker;
use hoist_core::{ChaosInjector, HoistConfig};
use hoist_exactly_once::{IdempotencyManager, IdempotencyStore, OutboxStore};
use hoist_ops::{CanaryController, CapacityPlanner, FleetController, AnomalyRadar, RemediationPipeline};

use crate::audit::AdminAudit;
use crate::auth::TokenAuthority;
use crate::hooks::HookDispatcher;

/// Everything the admin surface needs, constructed once at startup and
/// cloned into handlers. All fields are shared handles; there is no
/// process-global state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HoistConfig>,
    pub broker: Arc<Broker>,
    pub tenants: Arc<dyn TenantStore>,
    pub limiter: Arc<RateLimiter>,
    pub backpressure: Arc<BackpressureController>,
    pub fleet: Arc<FleetController>,
    pub canary: Arc<CanaryController>,
    pub radar: Arc<AnomalyRadar>,
    pub planner: Arc<CapacityPlanner>,
    pub remediation: Arc<RemediationPipeline>,
    pub hooks: Arc<HookDispatcher>,
    pub outbox: Arc<dyn OutboxStore>,
    pub idempotency: Arc<IdempotencyManager<Arc<dyn IdempotencyStore>>>,
    pub chaos: Arc<ChaosInjector>,
    pub authority: Arc<TokenAuthority>,
    pub audit: Arc<AdminAudit>,
}
