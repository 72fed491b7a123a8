//! # hoist-http: the admin and observability plane
//!
//! Authenticated operational surface over the core runtime:
//!
//! - [`ApiError`]: the standardized error envelope `{code, error, status,
//!   request_id, timestamp, details?}`
//! - [`TokenAuthority`]: HMAC-SHA256 signed RBAC tokens with key rotation
//!   and `jti` revocation; default-deny authorization
//! - [`HookDispatcher`]: signed webhook deliveries with retries, a
//!   per-subscription circuit breaker and rate limit, and a dead-letter
//!   store with manual replay
//! - [`AdminAudit`]: bounded audit log written for every destructive
//!   operation regardless of outcome
//! - [`build_router`]: the `/api/v1` surface (stats, queues, tenants,
//!   workers, canary, anomaly radar, capacity, DLQ, remediation, event
//!   hooks, exactly-once, chaos)

pub mod audit;
pub mod auth;
pub mod error;
pub mod hooks;
pub mod pagination;
pub mod routes;
pub mod state;

pub use audit::{AdminAudit, AdminAuditEntry};
pub use auth::{AuthContext, Permission, Role, TokenAuthority, TokenClaims};
pub use error::ApiError;
pub use hooks::{
    sign_payload, verify_signature, DeadDelivery, DeliveryRequest, DeliveryTransport,
    HookDispatcher, HookSubscription, ReqwestTransport,
};
pub use pagination::{Cursor, PageParams};
pub use routes::build_router;
pub use state::AppState;
