//! # hoist-core: shared types for the Hoist work queue
//!
//! Hoist turns a Redis instance into a reliable, multi-tenant priority work
//! queue. This crate carries the vocabulary the rest of the workspace speaks:
//!
//! - **Jobs and their lifecycle**: [`Job`], [`JobState`], [`ReservedJob`],
//!   fencing via [`ReservationToken`]
//! - **Tenancy**: [`TenantId`], [`TenantCtx`], [`TenantRecord`] with quota and
//!   rate-limit settings
//! - **Backend capability negotiation**: the [`Capabilities`] bit-set
//! - **The error taxonomy**: [`QueueError`] / [`QueueResult`]
//! - **Configuration**: [`HoistConfig`] and its per-subsystem sections
//! - **Chaos injection**: the [`ChaosInjector`] consulted at designated
//!   points by the broker, admission stack, outbox and webhook dispatcher
//!
//! All persisted state is owned by the storage backend; everything in this
//! crate is plain data that serializes cleanly with serde.

pub mod chaos;
pub mod config;
pub mod error;
pub mod types;

pub use chaos::{ChaosDecision, ChaosInjector, ChaosPoint, ChaosRule, ChaosScope};
pub use config::{
    BackendKind, BackendConfig, BackpressureConfig, ExactlyOnceConfig, HoistConfig, QueueDefaults,
    RateLimitConfig, RbacConfig, SloConfig, TenancyConfig, TracingConfig,
};
pub use error::{QueueError, QueueResult};
pub use types::{
    Capabilities, EnqueueOptions, Job, JobEvent, JobState, JobId, Lane, PendingCounts, Priority,
    QueueStats, QuotaPeriod, QuotaSettings, ReservationToken, ReservedJob, TenantCtx, TenantId,
    TenantRecord, TenantStatus, WorkerId, WorkerRecord, WorkerState,
};
