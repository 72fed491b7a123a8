//! # hoist-backend: durable queue primitives
//!
//! A uniform, capability-aware storage contract over Redis-family stores,
//! plus an in-memory implementation for tests and local development.
//!
//! - [`StorageBackend`]: the async contract every backend satisfies
//! - [`BackendRegistry`] / [`BackendManager`]: factory lookup by backend-type
//!   name and per-queue backend assignment
//! - [`MemoryBackend`]: process-local backend with full priority/visibility
//!   semantics
//! - [`RedisListBackend`]: lists + deadline-scored reserved set, multi-key
//!   mutations as single Lua scripts
//! - [`RedisStreamBackend`]: streams + consumer groups, reclaim via pending
//!   entry idle time
//! - [`TenantDirectory`]: tenant records, quota counters and key sweeps
//! - [`MigrationManager`]: live drain of one backend into another with
//!   per-batch payload verification
//!
//! The backend is the serialization point for job state: all multi-step
//! operations (reserve, ack, nack, DLQ move) are atomic against it.

pub mod backend;
pub mod keys;
pub mod memory;
pub mod migration;
pub mod redis_lists;
pub mod redis_streams;
pub mod registry;
pub mod tenants;

pub use backend::{
    AckOutcome, BackendHealth, BackendStats, CountsSnapshot, JobIter, JobSource, MoveTarget,
    NackDisposition, QueueScope, ReserveRequest, StorageBackend,
};
pub use keys::KeySpace;
pub use memory::MemoryBackend;
pub use migration::{MigrationManager, MigrationPhase, MigrationPlan, MigrationReport};
pub use redis_lists::{RedisListBackend, RedisListFactory};
pub use redis_streams::{RedisStreamBackend, RedisStreamFactory};
pub use registry::{BackendFactory, BackendManager, BackendRegistry};
pub use tenants::{MemoryTenantStore, QuotaCheck, QuotaKind, RedisTenantStore, TenantStore};
