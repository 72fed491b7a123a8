//! # hoist-exactly-once: the exactly-once execution envelope
//!
//! Two cooperating pieces turn at-least-once delivery into exactly-once
//! effects:
//!
//! - [`IdempotencyManager`]: CAS-guarded execution keyed by
//!   (tenant, queue, key) with a content fingerprint. Repeated calls with
//!   the same key and fingerprint observe the stored result; a conflicting
//!   fingerprint is an error. Records carry a mandatory TTL and a GC sweep
//!   collects expired entries.
//! - [`OutboxPublisher`]: durable event log written alongside business
//!   state, drained in batches with exponential backoff and jitter;
//!   exhausted events land in a dead-letter store for manual replay.
//!   Consumers dedupe on event id for exactly-once effect.

pub mod idempotency;
pub mod outbox;

pub use idempotency::{
    BeginOutcome, IdempotencyManager, IdempotencyRecord, IdempotencyStatus, IdempotencyStore,
    IdempotencyScope, MemoryIdempotencyStore, RedisIdempotencyStore,
};
pub use outbox::{
    EventPublisher, MemoryOutboxStore, OutboxEvent, OutboxPublisher, OutboxStatus, OutboxStore,
    PublisherHandle, RedisOutboxStore,
};
