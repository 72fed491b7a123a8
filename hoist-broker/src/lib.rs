//! # hoist-broker: the queue broker
//!
//! Enqueue/reserve/ack/nack semantics over a storage backend, with
//! at-least-once delivery, visibility timeouts, heartbeat extension,
//! exponential-backoff retries and the dead-letter queue.
//!
//! - [`Broker`]: the operation surface producers and workers call
//! - [`BackoffPolicy`]: per-queue retry backoff (exponential, jittered,
//!   capped)
//! - [`VisibilitySweeper`]: the periodic reclaim task that returns expired
//!   reservations to pending

pub mod backoff;
pub mod broker;
pub mod sweeper;

pub use backoff::BackoffPolicy;
pub use broker::{Broker, DequeueRequest};
pub use sweeper::{SweeperHandle, VisibilitySweeper};
