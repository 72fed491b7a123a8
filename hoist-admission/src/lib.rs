//! # hoist-admission: the admission-control stack
//!
//! Producers pass through this crate before the broker sees a job:
//!
//! - [`RateLimiter`]: atomic token buckets per (tenant | global, scope) with
//!   priority-weighted costs, a dry-run mode, and a weighted-fair allocator
//!   with a starvation guard ([`FairnessAllocator`])
//! - [`BackpressureController`]: green/yellow/red backlog zones producing
//!   throttle delays or shed decisions, a per-queue circuit breaker, and a
//!   jittered stats poller feeding a bounded decision cache

pub mod backpressure;
pub mod ratelimit;

pub use backpressure::{
    BackpressureController, BackpressureDecision, BackpressurePoller, BreakerState, CircuitBreaker,
    PollerHandle,
};
pub use ratelimit::{ConsumeOutcome, FairnessAllocator, RateLimiter, RedisRateLimiter, TokenBucket};
