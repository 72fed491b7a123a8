use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, Priority, WorkerId};

/// Minimal stable event protocol for structured observability.
///
/// Broadcast in-process on a bounded channel; event hooks and stats
/// consumers subscribe. Laggards drop the oldest events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// Job accepted by the broker
    Enqueued {
        job_id: JobId,
        tenant_id: String,
        queue: String,
        priority: Priority,
        at: DateTime<Utc>,
    },

    /// Job reserved by a worker
    Reserved {
        job_id: JobId,
        tenant_id: String,
        queue: String,
        worker_id: WorkerId,
        deadline: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// Job acknowledged complete
    Acked {
        job_id: JobId,
        tenant_id: String,
        queue: String,
        at: DateTime<Utc>,
    },

    /// Job nacked and scheduled for retry
    Retried {
        job_id: JobId,
        tenant_id: String,
        queue: String,
        retry_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },

    /// Job moved to the dead-letter queue
    DeadLettered {
        job_id: JobId,
        tenant_id: String,
        queue: String,
        reason: String,
        at: DateTime<Utc>,
    },

    /// Job cancelled
    Cancelled {
        job_id: JobId,
        tenant_id: String,
        queue: String,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "job.enqueued",
            Self::Reserved { .. } => "job.reserved",
            Self::Acked { .. } => "job.acked",
            Self::Retried { .. } => "job.retried",
            Self::DeadLettered { .. } => "job.dead_lettered",
            Self::Cancelled { .. } => "job.cancelled",
        }
    }

    /// Get the job ID from any event
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Enqueued { job_id, .. }
            | Self::Reserved { job_id, .. }
            | Self::Acked { job_id, .. }
            | Self::Retried { job_id, .. }
            | Self::DeadLettered { job_id, .. }
            | Self::Cancelled { job_id, .. } => job_id,
        }
    }

    /// Get the queue name from any event
    pub fn queue(&self) -> &str {
        match self {
            Self::Enqueued { queue, .. }
            | Self::Reserved { queue, .. }
            | Self::Acked { queue, .. }
            | Self::Retried { queue, .. }
            | Self::DeadLettered { queue, .. }
            | Self::Cancelled { queue, .. } => queue,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Enqueued { at, .. }
            | Self::Reserved { at, .. }
            | Self::Acked { at, .. }
            | Self::Retried { at, .. }
            | Self::DeadLettered { at, .. }
            | Self::Cancelled { at, .. } => at,
        }
    }
}
