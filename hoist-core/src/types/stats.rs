use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Priority;

/// Pending backlog split by priority class
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PendingCounts {
    pub critical: u64,
    pub high: u64,
    pub normal: u64,
    pub low: u64,
}

impl PendingCounts {
    pub fn total(&self) -> u64 {
        self.critical + self.high + self.normal + self.low
    }

    pub fn get(&self, priority: Priority) -> u64 {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }

    pub fn set(&mut self, priority: Priority, count: u64) {
        match priority {
            Priority::Critical => self.critical = count,
            Priority::High => self.high = count,
            Priority::Normal => self.normal = count,
            Priority::Low => self.low = count,
        }
    }
}

/// Point-in-time counts for one queue, assembled by the broker and consumed
/// by the backpressure poller, anomaly radar and admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub tenant_id: String,
    pub queue: String,

    /// Pending jobs per priority class
    pub pending: PendingCounts,

    /// Jobs currently reserved by workers
    pub reserved: u64,

    /// Dead-letter queue length
    pub dead_lettered: u64,

    /// Enqueues observed since the previous snapshot
    pub enqueue_rate: f64,

    /// Acks observed since the previous snapshot
    pub ack_rate: f64,

    pub taken_at: DateTime<Utc>,
}

impl QueueStats {
    pub fn empty(tenant_id: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            queue: queue.into(),
            pending: PendingCounts::default(),
            reserved: 0,
            dead_lettered: 0,
            enqueue_rate: 0.0,
            ack_rate: 0.0,
            taken_at: Utc::now(),
        }
    }

    /// Total pending backlog across priority classes
    pub fn backlog(&self) -> u64 {
        self.pending.total()
    }

    /// Pending backlog for one priority class
    pub fn backlog_for(&self, priority: Priority) -> u64 {
        self.pending.get(priority)
    }
}
