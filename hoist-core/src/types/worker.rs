use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, WorkerId};

/// Deployment lane a worker serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Stable,
    Canary,
}

impl Lane {
    pub fn name(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Canary => "canary",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Worker lifecycle state as tracked by the fleet controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Dequeuing and processing
    Running,
    /// Not dequeuing; reservations retained
    Paused,
    /// Finishing current job, then stopping
    Draining,
    /// Stopped cleanly
    Stopped,
    /// Missed heartbeats beyond the grace multiple
    Offline,
}

impl WorkerState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Offline => "offline",
        }
    }

    /// Counts toward the minimum-healthy fleet floor
    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

/// Registered worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub version: String,
    pub lane: Lane,
    pub queues: Vec<String>,
    pub state: WorkerState,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_job: Option<JobId>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(id: WorkerId, version: impl Into<String>, lane: Lane, queues: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            version: version.into(),
            lane,
            queues,
            state: WorkerState::Running,
            last_heartbeat: now,
            current_job: None,
            registered_at: now,
        }
    }

    /// A worker missing heartbeats beyond 3x the interval is offline and its
    /// reservations become eligible for reclaim.
    pub fn heartbeat_expired(&self, now: DateTime<Utc>, interval: std::time::Duration) -> bool {
        let cutoff = chrono::Duration::from_std(interval * 3).unwrap_or(chrono::Duration::zero());
        now - self.last_heartbeat > cutoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn heartbeat_cutoff_is_three_intervals() {
        let mut w = WorkerRecord::new(WorkerId::from("w1"), "1.0.0", Lane::Stable, vec![]);
        let now = Utc::now();
        w.last_heartbeat = now - chrono::Duration::seconds(44);
        assert!(!w.heartbeat_expired(now, Duration::from_secs(15)));
        w.last_heartbeat = now - chrono::Duration::seconds(46);
        assert!(w.heartbeat_expired(now, Duration::from_secs(15)));
    }

    #[test]
    fn healthy_states() {
        assert!(WorkerState::Running.is_healthy());
        assert!(WorkerState::Paused.is_healthy());
        assert!(!WorkerState::Draining.is_healthy());
        assert!(!WorkerState::Offline.is_healthy());
    }
}
