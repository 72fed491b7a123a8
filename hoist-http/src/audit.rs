use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One admin-plane audit record. Written for every destructive operation
/// regardless of outcome, including the failure class when it failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminAuditEntry {
    pub request_id: String,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub reason: String,
    pub outcome: String,
    pub at: DateTime<Utc>,
}

/// Bounded in-memory audit ring
pub struct AdminAudit {
    entries: RwLock<VecDeque<AdminAuditEntry>>,
    cap: usize,
}

impl AdminAudit {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            cap: cap.max(1),
        }
    }

    pub fn record(
        &self,
        request_id: &str,
        actor: &str,
        action: &str,
        resource: &str,
        reason: &str,
        outcome: &str,
    ) {
        let mut entries = self.entries.write();
        if entries.len() >= self.cap {
            entries.pop_front();
        }
        entries.push_back(AdminAuditEntry {
            request_id: request_id.to_string(),
            actor: actor.to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
            reason: reason.to_string(),
            outcome: outcome.to_string(),
            at: Utc::now(),
        });
    }

    /// Most recent first
    pub fn recent(&self, limit: usize) -> Vec<AdminAuditEntry> {
        self.entries.read().iter().rev().take(limit).cloned().collect()
    }
}

impl Default for AdminAudit {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest() {
        let audit = AdminAudit::new(2);
        audit.record("r1", "a", "delete", "q1", "cleanup", "ok");
        audit.record("r2", "a", "delete", "q2", "cleanup", "ok");
        audit.record("r3", "a", "delete", "q3", "cleanup", "denied");

        let recent = audit.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].request_id, "r3");
        assert_eq!(recent[1].request_id, "r2");
    }
}
