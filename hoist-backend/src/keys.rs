//! Persisted key layout.
//!
//! Every key begins with the tenant prefix, so tenant isolation holds by key
//! construction. With hash tags enabled the `tenant:queue` pair is wrapped
//! in braces so Redis Cluster places all co-accessed keys of a scope on the
//! same slot, which the Lua scripts require.
//!
//! Layout per scope:
//! - pending lists:   `t:{tenant}:q:{queue}:p:{priority}`
//! - job bodies:      `t:{tenant}:q:{queue}:jobs`         (hash id -> json)
//! - failure counts:  `t:{tenant}:q:{queue}:attempts`     (hash id -> u32)
//! - reserved set:    `t:{tenant}:q:{queue}:reserved`     (zset, score = deadline ms)
//! - leases:          `t:{tenant}:q:{queue}:leases`       (hash id -> {token, worker})
//! - per-worker list: `t:{tenant}:q:{queue}:proc:{worker}`
//! - delayed set:     `t:{tenant}:q:{queue}:delayed`      (zset "prio|id", score = due ms)
//! - dead letters:    `t:{tenant}:q:{queue}:dlq` + `:dlqmeta`
//! - cancelled ids:   `t:{tenant}:q:{queue}:cancelled`    (set)
//! - counters:        `t:{tenant}:q:{queue}:counters`     (hash)
//! - streams:         `t:{tenant}:q:{queue}:s:{priority}`
//!
//! Elsewhere:
//! - idempotency:     `t:{tenant}:idem:{queue}:{key}`
//! - outbox:          `t:{tenant}:outbox:{status}`
//! - rate limits:     `t:{tenant}:rl:{scope}`
//! - tenant config:   `tenant:{tenant}:config`

use hoist_core::Priority;

use crate::backend::QueueScope;

/// Key builder for one deployment. Construct once, share by reference.
#[derive(Debug, Clone)]
pub struct KeySpace {
    hash_tags: bool,
}

impl KeySpace {
    pub fn new(hash_tags: bool) -> Self {
        Self { hash_tags }
    }

    /// Common prefix for all keys of a scope
    pub fn scope_prefix(&self, scope: &QueueScope) -> String {
        if self.hash_tags {
            format!("t:{{{}:{}}}:q", scope.tenant, scope.queue)
        } else {
            format!("t:{}:q:{}", scope.tenant, scope.queue)
        }
    }

    pub fn pending(&self, scope: &QueueScope, priority: Priority) -> String {
        format!("{}:p:{}", self.scope_prefix(scope), priority)
    }

    /// Pending list keys in dequeue scan order (critical first)
    pub fn pending_descending(&self, scope: &QueueScope) -> Vec<String> {
        Priority::descending()
            .iter()
            .map(|p| self.pending(scope, *p))
            .collect()
    }

    pub fn jobs(&self, scope: &QueueScope) -> String {
        format!("{}:jobs", self.scope_prefix(scope))
    }

    pub fn attempts(&self, scope: &QueueScope) -> String {
        format!("{}:attempts", self.scope_prefix(scope))
    }

    /// Last failure message per job id
    pub fn errors(&self, scope: &QueueScope) -> String {
        format!("{}:errors", self.scope_prefix(scope))
    }

    pub fn reserved(&self, scope: &QueueScope) -> String {
        format!("{}:reserved", self.scope_prefix(scope))
    }

    pub fn leases(&self, scope: &QueueScope) -> String {
        format!("{}:leases", self.scope_prefix(scope))
    }

    pub fn processing(&self, scope: &QueueScope, worker: &str) -> String {
        format!("{}:proc:{}", self.scope_prefix(scope), worker)
    }

    pub fn delayed(&self, scope: &QueueScope) -> String {
        format!("{}:delayed", self.scope_prefix(scope))
    }

    pub fn dlq(&self, scope: &QueueScope) -> String {
        format!("{}:dlq", self.scope_prefix(scope))
    }

    pub fn dlq_meta(&self, scope: &QueueScope) -> String {
        format!("{}:dlqmeta", self.scope_prefix(scope))
    }

    pub fn cancelled(&self, scope: &QueueScope) -> String {
        format!("{}:cancelled", self.scope_prefix(scope))
    }

    pub fn counters(&self, scope: &QueueScope) -> String {
        format!("{}:counters", self.scope_prefix(scope))
    }

    pub fn stream(&self, scope: &QueueScope, priority: Priority) -> String {
        format!("{}:s:{}", self.scope_prefix(scope), priority)
    }

    pub fn streams_descending(&self, scope: &QueueScope) -> Vec<String> {
        Priority::descending()
            .iter()
            .map(|p| self.stream(scope, *p))
            .collect()
    }

    /// Stream-entry id mapping (job id -> stream entry id)
    pub fn stream_entries(&self, scope: &QueueScope) -> String {
        format!("{}:entries", self.scope_prefix(scope))
    }

    pub fn idempotency(&self, tenant: &str, queue: &str, key: &str) -> String {
        format!("t:{}:idem:{}:{}", tenant, queue, key)
    }

    pub fn outbox(&self, tenant: &str, status: &str) -> String {
        format!("t:{}:outbox:{}", tenant, status)
    }

    pub fn rate_limit(&self, tenant: &str, scope: &str) -> String {
        format!("t:{}:rl:{}", tenant, scope)
    }

    pub fn tenant_config(&self, tenant: &str) -> String {
        format!("tenant:{}:config", tenant)
    }

    pub fn quota_counter(&self, tenant: &str, kind: &str, bucket: &str) -> String {
        format!("t:{}:quota:{}:{}", tenant, kind, bucket)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Encode a delayed-set member so promotion knows the target priority list
/// without a body fetch.
pub fn delayed_member(priority: Priority, job_id: &str) -> String {
    format!("{}|{}", priority.as_u8(), job_id)
}

/// Decode a delayed-set member produced by [`delayed_member`]
pub fn parse_delayed_member(member: &str) -> Option<(Priority, &str)> {
    let (prio, id) = member.split_once('|')?;
    let priority = Priority::from_u8(prio.parse().ok()?)?;
    Some((priority, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoist_core::TenantId;

    fn scope() -> QueueScope {
        QueueScope::new(TenantId::new("acme").unwrap(), "default")
    }

    #[test]
    fn plain_layout_matches_contract() {
        let ks = KeySpace::new(false);
        let s = scope();
        assert_eq!(ks.pending(&s, Priority::Critical), "t:acme:q:default:p:critical");
        assert_eq!(ks.reserved(&s), "t:acme:q:default:reserved");
        assert_eq!(ks.processing(&s, "w1"), "t:acme:q:default:proc:w1");
        assert_eq!(ks.dlq(&s), "t:acme:q:default:dlq");
        assert_eq!(ks.idempotency("acme", "default", "k"), "t:acme:idem:default:k");
        assert_eq!(ks.outbox("acme", "pending"), "t:acme:outbox:pending");
        assert_eq!(ks.rate_limit("acme", "enqueue"), "t:acme:rl:enqueue");
        assert_eq!(ks.tenant_config("acme"), "tenant:acme:config");
    }

    #[test]
    fn tagged_layout_shares_one_hash_slot_token() {
        let ks = KeySpace::new(true);
        let s = scope();
        for key in [
            ks.pending(&s, Priority::Low),
            ks.reserved(&s),
            ks.dlq(&s),
            ks.jobs(&s),
        ] {
            assert!(key.contains("{acme:default}"), "key {} missing tag", key);
        }
    }

    #[test]
    fn delayed_member_round_trip() {
        let m = delayed_member(Priority::High, "job-1");
        let (p, id) = parse_delayed_member(&m).unwrap();
        assert_eq!(p, Priority::High);
        assert_eq!(id, "job-1");
        assert!(parse_delayed_member("garbage").is_none());
    }

    #[test]
    fn tenant_prefix_isolation() {
        let ks = KeySpace::new(false);
        let a = QueueScope::new(TenantId::new("acme").unwrap(), "q");
        let b = QueueScope::new(TenantId::new("beta").unwrap(), "q");
        assert!(ks.scope_prefix(&a).starts_with("t:acme:"));
        assert!(ks.scope_prefix(&b).starts_with("t:beta:"));
        assert_ne!(ks.jobs(&a), ks.jobs(&b));
    }
}
