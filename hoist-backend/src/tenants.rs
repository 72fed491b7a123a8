//! Tenant directory and quota counters.
//!
//! Tenant records live at `tenant:{id}:config`; quota counters at
//! `t:{tenant}:quota:{kind}:{bucket}` with a TTL slightly past the period,
//! so counters clean themselves up. Soft-limit crossings move the tenant to
//! warning status; hard limits reject with a retry-after that reaches the
//! next period boundary.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use hoist_core::{
    QueueError, QueueResult, QuotaPeriod, TenantId, TenantRecord, TenantStatus,
};

use crate::keys::KeySpace;

/// What a quota counter measures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Jobs,
    Bytes,
}

impl QuotaKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Jobs => "jobs",
            Self::Bytes => "bytes",
        }
    }
}

/// Outcome of a quota check
#[derive(Debug, Clone)]
pub enum QuotaCheck {
    Allowed,
    /// Soft threshold crossed; allowed, tenant moved to warning
    Warning { used: u64, limit: u64 },
    /// Hard limit; rejected
    Denied {
        kind: QuotaKind,
        period: QuotaPeriod,
        used: u64,
        limit: u64,
        retry_after: Duration,
    },
}

impl QuotaCheck {
    pub fn allowed(&self) -> bool {
        !matches!(self, Self::Denied { .. })
    }
}

/// Tenant records plus quota accounting
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn create(&self, record: TenantRecord) -> QueueResult<()>;

    async fn get(&self, id: &TenantId) -> QueueResult<TenantRecord>;

    async fn update(&self, record: TenantRecord) -> QueueResult<()>;

    async fn list(&self) -> QueueResult<Vec<TenantRecord>>;

    /// Mark deleted and schedule namespaced key sweeps
    async fn delete(&self, id: &TenantId) -> QueueResult<()>;

    /// Check headroom without consuming it
    async fn check_quota(
        &self,
        id: &TenantId,
        kind: QuotaKind,
        period: QuotaPeriod,
        amount: u64,
    ) -> QueueResult<QuotaCheck>;

    /// Advance the counter; callers do this after the guarded operation
    /// succeeds
    async fn increment_usage(
        &self,
        id: &TenantId,
        kind: QuotaKind,
        period: QuotaPeriod,
        amount: u64,
    ) -> QueueResult<u64>;

    /// Current usage for reporting
    async fn usage(
        &self,
        id: &TenantId,
        kind: QuotaKind,
        period: QuotaPeriod,
    ) -> QueueResult<u64>;
}

fn quota_limit(record: &TenantRecord, kind: QuotaKind, period: QuotaPeriod) -> u64 {
    match (kind, period) {
        (QuotaKind::Jobs, QuotaPeriod::Hour) => record.quotas.jobs_per_hour,
        (QuotaKind::Jobs, QuotaPeriod::Day) => record.quotas.jobs_per_day,
        (QuotaKind::Bytes, QuotaPeriod::Hour) => record.quotas.bytes_per_hour,
        (QuotaKind::Bytes, QuotaPeriod::Day) => record.quotas.bytes_per_day,
    }
}

fn evaluate(
    record: &TenantRecord,
    kind: QuotaKind,
    period: QuotaPeriod,
    used: u64,
    amount: u64,
) -> QuotaCheck {
    let limit = quota_limit(record, kind, period);
    let projected = used.saturating_add(amount);
    if projected > limit {
        let retry_after = Duration::from_secs(period.seconds_remaining(Utc::now()));
        return QuotaCheck::Denied {
            kind,
            period,
            used,
            limit,
            retry_after,
        };
    }
    let soft = (limit as f64 * record.quotas.soft_limit_threshold) as u64;
    if projected >= soft {
        QuotaCheck::Warning {
            used: projected,
            limit,
        }
    } else {
        QuotaCheck::Allowed
    }
}

/// In-memory tenant store for tests and local development
pub struct MemoryTenantStore {
    records: RwLock<HashMap<TenantId, TenantRecord>>,
    usage: RwLock<HashMap<(TenantId, &'static str, String), u64>>,
}

impl MemoryTenantStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            usage: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryTenantStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TenantStore for MemoryTenantStore {
    async fn create(&self, record: TenantRecord) -> QueueResult<()> {
        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            return Err(QueueError::Conflict(format!(
                "tenant {} already exists",
                record.id
            )));
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &TenantId) -> QueueResult<TenantRecord> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::TenantNotFound(id.to_string()))
    }

    async fn update(&self, record: TenantRecord) -> QueueResult<()> {
        let mut records = self.records.write();
        if !records.contains_key(&record.id) {
            return Err(QueueError::TenantNotFound(record.id.to_string()));
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn list(&self) -> QueueResult<Vec<TenantRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn delete(&self, id: &TenantId) -> QueueResult<()> {
        let mut records = self.records.write();
        let record = records
            .get_mut(id)
            .ok_or_else(|| QueueError::TenantNotFound(id.to_string()))?;
        record.status = TenantStatus::Deleted;
        record.updated_at = Utc::now();
        info!(tenant = %id, "tenant marked deleted, key sweep scheduled");
        Ok(())
    }

    async fn check_quota(
        &self,
        id: &TenantId,
        kind: QuotaKind,
        period: QuotaPeriod,
        amount: u64,
    ) -> QueueResult<QuotaCheck> {
        let record = self.get(id).await?;
        let used = self.usage(id, kind, period).await?;
        let check = evaluate(&record, kind, period, used, amount);
        if matches!(check, QuotaCheck::Warning { .. })
            && record.status == TenantStatus::Active
        {
            let mut warned = record;
            warned.status = TenantStatus::Warning;
            warned.updated_at = Utc::now();
            self.update(warned).await?;
        }
        Ok(check)
    }

    async fn increment_usage(
        &self,
        id: &TenantId,
        kind: QuotaKind,
        period: QuotaPeriod,
        amount: u64,
    ) -> QueueResult<u64> {
        let bucket = period.bucket(Utc::now());
        let mut usage = self.usage.write();
        let counter = usage
            .entry((id.clone(), kind.name(), format!("{}:{}", period.name(), bucket)))
            .or_insert(0);
        *counter += amount;
        Ok(*counter)
    }

    async fn usage(
        &self,
        id: &TenantId,
        kind: QuotaKind,
        period: QuotaPeriod,
    ) -> QueueResult<u64> {
        let bucket = period.bucket(Utc::now());
        Ok(self
            .usage
            .read()
            .get(&(id.clone(), kind.name(), format!("{}:{}", period.name(), bucket)))
            .copied()
            .unwrap_or(0))
    }
}

/// Redis-backed tenant store
pub struct RedisTenantStore {
    conn: ConnectionManager,
    keys: KeySpace,
}

impl RedisTenantStore {
    pub fn new(conn: ConnectionManager, keys: KeySpace) -> Self {
        Self { conn, keys }
    }

    fn counter_key(&self, id: &TenantId, kind: QuotaKind, period: QuotaPeriod) -> String {
        let bucket = format!("{}:{}", period.name(), period.bucket(Utc::now()));
        self.keys.quota_counter(id.as_str(), kind.name(), &bucket)
    }

    fn err(e: redis::RedisError) -> QueueError {
        QueueError::BackendUnavailable(e.to_string())
    }
}

#[async_trait]
impl TenantStore for RedisTenantStore {
    async fn create(&self, record: TenantRecord) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let key = self.keys.tenant_config(record.id.as_str());
        let body = serde_json::to_string(&record)?;
        let created: bool = conn.set_nx(&key, body).await.map_err(Self::err)?;
        if !created {
            return Err(QueueError::Conflict(format!(
                "tenant {} already exists",
                record.id
            )));
        }
        Ok(())
    }

    async fn get(&self, id: &TenantId) -> QueueResult<TenantRecord> {
        let mut conn = self.conn.clone();
        let body: Option<String> = conn
            .get(self.keys.tenant_config(id.as_str()))
            .await
            .map_err(Self::err)?;
        let body = body.ok_or_else(|| QueueError::TenantNotFound(id.to_string()))?;
        serde_json::from_str(&body)
            .map_err(|e| QueueError::BackendCorrupt(format!("tenant record: {}", e)))
    }

    async fn update(&self, record: TenantRecord) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let key = self.keys.tenant_config(record.id.as_str());
        let exists: bool = conn.exists(&key).await.map_err(Self::err)?;
        if !exists {
            return Err(QueueError::TenantNotFound(record.id.to_string()));
        }
        let body = serde_json::to_string(&record)?;
        let _: () = conn.set(&key, body).await.map_err(Self::err)?;
        Ok(())
    }

    async fn list(&self) -> QueueResult<Vec<TenantRecord>> {
        let mut conn = self.conn.clone();
        let mut records = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("tenant:*:config")
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(Self::err)?;
            for key in keys {
                let body: Option<String> = conn.get(&key).await.map_err(Self::err)?;
                if let Some(body) = body {
                    if let Ok(record) = serde_json::from_str::<TenantRecord>(&body) {
                        records.push(record);
                    }
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(records)
    }

    async fn delete(&self, id: &TenantId) -> QueueResult<()> {
        let mut record = self.get(id).await?;
        record.status = TenantStatus::Deleted;
        record.updated_at = Utc::now();
        self.update(record).await?;
        info!(tenant = %id, "tenant marked deleted, key sweep scheduled");
        Ok(())
    }

    async fn check_quota(
        &self,
        id: &TenantId,
        kind: QuotaKind,
        period: QuotaPeriod,
        amount: u64,
    ) -> QueueResult<QuotaCheck> {
        let record = self.get(id).await?;
        let used = self.usage(id, kind, period).await?;
        let check = evaluate(&record, kind, period, used, amount);
        if matches!(check, QuotaCheck::Warning { .. })
            && record.status == TenantStatus::Active
        {
            warn!(tenant = %id, "soft quota threshold crossed");
            let mut warned = record;
            warned.status = TenantStatus::Warning;
            warned.updated_at = Utc::now();
            self.update(warned).await?;
        }
        Ok(check)
    }

    async fn increment_usage(
        &self,
        id: &TenantId,
        kind: QuotaKind,
        period: QuotaPeriod,
        amount: u64,
    ) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let key = self.counter_key(id, kind, period);
        let total: u64 = conn.incr(&key, amount).await.map_err(Self::err)?;
        // Counters expire one period past their window
        let ttl = match period {
            QuotaPeriod::Hour => 2 * 3600,
            QuotaPeriod::Day => 2 * 86_400,
        };
        let _: bool = conn.expire(&key, ttl).await.map_err(Self::err)?;
        Ok(total)
    }

    async fn usage(
        &self,
        id: &TenantId,
        kind: QuotaKind,
        period: QuotaPeriod,
    ) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let used: Option<u64> = conn
            .get(self.counter_key(id, kind, period))
            .await
            .map_err(Self::err)?;
        Ok(used.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(id: &str) -> TenantRecord {
        TenantRecord::new(TenantId::new(id).unwrap())
    }

    #[tokio::test]
    async fn create_get_update_delete() {
        let store = MemoryTenantStore::new();
        store.create(tenant("acme")).await.unwrap();

        assert!(matches!(
            store.create(tenant("acme")).await,
            Err(QueueError::Conflict(_))
        ));

        let id = TenantId::new("acme").unwrap();
        let mut record = store.get(&id).await.unwrap();
        assert_eq!(record.status, TenantStatus::Active);

        record.rate_limit_rps = 50.0;
        store.update(record).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap().rate_limit_rps, 50.0);

        store.delete(&id).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap().status, TenantStatus::Deleted);
    }

    #[tokio::test]
    async fn quota_denies_past_hard_limit() {
        let store = MemoryTenantStore::new();
        let mut record = tenant("acme");
        record.quotas.jobs_per_hour = 10;
        store.create(record).await.unwrap();

        let id = TenantId::new("acme").unwrap();
        store
            .increment_usage(&id, QuotaKind::Jobs, QuotaPeriod::Hour, 10)
            .await
            .unwrap();

        let check = store
            .check_quota(&id, QuotaKind::Jobs, QuotaPeriod::Hour, 1)
            .await
            .unwrap();
        match check {
            QuotaCheck::Denied {
                used,
                limit,
                retry_after,
                ..
            } => {
                assert_eq!(used, 10);
                assert_eq!(limit, 10);
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn soft_threshold_moves_tenant_to_warning() {
        let store = MemoryTenantStore::new();
        let mut record = tenant("acme");
        record.quotas.jobs_per_hour = 10;
        record.quotas.soft_limit_threshold = 0.8;
        store.create(record).await.unwrap();

        let id = TenantId::new("acme").unwrap();
        store
            .increment_usage(&id, QuotaKind::Jobs, QuotaPeriod::Hour, 8)
            .await
            .unwrap();

        let check = store
            .check_quota(&id, QuotaKind::Jobs, QuotaPeriod::Hour, 1)
            .await
            .unwrap();
        assert!(check.allowed());
        assert!(matches!(check, QuotaCheck::Warning { .. }));
        assert_eq!(store.get(&id).await.unwrap().status, TenantStatus::Warning);
    }
}
