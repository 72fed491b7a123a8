use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{QueueError, QueueResult};

/// Validated tenant identifier: 3-32 chars, lowercase alphanumerics and
/// hyphens, no leading or trailing hyphen. Every persisted key carries this
/// id in its `t:{tenant}:` prefix, so isolation holds by key construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> QueueResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    fn validate(id: &str) -> QueueResult<()> {
        if id.len() < 3 || id.len() > 32 {
            return Err(QueueError::Validation(format!(
                "tenant id must be 3-32 characters, got {}",
                id.len()
            )));
        }
        if !id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(QueueError::Validation(format!(
                "tenant id '{}' may only contain lowercase alphanumerics and hyphens",
                id
            )));
        }
        if id.starts_with('-') || id.ends_with('-') {
            return Err(QueueError::Validation(format!(
                "tenant id '{}' must not start or end with a hyphen",
                id
            )));
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TenantId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Tenant lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    /// Soft quota threshold crossed; operations still succeed
    Warning,
    /// All producer operations rejected
    Suspended,
    /// Marked for namespaced key sweeps
    Deleted,
}

impl TenantStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Warning => "warning",
            Self::Suspended => "suspended",
            Self::Deleted => "deleted",
        }
    }

    /// Whether enqueues from this tenant are admitted
    pub fn admits_work(self) -> bool {
        matches!(self, Self::Active | Self::Warning)
    }
}

/// Quota accounting period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPeriod {
    Hour,
    Day,
}

impl QuotaPeriod {
    pub fn name(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Seconds until the current period window rolls over, from `now`
    pub fn seconds_remaining(self, now: chrono::DateTime<chrono::Utc>) -> u64 {
        use chrono::Timelike;
        match self {
            Self::Hour => 3600 - (now.minute() * 60 + now.second()) as u64,
            Self::Day => 86400 - (now.hour() * 3600 + now.minute() * 60 + now.second()) as u64,
        }
    }

    /// Bucket label for the window containing `now`, used in counter keys
    pub fn bucket(self, now: chrono::DateTime<chrono::Utc>) -> String {
        match self {
            Self::Hour => now.format("%Y%m%d%H").to_string(),
            Self::Day => now.format("%Y%m%d").to_string(),
        }
    }
}

/// Per-period caps applied to a tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSettings {
    /// Jobs accepted per hour
    pub jobs_per_hour: u64,
    /// Jobs accepted per day
    pub jobs_per_day: u64,
    /// Payload bytes accepted per hour
    pub bytes_per_hour: u64,
    /// Payload bytes accepted per day
    pub bytes_per_day: u64,
    /// Fraction of a cap at which the tenant moves to warning status
    pub soft_limit_threshold: f64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            jobs_per_hour: 100_000,
            jobs_per_day: 1_000_000,
            bytes_per_hour: 1 << 30,
            bytes_per_day: 10 << 30,
            soft_limit_threshold: 0.8,
        }
    }
}

/// Registered tenant: isolation unit for all persisted state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: TenantId,
    pub status: TenantStatus,
    pub quotas: QuotaSettings,
    /// Requests per second admitted for this tenant
    pub rate_limit_rps: f64,
    /// Burst capacity above the sustained rate
    pub rate_limit_burst: u64,
    /// Payload encryption default; no key-management contract yet
    pub encryption_enabled: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl TenantRecord {
    pub fn new(id: TenantId) -> Self {
        let now = chrono::Utc::now();
        Self {
            id,
            status: TenantStatus::Active,
            quotas: QuotaSettings::default(),
            rate_limit_rps: 100.0,
            rate_limit_burst: 200,
            encryption_enabled: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Context carried with every tenant-scoped operation, so all logic is
/// explicitly tenant-aware and correlatable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantCtx {
    pub tenant_id: TenantId,

    /// Distributed tracing correlation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// Request correlation for API-originated operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Additional observability tags
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

impl TenantCtx {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            trace_id: None,
            request_id: None,
            tags: HashMap::new(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_tenant_ids() {
        for id in ["acme", "a-1", "abc-def-123", "a23"] {
            assert!(TenantId::new(id).is_ok(), "expected '{}' valid", id);
        }
    }

    #[test]
    fn invalid_tenant_ids() {
        for id in ["ab", "-abc", "abc-", "ABC", "a_b_c", "a.b.c", &"x".repeat(33)] {
            assert!(TenantId::new(id).is_err(), "expected '{}' invalid", id);
        }
    }

    #[test]
    fn suspended_tenants_do_not_admit_work() {
        assert!(TenantStatus::Active.admits_work());
        assert!(TenantStatus::Warning.admits_work());
        assert!(!TenantStatus::Suspended.admits_work());
        assert!(!TenantStatus::Deleted.admits_work());
    }

    #[test]
    fn quota_bucket_labels() {
        let t = chrono::DateTime::parse_from_rfc3339("2024-06-15T13:45:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(QuotaPeriod::Hour.bucket(t), "2024061513");
        assert_eq!(QuotaPeriod::Day.bucket(t), "20240615");
    }
}
