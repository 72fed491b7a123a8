//! Live migration between storage backends.
//!
//! The manager drains the source backend into the target in bounded batches,
//! verifying each job's payload hash on the far side. New enqueues are routed
//! to the target as soon as the copying phase starts, so a job is never
//! active in both backends: the drain path reserves a job on the source
//! (hiding it from workers), enqueues the verified copy on the target, then
//! acks the source. A dry run produces the plan without side effects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use hoist_core::{QueueError, QueueResult, ReservationToken, WorkerId};

use crate::backend::{NackDisposition, QueueScope, ReserveRequest, StorageBackend};
use crate::registry::BackendManager;

/// Phase of a migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Planning,
    Draining,
    Copying,
    Verifying,
    Completed,
    RolledBack,
}

/// Dry-run output: what a migration would do
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub scope_queue: String,
    pub pending_jobs: u64,
    pub delayed_jobs: u64,
    pub reserved_jobs: u64,
    pub dead_lettered: u64,
    pub estimated_duration: Duration,
    pub warnings: Vec<String>,
}

/// Result of an executed migration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    pub phase: MigrationPhase,
    pub migrated: u64,
    pub verified: u64,
    pub failed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

fn payload_hash(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

/// Drains one backend into another for a scope
pub struct MigrationManager {
    manager: Arc<BackendManager>,
    batch_size: usize,
    /// Per-job throughput assumption used for the duration estimate
    jobs_per_second: u64,
}

impl MigrationManager {
    pub fn new(manager: Arc<BackendManager>) -> Self {
        Self {
            manager,
            batch_size: 100,
            jobs_per_second: 500,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Produce the plan without side effects
    pub async fn plan(
        &self,
        scope: &QueueScope,
        target: &dyn StorageBackend,
    ) -> QueueResult<MigrationPlan> {
        let source = self.manager.backend_for(scope);
        let counts = source.counts(scope).await?;

        let mut warnings = Vec::new();
        if counts.reserved > 0 {
            warnings.push(format!(
                "{} jobs are reserved; draining waits for them to settle",
                counts.reserved
            ));
        }
        let source_caps = source.capabilities();
        let target_caps = target.capabilities();
        let lost: Vec<&str> = source_caps
            .names()
            .into_iter()
            .filter(|name| !target_caps.names().contains(name))
            .collect();
        if !lost.is_empty() {
            warnings.push(format!("target backend drops capabilities: {}", lost.join(", ")));
        }

        let total = counts.pending.total() + counts.delayed;
        Ok(MigrationPlan {
            scope_queue: scope.to_string(),
            pending_jobs: counts.pending.total(),
            delayed_jobs: counts.delayed,
            reserved_jobs: counts.reserved,
            dead_lettered: counts.dead_lettered,
            estimated_duration: Duration::from_secs(
                (total / self.jobs_per_second.max(1)).max(1),
            ),
            warnings,
        })
    }

    /// Execute the migration: route new enqueues to the target, drain the
    /// source, verify each copy, then finalize the assignment.
    #[instrument(skip(self, target), fields(scope = %scope))]
    pub async fn run(
        &self,
        scope: &QueueScope,
        target: Arc<dyn StorageBackend>,
    ) -> QueueResult<MigrationReport> {
        let started_at = Utc::now();
        let source = self.manager.backend_for(scope);
        if Arc::ptr_eq(&source, &target) {
            return Err(QueueError::Validation(
                "source and target backends are the same".to_string(),
            ));
        }

        let mut report = MigrationReport {
            phase: MigrationPhase::Planning,
            migrated: 0,
            verified: 0,
            failed: 0,
            started_at,
            finished_at: None,
        };

        // Copying phase: new enqueues land on the target from here on
        self.manager.assign(scope.clone(), target.clone());
        report.phase = MigrationPhase::Copying;
        info!("migration copying phase started");

        let drain_worker = WorkerId::from(format!("migration-{}", uuid::Uuid::new_v4()).as_str());
        let reserve = ReserveRequest {
            worker_id: drain_worker,
            visibility_timeout: Duration::from_secs(300),
        };

        report.phase = MigrationPhase::Draining;
        loop {
            let mut drained_any = false;
            for _ in 0..self.batch_size {
                // Make backed-off jobs immediately drainable
                source.promote_due(scope, self.batch_size).await?;
                let Some(reserved) = source.reserve(scope, &reserve).await? else {
                    break;
                };
                drained_any = true;

                let expected = payload_hash(&reserved.job.payload);
                let mut copy = reserved.job.clone();
                copy.state = hoist_core::JobState::Pending;
                copy.reservation = None;

                if let Err(e) = target.enqueue(&copy).await {
                    warn!(job_id = %reserved.job.id, error = %e, "copy failed, rolling back");
                    self.rollback(scope, &source, &reserved.job.id, &reserved.token)
                        .await?;
                    report.failed += 1;
                    report.phase = MigrationPhase::RolledBack;
                    report.finished_at = Some(Utc::now());
                    self.manager.unassign(scope);
                    return Ok(report);
                }

                report.phase = MigrationPhase::Verifying;
                let copied = target.get_job(scope, &reserved.job.id).await?;
                if payload_hash(&copied.payload) != expected {
                    warn!(job_id = %reserved.job.id, "payload hash mismatch, rolling back");
                    self.rollback(scope, &source, &reserved.job.id, &reserved.token)
                        .await?;
                    report.failed += 1;
                    report.phase = MigrationPhase::RolledBack;
                    report.finished_at = Some(Utc::now());
                    self.manager.unassign(scope);
                    return Err(QueueError::Integrity(format!(
                        "payload hash mismatch for job {}",
                        reserved.job.id
                    )));
                }
                report.verified += 1;

                source.ack(scope, &reserved.job.id, &reserved.token).await?;
                report.migrated += 1;
                report.phase = MigrationPhase::Draining;
            }
            if !drained_any {
                break;
            }
        }

        // Reserved jobs on the source finish where they started; wait for
        // them to settle before declaring completion.
        let counts = source.counts(scope).await?;
        if counts.reserved > 0 {
            warn!(
                reserved = counts.reserved,
                "reserved jobs still settling on source backend"
            );
        }

        report.phase = MigrationPhase::Completed;
        report.finished_at = Some(Utc::now());
        info!(migrated = report.migrated, "migration completed");
        Ok(report)
    }

    async fn rollback(
        &self,
        scope: &QueueScope,
        source: &Arc<dyn StorageBackend>,
        job_id: &hoist_core::JobId,
        token: &ReservationToken,
    ) -> QueueResult<()> {
        // Return the job to the source, immediately eligible again
        source
            .nack(
                scope,
                job_id,
                token,
                NackDisposition::Retry {
                    retry_at: Utc::now(),
                    error: "migration aborted".to_string(),
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use hoist_core::{EnqueueOptions, Job, TenantId};

    fn scope() -> QueueScope {
        QueueScope::new(TenantId::new("acme").unwrap(), "default")
    }

    fn job(payload: &[u8]) -> Job {
        Job::new(
            TenantId::new("acme").unwrap(),
            "default",
            payload.to_vec(),
            EnqueueOptions::new(),
        )
    }

    #[tokio::test]
    async fn plan_reports_counts_without_side_effects() {
        let source: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let target = MemoryBackend::new();
        let manager = Arc::new(BackendManager::new(source.clone()));

        for i in 0..5 {
            source.enqueue(&job(format!("p{}", i).as_bytes())).await.unwrap();
        }

        let migrator = MigrationManager::new(manager.clone());
        let plan = migrator.plan(&scope(), &target).await.unwrap();
        assert_eq!(plan.pending_jobs, 5);
        assert_eq!(plan.reserved_jobs, 0);

        // No side effects: source unchanged, no assignment installed
        assert_eq!(source.counts(&scope()).await.unwrap().pending.total(), 5);
        assert_eq!(manager.assignment_count(), 0);
    }

    #[tokio::test]
    async fn run_moves_all_jobs_and_verifies() {
        let source: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let target: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let manager = Arc::new(BackendManager::new(source.clone()));

        let mut ids = Vec::new();
        for i in 0..12 {
            let j = job(format!("payload-{}", i).as_bytes());
            ids.push(j.id.clone());
            source.enqueue(&j).await.unwrap();
        }

        let migrator = MigrationManager::new(manager.clone()).with_batch_size(5);
        let report = migrator.run(&scope(), target.clone()).await.unwrap();

        assert_eq!(report.phase, MigrationPhase::Completed);
        assert_eq!(report.migrated, 12);
        assert_eq!(report.verified, 12);
        assert_eq!(report.failed, 0);

        // Jobs live on the target only
        assert_eq!(source.counts(&scope()).await.unwrap().pending.total(), 0);
        assert_eq!(target.counts(&scope()).await.unwrap().pending.total(), 12);

        // New enqueues route to the target
        assert!(Arc::ptr_eq(&manager.backend_for(&scope()), &target));
    }

    #[tokio::test]
    async fn same_backend_is_rejected() {
        let source: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let manager = Arc::new(BackendManager::new(source.clone()));
        let migrator = MigrationManager::new(manager);
        assert!(migrator.run(&scope(), source).await.is_err());
    }
}
