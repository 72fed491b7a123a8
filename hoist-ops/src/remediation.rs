//! DLQ remediation pipeline.
//!
//! Each tick samples a bounded batch of dead-lettered jobs and evaluates
//! rules in priority order; the first enabled match wins. Matchers combine
//! an error-pattern regex, a job-type predicate, a retry-count comparison
//! and an optional time window, all validated with field-level errors at
//! rule creation. Actions run in declared order under per-rule safety caps;
//! a rule whose error rate crosses the abort threshold stops for the run.
//! Dry runs report what would happen without side effects. Executions are
//! gated on an idempotency key: re-submissions within 24 hours return the
//! original report.
//!
//! Payload-mutating actions (transform, redact, tag, delay) act on a
//! working copy that a later requeue or route persists, so rules containing
//! them must end in a requeue or route; that is enforced at creation.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use hoist_broker::Broker;
use hoist_core::{Job, JobId, Priority, QueueError, QueueResult, TenantCtx, TenantId};

/// Job-type predicate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobTypePredicate {
    Equals { value: String },
    /// `*` matches any run of characters
    Wildcard { pattern: String },
    OneOf { values: Vec<String> },
}

impl JobTypePredicate {
    fn matches(&self, job_type: &str) -> bool {
        match self {
            Self::Equals { value } => job_type == value,
            Self::Wildcard { pattern } => wildcard_match(pattern, job_type),
            Self::OneOf { values } => values.iter().any(|v| v == job_type),
        }
    }
}

fn wildcard_match(pattern: &str, input: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut remainder = input;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match remainder.find(part) {
            Some(pos) => {
                if i == 0 && pos != 0 {
                    return false;
                }
                remainder = &remainder[pos + part.len()..];
            }
            None => return false,
        }
    }
    if !pattern.ends_with('*') {
        if let Some(last) = parts.last() {
            if !last.is_empty() && !input.ends_with(last) {
                return false;
            }
        }
    }
    true
}

/// Retry-count comparison
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    fn eval(self, left: u32, right: u32) -> bool {
        match self {
            Self::Eq => left == right,
            Self::Gt => left > right,
            Self::Gte => left >= right,
            Self::Lt => left < right,
            Self::Lte => left <= right,
        }
    }
}

/// What a rule matches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Matcher {
    /// Regex over the dead-letter reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_type: Option<JobTypePredicate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<(CompareOp, u32)>,
    /// Only jobs dead-lettered inside this window match
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Remediation actions, executed in declared order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RemediationAction {
    Requeue {
        #[serde(skip_serializing_if = "Option::is_none")]
        queue: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        priority: Option<Priority>,
        #[serde(skip_serializing_if = "Option::is_none")]
        delay: Option<Duration>,
    },
    Transform {
        #[serde(default)]
        set: HashMap<String, serde_json::Value>,
        #[serde(default)]
        remove: Vec<String>,
        #[serde(default)]
        add_if_missing: HashMap<String, serde_json::Value>,
    },
    Redact {
        fields: Vec<String>,
        replacement: String,
    },
    Drop {
        reason: String,
        #[serde(default)]
        retain_for_audit: bool,
    },
    Route {
        rules: Vec<(String, String)>,
        default: String,
    },
    Tag {
        tags: HashMap<String, serde_json::Value>,
    },
    Delay {
        delay: Duration,
    },
    Notify {
        channels: Vec<String>,
        message: String,
    },
}

impl RemediationAction {
    fn name(&self) -> &'static str {
        match self {
            Self::Requeue { .. } => "requeue",
            Self::Transform { .. } => "transform",
            Self::Redact { .. } => "redact",
            Self::Drop { .. } => "drop",
            Self::Route { .. } => "route",
            Self::Tag { .. } => "tag",
            Self::Delay { .. } => "delay",
            Self::Notify { .. } => "notify",
        }
    }

    fn persists(&self) -> bool {
        matches!(
            self,
            Self::Requeue { .. } | Self::Route { .. } | Self::Drop { .. }
        )
    }

    fn mutates_payload(&self) -> bool {
        matches!(
            self,
            Self::Transform { .. } | Self::Redact { .. } | Self::Tag { .. } | Self::Delay { .. }
        )
    }
}

/// Per-rule execution caps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyLimits {
    pub max_actions_per_minute: u32,
    pub max_per_run: u32,
    /// Rule aborts for the run when its error rate crosses this
    pub abort_error_rate: f64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_actions_per_minute: 600,
            max_per_run: 100,
            abort_error_rate: 0.5,
        }
    }
}

/// Lifetime counters per rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleStatistics {
    pub matched: u64,
    pub succeeded: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_matched_at: Option<DateTime<Utc>>,
}

/// A remediation rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationRule {
    pub id: String,
    pub name: String,
    /// Lower numbers evaluate first
    pub priority: i32,
    pub enabled: bool,
    pub matcher: Matcher,
    pub actions: Vec<RemediationAction>,
    #[serde(default)]
    pub safety: SafetyLimits,
    #[serde(default)]
    pub statistics: RuleStatistics,
}

impl RemediationRule {
    /// Field-level validation applied at creation
    pub fn validate(&self) -> QueueResult<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name: must not be empty".to_string());
        }
        if let Some(pattern) = &self.matcher.error_pattern {
            if let Err(e) = Regex::new(pattern) {
                errors.push(format!("matcher.error_pattern: {}", e));
            }
        }
        if let Some((start, end)) = &self.matcher.time_window {
            if start >= end {
                errors.push("matcher.time_window: start must precede end".to_string());
            }
        }
        if self.actions.is_empty() {
            errors.push("actions: at least one action is required".to_string());
        }
        if self.safety.abort_error_rate < 0.0 || self.safety.abort_error_rate > 1.0 {
            errors.push("safety.abort_error_rate: must be within 0..1".to_string());
        }

        // Mutating actions need a later persisting action
        let last_mutating = self
            .actions
            .iter()
            .rposition(|a| a.mutates_payload());
        let last_persisting = self.actions.iter().rposition(|a| a.persists());
        if let Some(mutating) = last_mutating {
            match last_persisting {
                Some(persisting) if persisting > mutating => {}
                _ => errors.push(format!(
                    "actions[{}]: {} requires a later requeue or route to persist",
                    mutating,
                    self.actions[mutating].name()
                )),
            }
        }

        for (i, action) in self.actions.iter().enumerate() {
            if let RemediationAction::Route { rules, default } = action {
                if default.trim().is_empty() {
                    errors.push(format!("actions[{}].default: must not be empty", i));
                }
                for (j, (pattern, _)) in rules.iter().enumerate() {
                    if let Err(e) = Regex::new(pattern) {
                        errors.push(format!("actions[{}].rules[{}]: {}", i, j, e));
                    }
                }
            }
            if let RemediationAction::Redact { fields, .. } = action {
                if fields.is_empty() {
                    errors.push(format!("actions[{}].fields: must not be empty", i));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(QueueError::Validation(errors.join("; ")))
        }
    }

    fn matches(&self, job: &Job, reason: &str, dead_at: DateTime<Utc>) -> bool {
        if let Some(pattern) = &self.matcher.error_pattern {
            // Validated at creation
            match Regex::new(pattern) {
                Ok(re) if re.is_match(reason) => {}
                _ => return false,
            }
        }
        if let Some(predicate) = &self.matcher.job_type {
            let job_type = payload_job_type(job);
            if !predicate.matches(&job_type) {
                return false;
            }
        }
        if let Some((op, value)) = self.matcher.retry_count {
            if !op.eval(job.attempts, value) {
                return false;
            }
        }
        if let Some((start, end)) = self.matcher.time_window {
            if dead_at < start || dead_at > end {
                return false;
            }
        }
        true
    }
}

/// The job-type attribute lives in the payload under `"type"` when the
/// payload is a JSON object; anything else matches as an empty type.
fn payload_job_type(job: &Job) -> String {
    serde_json::from_slice::<serde_json::Value>(&job.payload)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from))
        .unwrap_or_default()
}

/// What one action did (or would do, in a dry run)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: String,
    pub detail: String,
}

/// Audit record for one rule invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub job_id: JobId,
    pub rule_id: String,
    pub outcome: String,
    pub actions_applied: Vec<ActionOutcome>,
    /// Payload before, with the redaction allowlist applied
    pub before_state: serde_json::Value,
    pub after_state: serde_json::Value,
    pub duration: Duration,
    pub at: DateTime<Utc>,
}

/// Per-job result inside a run report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleReport {
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub outcomes: Vec<ActionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub processed: usize,
    pub matched: usize,
    pub dry_run: bool,
    pub reports: Vec<RuleReport>,
    pub ran_at: DateTime<Utc>,
}

/// A queued operator notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub channels: Vec<String>,
    pub message: String,
    pub job_id: JobId,
    pub at: DateTime<Utc>,
}

struct RateWindow {
    count: u32,
    window_start: DateTime<Utc>,
}

/// Classifier + executor over the DLQ
pub struct RemediationPipeline {
    broker: Arc<Broker>,
    rules: RwLock<Vec<RemediationRule>>,
    audit: RwLock<VecDeque<AuditEntry>>,
    notifications: RwLock<VecDeque<Notification>>,
    executions: Mutex<HashMap<String, (DateTime<Utc>, RunReport)>>,
    rate_windows: Mutex<HashMap<String, RateWindow>>,
    /// Payload fields allowed verbatim in audit before/after states
    redaction_allowlist: Vec<String>,
    audit_cap: usize,
}

impl RemediationPipeline {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            rules: RwLock::new(Vec::new()),
            audit: RwLock::new(VecDeque::new()),
            notifications: RwLock::new(VecDeque::new()),
            executions: Mutex::new(HashMap::new()),
            rate_windows: Mutex::new(HashMap::new()),
            redaction_allowlist: vec!["type".to_string(), "id".to_string()],
            audit_cap: 4096,
        }
    }

    pub fn with_redaction_allowlist(mut self, allowlist: Vec<String>) -> Self {
        self.redaction_allowlist = allowlist;
        self
    }

    pub fn add_rule(&self, rule: RemediationRule) -> QueueResult<()> {
        rule.validate()?;
        let mut rules = self.rules.write();
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(QueueError::Conflict(format!(
                "rule {} already exists",
                rule.id
            )));
        }
        info!(rule = %rule.id, "remediation rule added");
        rules.push(rule);
        rules.sort_by_key(|r| r.priority);
        Ok(())
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        rules.len() < before
    }

    pub fn list_rules(&self) -> Vec<RemediationRule> {
        self.rules.read().clone()
    }

    pub fn audit_log(&self, limit: usize) -> Vec<AuditEntry> {
        self.audit.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn drain_notifications(&self, limit: usize) -> Vec<Notification> {
        let mut notifications = self.notifications.write();
        let take = notifications.len().min(limit);
        notifications.drain(..take).collect()
    }

    /// Execute one pipeline pass. `idempotency_key` is required unless this
    /// is a dry run; re-submissions within 24h return the original report.
    pub async fn run(
        &self,
        tenant: &TenantId,
        queue: &str,
        batch: usize,
        dry_run: bool,
        idempotency_key: Option<&str>,
    ) -> QueueResult<RunReport> {
        if !dry_run {
            let key = idempotency_key.ok_or_else(|| {
                QueueError::Validation(
                    "an Idempotency-Key is required to execute remediation".to_string(),
                )
            })?;
            let executions = self.executions.lock();
            if let Some((at, report)) = executions.get(key) {
                if Utc::now() - *at < chrono::Duration::hours(24) {
                    return Ok(report.clone());
                }
            }
        }

        let ctx = TenantCtx::new(tenant.clone());
        let entries = self
            .broker
            .peek(&ctx, queue, hoist_backend::JobSource::DeadLetter, 0, batch)
            .await?;

        let mut report = RunReport {
            processed: 0,
            matched: 0,
            dry_run,
            reports: Vec::new(),
            ran_at: Utc::now(),
        };
        // Rules aborted for this run after crossing their error threshold
        let mut aborted: HashMap<String, bool> = HashMap::new();
        let mut run_counts: HashMap<String, (u32, u32)> = HashMap::new(); // (applied, failed)

        let rules = self.rules.read().clone();
        for job in entries {
            report.processed += 1;
            let (reason, dead_at) = match &job.state {
                hoist_core::JobState::DeadLettered { reason, at } => (reason.clone(), *at),
                _ => continue,
            };

            let matched = rules
                .iter()
                .filter(|r| r.enabled && !aborted.get(&r.id).copied().unwrap_or(false))
                .find(|r| r.matches(&job, &reason, dead_at));
            let Some(rule) = matched else {
                report.reports.push(RuleReport {
                    job_id: job.id.clone(),
                    rule_id: None,
                    outcomes: Vec::new(),
                    error: None,
                });
                continue;
            };
            report.matched += 1;

            let (applied, failed) = run_counts.entry(rule.id.clone()).or_insert((0, 0));
            if *applied >= rule.safety.max_per_run {
                continue;
            }
            if !self.within_rate(&rule.id, rule.safety.max_actions_per_minute) {
                warn!(rule = %rule.id, "per-minute action cap reached");
                continue;
            }

            let started = std::time::Instant::now();
            let before_state = self.audited_payload(&job);
            let result = self.apply_rule(&ctx, rule, job.clone(), dry_run).await;
            let duration = started.elapsed();

            match result {
                Ok((outcomes, after_job)) => {
                    *applied += 1;
                    self.record_audit(AuditEntry {
                        job_id: job.id.clone(),
                        rule_id: rule.id.clone(),
                        outcome: "applied".to_string(),
                        actions_applied: outcomes.clone(),
                        before_state,
                        after_state: self.audited_payload(&after_job),
                        duration,
                        at: Utc::now(),
                    });
                    self.bump_stats(&rule.id, true);
                    report.reports.push(RuleReport {
                        job_id: job.id.clone(),
                        rule_id: Some(rule.id.clone()),
                        outcomes,
                        error: None,
                    });
                }
                Err(e) => {
                    *failed += 1;
                    self.record_audit(AuditEntry {
                        job_id: job.id.clone(),
                        rule_id: rule.id.clone(),
                        outcome: format!("failed: {}", e),
                        actions_applied: Vec::new(),
                        before_state,
                        after_state: serde_json::Value::Null,
                        duration,
                        at: Utc::now(),
                    });
                    self.bump_stats(&rule.id, false);
                    report.reports.push(RuleReport {
                        job_id: job.id.clone(),
                        rule_id: Some(rule.id.clone()),
                        outcomes: Vec::new(),
                        error: Some(e.to_string()),
                    });

                    let total = *applied + *failed;
                    if total >= 4
                        && *failed as f64 / total as f64 > rule.safety.abort_error_rate
                    {
                        warn!(rule = %rule.id, "error rate exceeded threshold, aborting rule");
                        aborted.insert(rule.id.clone(), true);
                    }
                }
            }
        }

        if !dry_run {
            if let Some(key) = idempotency_key {
                let mut executions = self.executions.lock();
                executions.retain(|_, (at, _)| Utc::now() - *at < chrono::Duration::hours(24));
                executions.insert(key.to_string(), (Utc::now(), report.clone()));
            }
        }
        Ok(report)
    }

    async fn apply_rule(
        &self,
        ctx: &TenantCtx,
        rule: &RemediationRule,
        mut job: Job,
        dry_run: bool,
    ) -> QueueResult<(Vec<ActionOutcome>, Job)> {
        let mut outcomes = Vec::with_capacity(rule.actions.len());
        let mut pending_delay: Option<Duration> = None;
        let source_queue = job.queue.clone();

        for action in &rule.actions {
            match action {
                RemediationAction::Transform {
                    set,
                    remove,
                    add_if_missing,
                } => {
                    let mut payload = parse_payload(&job)?;
                    if let Some(object) = payload.as_object_mut() {
                        for (k, v) in set {
                            object.insert(k.clone(), v.clone());
                        }
                        for k in remove {
                            object.remove(k);
                        }
                        for (k, v) in add_if_missing {
                            object.entry(k.clone()).or_insert_with(|| v.clone());
                        }
                    }
                    job.payload = serde_json::to_vec(&payload)?;
                    outcomes.push(ActionOutcome {
                        action: "transform".to_string(),
                        detail: format!(
                            "set {}, removed {}, defaulted {}",
                            set.len(),
                            remove.len(),
                            add_if_missing.len()
                        ),
                    });
                }
                RemediationAction::Redact {
                    fields,
                    replacement,
                } => {
                    let mut payload = parse_payload(&job)?;
                    let mut redacted = 0;
                    if let Some(object) = payload.as_object_mut() {
                        for field in fields {
                            if object.contains_key(field) {
                                object.insert(
                                    field.clone(),
                                    serde_json::Value::String(replacement.clone()),
                                );
                                redacted += 1;
                            }
                        }
                    }
                    job.payload = serde_json::to_vec(&payload)?;
                    outcomes.push(ActionOutcome {
                        action: "redact".to_string(),
                        detail: format!("redacted {} fields", redacted),
                    });
                }
                RemediationAction::Tag { tags } => {
                    let mut payload = parse_payload(&job)?;
                    if let Some(object) = payload.as_object_mut() {
                        let entry = object
                            .entry("tags".to_string())
                            .or_insert_with(|| serde_json::json!({}));
                        if let Some(tag_object) = entry.as_object_mut() {
                            for (k, v) in tags {
                                tag_object.insert(k.clone(), v.clone());
                            }
                        }
                    }
                    job.payload = serde_json::to_vec(&payload)?;
                    outcomes.push(ActionOutcome {
                        action: "tag".to_string(),
                        detail: format!("{} tags", tags.len()),
                    });
                }
                RemediationAction::Delay { delay } => {
                    pending_delay = Some(*delay);
                    outcomes.push(ActionOutcome {
                        action: "delay".to_string(),
                        detail: format!("{:?}", delay),
                    });
                }
                RemediationAction::Requeue {
                    queue,
                    priority,
                    delay,
                } => {
                    let target = queue.clone().unwrap_or_else(|| source_queue.clone());
                    let effective_delay = delay.or(pending_delay);
                    if !dry_run {
                        self.persist_requeue(
                            ctx,
                            &source_queue,
                            &mut job,
                            &target,
                            *priority,
                            effective_delay,
                        )
                        .await?;
                    }
                    outcomes.push(ActionOutcome {
                        action: "requeue".to_string(),
                        detail: format!(
                            "to '{}'{}{}",
                            target,
                            priority
                                .map(|p| format!(" at {}", p))
                                .unwrap_or_default(),
                            effective_delay
                                .map(|d| format!(" after {:?}", d))
                                .unwrap_or_default()
                        ),
                    });
                }
                RemediationAction::Route { rules, default } => {
                    let reason = match &job.state {
                        hoist_core::JobState::DeadLettered { reason, .. } => reason.clone(),
                        _ => String::new(),
                    };
                    let target = rules
                        .iter()
                        .find(|(pattern, _)| {
                            Regex::new(pattern)
                                .map(|re| re.is_match(&reason))
                                .unwrap_or(false)
                        })
                        .map(|(_, queue)| queue.clone())
                        .unwrap_or_else(|| default.clone());
                    if !dry_run {
                        self.persist_requeue(
                            ctx,
                            &source_queue,
                            &mut job,
                            &target,
                            None,
                            pending_delay,
                        )
                        .await?;
                    }
                    outcomes.push(ActionOutcome {
                        action: "route".to_string(),
                        detail: format!("to '{}'", target),
                    });
                }
                RemediationAction::Drop {
                    reason,
                    retain_for_audit,
                } => {
                    if !dry_run {
                        self.broker.purge_job(ctx, &source_queue, &job.id).await?;
                    }
                    outcomes.push(ActionOutcome {
                        action: "drop".to_string(),
                        detail: format!(
                            "{}{}",
                            reason,
                            if *retain_for_audit {
                                " (retained in audit)"
                            } else {
                                ""
                            }
                        ),
                    });
                }
                RemediationAction::Notify { channels, message } => {
                    if !dry_run {
                        let mut notifications = self.notifications.write();
                        if notifications.len() >= 1024 {
                            notifications.pop_front();
                        }
                        notifications.push_back(Notification {
                            channels: channels.clone(),
                            message: message.clone(),
                            job_id: job.id.clone(),
                            at: Utc::now(),
                        });
                    }
                    outcomes.push(ActionOutcome {
                        action: "notify".to_string(),
                        detail: format!("{} channels", channels.len()),
                    });
                }
            }
        }
        Ok((outcomes, job))
    }

    /// Persist a (possibly transformed) job back to a pending queue and
    /// drop the dead-letter entry.
    async fn persist_requeue(
        &self,
        ctx: &TenantCtx,
        source_queue: &str,
        job: &mut Job,
        target: &str,
        priority: Option<Priority>,
        delay: Option<Duration>,
    ) -> QueueResult<()> {
        let mut requeued = job.clone();
        requeued.queue = target.to_string();
        if let Some(p) = priority {
            requeued.priority = p;
        }
        requeued.attempts = 0;
        requeued.run_at = delay.map(|d| {
            Utc::now() + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
        });
        // Remove the dead-letter entry before re-inserting under the same id
        self.broker.purge_job(ctx, source_queue, &job.id).await?;
        self.broker.reenqueue(&requeued).await?;
        *job = requeued;
        Ok(())
    }

    fn within_rate(&self, rule_id: &str, cap: u32) -> bool {
        let now = Utc::now();
        let mut windows = self.rate_windows.lock();
        let window = windows.entry(rule_id.to_string()).or_insert(RateWindow {
            count: 0,
            window_start: now,
        });
        if now - window.window_start >= chrono::Duration::seconds(60) {
            window.count = 0;
            window.window_start = now;
        }
        if window.count >= cap {
            return false;
        }
        window.count += 1;
        true
    }

    fn bump_stats(&self, rule_id: &str, success: bool) {
        let mut rules = self.rules.write();
        if let Some(rule) = rules.iter_mut().find(|r| r.id == rule_id) {
            rule.statistics.matched += 1;
            rule.statistics.last_matched_at = Some(Utc::now());
            if success {
                rule.statistics.succeeded += 1;
            } else {
                rule.statistics.failed += 1;
            }
        }
    }

    fn record_audit(&self, entry: AuditEntry) {
        let mut audit = self.audit.write();
        if audit.len() >= self.audit_cap {
            audit.pop_front();
        }
        audit.push_back(entry);
    }

    /// Payload view for the audit log: allowlisted fields verbatim, the
    /// rest replaced.
    fn audited_payload(&self, job: &Job) -> serde_json::Value {
        match serde_json::from_slice::<serde_json::Value>(&job.payload) {
            Ok(serde_json::Value::Object(object)) => {
                let mut out = serde_json::Map::new();
                for (k, v) in object {
                    if self.redaction_allowlist.contains(&k) {
                        out.insert(k, v);
                    } else {
                        out.insert(k, serde_json::Value::String("[redacted]".to_string()));
                    }
                }
                serde_json::Value::Object(out)
            }
            _ => serde_json::json!({ "payload_bytes": job.payload.len() }),
        }
    }
}

fn parse_payload(job: &Job) -> QueueResult<serde_json::Value> {
    serde_json::from_slice(&job.payload).map_err(|e| {
        QueueError::Validation(format!("payload is not JSON, cannot transform: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoist_backend::registry::BackendManager;
    use hoist_backend::{MemoryBackend, MemoryTenantStore, StorageBackend, TenantStore};
    use hoist_core::{ChaosInjector, EnqueueOptions, QueueDefaults, TenantRecord, WorkerId};

    async fn pipeline_with_dead_job(payload: serde_json::Value, reason: &str) -> (RemediationPipeline, Arc<Broker>, JobId) {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let tenants = Arc::new(MemoryTenantStore::new());
        tenants
            .create(TenantRecord::new(TenantId::new("acme").unwrap()))
            .await
            .unwrap();
        let broker = Arc::new(Broker::new(
            Arc::new(BackendManager::new(backend)),
            tenants,
            Arc::new(ChaosInjector::new()),
            QueueDefaults::default(),
        ));

        let ctx = TenantCtx::new(TenantId::new("acme").unwrap());
        let id = broker
            .enqueue(
                &ctx,
                "work",
                serde_json::to_vec(&payload).unwrap(),
                EnqueueOptions::new(),
            )
            .await
            .unwrap();
        let req = hoist_broker::DequeueRequest {
            worker_id: WorkerId::from("w1"),
            queues: vec!["work".to_string()],
            wait_timeout: Duration::from_millis(10),
            visibility_timeout: None,
        };
        let reserved = broker.dequeue(&ctx, &req).await.unwrap().unwrap();
        broker
            .nack(&ctx, "work", &id, &reserved.token, reason, false)
            .await
            .unwrap();

        (RemediationPipeline::new(broker.clone()), broker, id)
    }

    fn requeue_rule(id: &str, pattern: &str) -> RemediationRule {
        RemediationRule {
            id: id.to_string(),
            name: format!("rule {}", id),
            priority: 10,
            enabled: true,
            matcher: Matcher {
                error_pattern: Some(pattern.to_string()),
                ..Matcher::default()
            },
            actions: vec![RemediationAction::Requeue {
                queue: None,
                priority: Some(Priority::High),
                delay: None,
            }],
            safety: SafetyLimits::default(),
            statistics: RuleStatistics::default(),
        }
    }

    fn tenant() -> TenantId {
        TenantId::new("acme").unwrap()
    }

    #[test]
    fn invalid_regex_rejected_with_field_error() {
        let rule = requeue_rule("r1", "([unclosed");
        let err = rule.validate().unwrap_err();
        assert!(err.to_string().contains("matcher.error_pattern"));
    }

    #[test]
    fn mutating_action_without_persist_rejected() {
        let mut rule = requeue_rule("r1", "x");
        rule.actions = vec![RemediationAction::Redact {
            fields: vec!["card".to_string()],
            replacement: "***".to_string(),
        }];
        let err = rule.validate().unwrap_err();
        assert!(err.to_string().contains("requires a later requeue"));
    }

    #[test]
    fn wildcard_matching() {
        assert!(wildcard_match("send_*", "send_email"));
        assert!(wildcard_match("*_email", "send_email"));
        assert!(wildcard_match("*", "anything"));
        assert!(!wildcard_match("send_*", "receive_email"));
        assert!(!wildcard_match("*_sms", "send_email"));
    }

    #[tokio::test]
    async fn first_matching_rule_wins_by_priority() {
        let (pipeline, _broker, _id) =
            pipeline_with_dead_job(serde_json::json!({"type": "send_email"}), "timeout contacting smtp")
                .await;

        let mut low = requeue_rule("low", "timeout");
        low.priority = 100;
        let mut high = requeue_rule("high", "timeout");
        high.priority = 1;
        pipeline.add_rule(low).unwrap();
        pipeline.add_rule(high).unwrap();

        let report = pipeline
            .run(&tenant(), "work", 10, true, None)
            .await
            .unwrap();
        assert_eq!(report.matched, 1);
        assert_eq!(report.reports[0].rule_id.as_deref(), Some("high"));
    }

    #[tokio::test]
    async fn dry_run_reports_without_side_effects() {
        let (pipeline, broker, _id) =
            pipeline_with_dead_job(serde_json::json!({"type": "send_email"}), "timeout").await;
        pipeline.add_rule(requeue_rule("r1", "timeout")).unwrap();

        let report = pipeline
            .run(&tenant(), "work", 10, true, None)
            .await
            .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.matched, 1);

        // The job is still dead-lettered
        let ctx = TenantCtx::new(tenant());
        let stats = broker.stats(&ctx, "work").await.unwrap();
        assert_eq!(stats.dead_lettered, 1);
    }

    #[tokio::test]
    async fn execution_requires_idempotency_key_and_replays() {
        let (pipeline, broker, _id) =
            pipeline_with_dead_job(serde_json::json!({"type": "send_email"}), "timeout").await;
        pipeline.add_rule(requeue_rule("r1", "timeout")).unwrap();

        let missing = pipeline.run(&tenant(), "work", 10, false, None).await;
        assert!(matches!(missing, Err(QueueError::Validation(_))));

        let first = pipeline
            .run(&tenant(), "work", 10, false, Some("op-123"))
            .await
            .unwrap();
        assert_eq!(first.matched, 1);

        let ctx = TenantCtx::new(tenant());
        let stats = broker.stats(&ctx, "work").await.unwrap();
        assert_eq!(stats.dead_lettered, 0);
        assert_eq!(stats.pending.high, 1);

        // Replay returns the original report without re-executing
        let replay = pipeline
            .run(&tenant(), "work", 10, false, Some("op-123"))
            .await
            .unwrap();
        assert_eq!(replay.matched, 1);
        assert_eq!(replay.ran_at, first.ran_at);
    }

    #[tokio::test]
    async fn transform_then_requeue_persists_changes() {
        let (pipeline, broker, id) = pipeline_with_dead_job(
            serde_json::json!({"type": "send_email", "card": "4111-1111"}),
            "bad data",
        )
        .await;

        let rule = RemediationRule {
            id: "fix".to_string(),
            name: "redact and retry".to_string(),
            priority: 1,
            enabled: true,
            matcher: Matcher {
                error_pattern: Some("bad data".to_string()),
                ..Matcher::default()
            },
            actions: vec![
                RemediationAction::Redact {
                    fields: vec!["card".to_string()],
                    replacement: "***".to_string(),
                },
                RemediationAction::Requeue {
                    queue: None,
                    priority: None,
                    delay: None,
                },
            ],
            safety: SafetyLimits::default(),
            statistics: RuleStatistics::default(),
        };
        pipeline.add_rule(rule).unwrap();

        pipeline
            .run(&tenant(), "work", 10, false, Some("op-1"))
            .await
            .unwrap();

        let ctx = TenantCtx::new(tenant());
        let job = broker.get_job(&ctx, "work", &id).await.unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&job.payload).unwrap();
        assert_eq!(payload["card"], "***");
        assert!(matches!(job.state, hoist_core::JobState::Pending));
    }

    #[tokio::test]
    async fn drop_action_removes_the_entry() {
        let (pipeline, broker, _id) =
            pipeline_with_dead_job(serde_json::json!({"type": "junk"}), "poison").await;
        let rule = RemediationRule {
            id: "drop".to_string(),
            name: "drop junk".to_string(),
            priority: 1,
            enabled: true,
            matcher: Matcher {
                error_pattern: Some("poison".to_string()),
                ..Matcher::default()
            },
            actions: vec![RemediationAction::Drop {
                reason: "unprocessable".to_string(),
                retain_for_audit: true,
            }],
            safety: SafetyLimits::default(),
            statistics: RuleStatistics::default(),
        };
        pipeline.add_rule(rule).unwrap();

        pipeline
            .run(&tenant(), "work", 10, false, Some("op-2"))
            .await
            .unwrap();

        let ctx = TenantCtx::new(tenant());
        let stats = broker.stats(&ctx, "work").await.unwrap();
        assert_eq!(stats.dead_lettered, 0);
        assert_eq!(stats.backlog(), 0);

        // The audit retains before/after states
        let audit = pipeline.audit_log(10);
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].outcome, "applied");
    }

    #[tokio::test]
    async fn audit_redacts_disallowed_fields() {
        let (pipeline, _broker, _id) = pipeline_with_dead_job(
            serde_json::json!({"type": "send_email", "ssn": "123-45-6789"}),
            "timeout",
        )
        .await;
        pipeline.add_rule(requeue_rule("r1", "timeout")).unwrap();

        pipeline
            .run(&tenant(), "work", 10, false, Some("op-3"))
            .await
            .unwrap();
        let audit = pipeline.audit_log(1);
        assert_eq!(audit[0].before_state["ssn"], "[redacted]");
        assert_eq!(audit[0].before_state["type"], "send_email");
    }

    #[tokio::test]
    async fn retry_count_and_job_type_predicates() {
        let (pipeline, _broker, _id) =
            pipeline_with_dead_job(serde_json::json!({"type": "send_email"}), "timeout").await;

        let mut rule = requeue_rule("strict", "timeout");
        rule.matcher.job_type = Some(JobTypePredicate::Wildcard {
            pattern: "send_*".to_string(),
        });
        rule.matcher.retry_count = Some((CompareOp::Gte, 1));
        pipeline.add_rule(rule).unwrap();

        let report = pipeline
            .run(&tenant(), "work", 10, true, None)
            .await
            .unwrap();
        assert_eq!(report.matched, 1);
    }

    #[tokio::test]
    async fn disabled_rules_never_match() {
        let (pipeline, _broker, _id) =
            pipeline_with_dead_job(serde_json::json!({"type": "x"}), "timeout").await;
        let mut rule = requeue_rule("off", "timeout");
        rule.enabled = false;
        pipeline.add_rule(rule).unwrap();

        let report = pipeline
            .run(&tenant(), "work", 10, true, None)
            .await
            .unwrap();
        assert_eq!(report.matched, 0);
    }
}
