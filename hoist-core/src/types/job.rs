use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, Priority, ReservationToken, TenantId, WorkerId};

/// Job lifecycle state.
///
/// A job occupies exactly one state at any instant:
/// pending → reserved → {acked | retrying → pending | dead-lettered},
/// with cancellation possible from any non-terminal state (cancel-wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in its priority class, eligible once `run_at` (if any) passes
    Pending,

    /// Checked out by a worker until the visibility deadline
    Reserved {
        deadline: DateTime<Utc>,
        worker_id: WorkerId,
    },

    /// Nacked with a retryable error, eligible again at `retry_at`
    Retrying { retry_at: DateTime<Utc> },

    /// Completed successfully and removed from the active queue
    Acked { at: DateTime<Utc> },

    /// Exhausted `max_attempts` or failed terminally
    DeadLettered { at: DateTime<Utc>, reason: String },

    /// Cancelled by an operator or producer
    Cancelled { at: DateTime<Utc> },
}

impl JobState {
    /// Check if the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Acked { .. } | Self::DeadLettered { .. } | Self::Cancelled { .. }
        )
    }

    /// Check if the job is currently reserved by a worker
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved { .. })
    }

    /// Check if the job may be handed to a worker at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Pending => true,
            Self::Retrying { retry_at } => *retry_at <= now,
            _ => false,
        }
    }

    /// Get the state name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Reserved { .. } => "reserved",
            Self::Retrying { .. } => "retrying",
            Self::Acked { .. } => "acked",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// The unit of work. Authoritative copy lives in the storage backend;
/// in-memory copies are advisory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Globally unique, opaque identifier
    pub id: JobId,

    /// Owning tenant namespace
    pub tenant_id: TenantId,

    /// Target queue name
    pub queue: String,

    /// Priority class for dequeue ordering
    pub priority: Priority,

    /// Opaque payload bytes, size-bounded at enqueue
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,

    /// Current lifecycle state
    pub state: JobState,

    /// Delivery attempts so far
    pub attempts: u32,

    /// Attempts after which a nack dead-letters the job
    pub max_attempts: u32,

    /// When the job was created by the producer
    pub created_at: DateTime<Utc>,

    /// When the job was accepted by the broker
    pub enqueued_at: DateTime<Utc>,

    /// When the job last changed state
    pub updated_at: DateTime<Utc>,

    /// Earliest eligible execution time, for delayed jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,

    /// Current fencing token while reserved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation: Option<ReservationToken>,

    /// Most recent failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,

    /// Producer-supplied key for duplicate suppression
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// Content fingerprint paired with the idempotency key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_fingerprint: Option<String>,
}

impl Job {
    /// Create a pending job from enqueue inputs
    pub fn new(
        tenant_id: TenantId,
        queue: impl Into<String>,
        payload: Vec<u8>,
        opts: EnqueueOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            tenant_id,
            queue: queue.into(),
            priority: opts.priority,
            payload,
            state: JobState::Pending,
            attempts: 0,
            max_attempts: opts.max_attempts,
            created_at: opts.created_at.unwrap_or(now),
            enqueued_at: now,
            updated_at: now,
            run_at: opts.run_at,
            reservation: None,
            last_error: None,
            trace_id: opts.trace_id,
            span_id: opts.span_id,
            idempotency_key: opts.idempotency_key,
            dedup_fingerprint: opts.dedup_fingerprint,
        }
    }

    /// Check if the job may be handed to a worker at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        if let Some(run_at) = self.run_at {
            if run_at > now {
                return false;
            }
        }
        self.state.is_eligible(now)
    }

    /// Check if another delivery attempt is allowed
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts && !self.state.is_terminal()
    }

    /// Check if the reservation deadline has elapsed
    pub fn reservation_expired(&self, now: DateTime<Utc>) -> bool {
        match &self.state {
            JobState::Reserved { deadline, .. } => *deadline < now,
            _ => false,
        }
    }

    /// Move into the reserved state under a fresh fencing token.
    /// `attempts` counts failed deliveries, so it advances on nack or
    /// visibility expiry, not here.
    pub fn start_reservation(
        &mut self,
        token: ReservationToken,
        worker_id: WorkerId,
        deadline: DateTime<Utc>,
    ) {
        self.state = JobState::Reserved {
            deadline,
            worker_id,
        };
        self.reservation = Some(token);
        self.updated_at = Utc::now();
    }

    /// Record one failed delivery (nack or visibility expiry)
    pub fn record_failure(&mut self) {
        self.attempts += 1;
        self.updated_at = Utc::now();
    }

    /// Complete the job successfully
    pub fn ack(&mut self) {
        self.state = JobState::Acked { at: Utc::now() };
        self.reservation = None;
        self.updated_at = Utc::now();
    }

    /// Schedule a retry after a backoff
    pub fn schedule_retry(&mut self, retry_at: DateTime<Utc>, error: impl Into<String>) {
        self.state = JobState::Retrying { retry_at };
        self.reservation = None;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// Move the job to the dead-letter queue
    pub fn dead_letter(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.state = JobState::DeadLettered {
            at: Utc::now(),
            reason: reason.clone(),
        };
        self.reservation = None;
        self.last_error = Some(reason);
        self.updated_at = Utc::now();
    }

    /// Cancel the job (cancel-wins)
    pub fn cancel(&mut self) {
        self.state = JobState::Cancelled { at: Utc::now() };
        self.reservation = None;
        self.updated_at = Utc::now();
    }

    /// Release a reservation back to pending without counting a failure.
    /// Used when a reserve round-trip is cancelled before delivery.
    pub fn release(&mut self) {
        self.state = JobState::Pending;
        self.reservation = None;
        self.updated_at = Utc::now();
    }

    /// Payload size in bytes
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}

/// Producer-side options accepted at enqueue
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    pub max_attempts: u32,
    pub run_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub dedup_fingerprint: Option<String>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self {
            priority: Priority::Normal,
            max_attempts: 3,
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = Some(span_id.into());
        self
    }
}

/// A job checked out by a worker, together with its fencing token
#[derive(Debug, Clone)]
pub struct ReservedJob {
    pub job: Job,
    pub token: ReservationToken,
    pub deadline: DateTime<Utc>,
}

impl ReservedJob {
    pub fn new(job: Job, token: ReservationToken, deadline: DateTime<Utc>) -> Self {
        Self {
            job,
            token,
            deadline,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }

    /// Check if the reservation is still valid at `now`
    pub fn valid(&self, now: DateTime<Utc>) -> bool {
        self.deadline > now
    }
}

mod payload_base64 {
    //! Payload bytes serialize as base64 text so job records stay readable
    //! when stored as JSON in Redis.

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
