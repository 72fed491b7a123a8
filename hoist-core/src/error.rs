use std::time::Duration;
use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Error taxonomy for the whole runtime.
///
/// Variants map onto a small set of propagation classes: validation and
/// auth errors are never retried; quota/rate errors carry retry-after;
/// transient backend errors are retried locally once before surfacing;
/// shed/circuit-open are distinguishable so producers can route to fallback.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Confirmation required: expected phrase '{expected}'")]
    ConfirmationRequired { expected: String },

    #[error("Quota exceeded for {quota}, retry after {retry_after:?}")]
    QuotaExceeded {
        quota: String,
        retry_after: Duration,
    },

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Tenant suspended: {0}")]
    TenantSuspended(String),

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Invalid reservation token")]
    InvalidReservation,

    #[error("Reservation has expired")]
    ReservationExpired,

    #[error("Job has been cancelled")]
    JobCancelled,

    #[error("Job is already in terminal state")]
    JobAlreadyTerminal,

    #[error("Request shed under backpressure for queue '{queue}'")]
    Shed { queue: String },

    #[error("Circuit open for queue '{queue}'")]
    CircuitOpen { queue: String },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend data corrupt: {0}")]
    BackendCorrupt(String),

    #[error("Backend does not support capability: {0}")]
    Unsupported(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Stable machine-readable error code for the API envelope
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_failed",
            Self::NotAuthenticated(_) => "not_authenticated",
            Self::Forbidden(_) => "forbidden",
            Self::ConfirmationRequired { .. } => "confirmation_required",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::RateLimited { .. } => "rate_limited",
            Self::Conflict(_) => "conflict",
            Self::JobNotFound(_) => "job_not_found",
            Self::QueueNotFound(_) => "queue_not_found",
            Self::TenantNotFound(_) => "tenant_not_found",
            Self::TenantSuspended(_) => "tenant_suspended",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::InvalidReservation => "invalid_reservation",
            Self::ReservationExpired => "reservation_expired",
            Self::JobCancelled => "job_cancelled",
            Self::JobAlreadyTerminal => "job_already_terminal",
            Self::Shed { .. } => "shed",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::BackendCorrupt(_) => "backend_corrupt",
            Self::Unsupported(_) => "unsupported",
            Self::Integrity(_) => "integrity_violation",
            Self::Serialization(_) => "serialization_error",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status code this error surfaces as at the API boundary
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::PayloadTooLarge { .. } => 400,
            Self::NotAuthenticated(_) => 401,
            Self::Forbidden(_) | Self::TenantSuspended(_) => 403,
            Self::JobNotFound(_) | Self::QueueNotFound(_) | Self::TenantNotFound(_) => 404,
            Self::Timeout(_) => 408,
            Self::Conflict(_)
            | Self::InvalidReservation
            | Self::ReservationExpired
            | Self::JobCancelled
            | Self::JobAlreadyTerminal => 409,
            Self::Unsupported(_) => 422,
            Self::ConfirmationRequired { .. } => 428,
            Self::QuotaExceeded { .. } | Self::RateLimited { .. } | Self::Shed { .. } => 429,
            Self::BackendUnavailable(_) | Self::CircuitOpen { .. } => 503,
            Self::BackendCorrupt(_)
            | Self::Integrity(_)
            | Self::Serialization(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Transient errors are retried locally once before being surfaced
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Timeout(_))
    }

    /// Retry-after hint, when one applies
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::QuotaExceeded { retry_after, .. } | Self::RateLimited { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(QueueError::Validation("x".into()).status_code(), 400);
        assert_eq!(QueueError::NotAuthenticated("x".into()).status_code(), 401);
        assert_eq!(
            QueueError::ConfirmationRequired {
                expected: "DELETE".into()
            }
            .status_code(),
            428
        );
        assert_eq!(
            QueueError::RateLimited {
                retry_after: Duration::from_secs(1)
            }
            .status_code(),
            429
        );
        assert_eq!(QueueError::BackendUnavailable("x".into()).status_code(), 503);
        assert_eq!(QueueError::Conflict("x".into()).status_code(), 409);
    }

    #[test]
    fn transient_classification() {
        assert!(QueueError::BackendUnavailable("conn refused".into()).is_transient());
        assert!(QueueError::Timeout("deadline".into()).is_transient());
        assert!(!QueueError::Validation("bad".into()).is_transient());
        assert!(!QueueError::BackendCorrupt("bad".into()).is_transient());
    }

    #[test]
    fn shed_and_circuit_open_are_distinguishable() {
        let shed = QueueError::Shed { queue: "q".into() };
        let open = QueueError::CircuitOpen { queue: "q".into() };
        assert_ne!(shed.code(), open.code());
    }
}
