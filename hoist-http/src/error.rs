use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;

use hoist_core::QueueError;

/// Error envelope every endpoint returns on failure.
///
/// The body is `{code, error, status, request_id, timestamp, details?}`;
/// quota and rate errors additionally carry a `Retry-After` header.
#[derive(Debug)]
pub struct ApiError {
    pub error: QueueError,
    pub request_id: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(error: QueueError, request_id: impl Into<String>) -> Self {
        Self {
            error,
            request_id: request_id.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut body = json!({
            "code": self.error.code(),
            "error": self.error.to_string(),
            "status": status.as_u16(),
            "request_id": self.request_id,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let details = match (&self.details, &self.error) {
            (Some(details), _) => Some(details.clone()),
            (None, QueueError::ConfirmationRequired { expected }) => {
                Some(json!({ "expected_confirmation": expected }))
            }
            _ => None,
        };
        if let Some(details) = details {
            body["details"] = details;
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(retry_after) = self.error.retry_after() {
            if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().max(1).to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&self.request_id) {
            response.headers_mut().insert("X-Request-ID", value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn envelope_carries_code_and_request_id() {
        let err = ApiError::new(QueueError::Validation("bad".to_string()), "req-1");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get("X-Request-ID").unwrap(),
            "req-1"
        );
    }

    #[test]
    fn rate_limit_sets_retry_after() {
        let err = ApiError::new(
            QueueError::RateLimited {
                retry_after: Duration::from_secs(7),
            },
            "req-2",
        );
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "7");
    }

    #[test]
    fn confirmation_error_maps_to_428() {
        let err = ApiError::new(
            QueueError::ConfirmationRequired {
                expected: "CONFIRM_DELETE".to_string(),
            },
            "req-3",
        );
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::PRECONDITION_REQUIRED);
    }
}
