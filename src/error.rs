//! Error types for Turnover Guard
//!
//! This module provides the error taxonomy shared by every layer that can
//! reject a request, using `thiserror`. Each variant maps to one HTTP status
//! and one machine-readable code, and carries a public message that never
//! reveals internals or whether a resource exists.

use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::context::Role;
use crate::model::ScheduleStatus;
use crate::store::StoreError;

/// The main error type for guarded operations
#[derive(Error, Debug, Clone)]
pub enum GuardError {
    /// Missing, malformed, unknown or expired bearer token
    #[error("Authentication failed: {0}")]
    Authentication(AuthFailure),

    /// Valid identity, insufficient rights. Deliberately carries no detail.
    #[error("Forbidden")]
    Authorization,

    /// Malformed body or injection pattern
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unknown route
    #[error("Not found")]
    NotFound,

    /// HTTP method not declared by the endpoint policy
    #[error("Method {0} not allowed")]
    MethodNotAllowed(String),

    /// No edge between the two states
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: ScheduleStatus,
        /// Requested state
        to: ScheduleStatus,
    },

    /// Edge exists but the caller's role may not take it
    #[error("Role {role} may not transition from {from} to {to}")]
    ForbiddenTransition {
        /// Current state
        from: ScheduleStatus,
        /// Requested state
        to: ScheduleStatus,
        /// Caller role
        role: Role,
    },

    /// Optimistic-lock mismatch; refetch and retry
    #[error("Version conflict: expected {expected}, current {current:?}")]
    VersionConflict {
        /// Version the caller presented
        expected: u64,
        /// Version in the store, when known
        current: Option<u64>,
    },

    /// Window budget exhausted
    #[error("Rate limit exceeded, retry after {}s", .retry_after.as_secs())]
    RateLimited {
        /// Time until the window resets
        retry_after: Duration,
        /// Window reset instant
        reset_at: DateTime<Utc>,
        /// Requests allowed per window
        limit: u32,
    },

    /// Bad webhook signature or stale/future timestamp
    #[error("Replay rejected: {0}")]
    Replay(ReplayReason),

    /// Handler exceeded the wrapper timeout
    #[error("Handler timed out after {0}ms")]
    Timeout(u64),

    /// A dependency failed in a way that is safe to retry
    #[error("Temporarily unavailable: {0}")]
    Unavailable(String),

    /// Storage failure
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Anything else; logged server-side, never returned verbatim
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why a bearer token was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    MissingHeader,
    InvalidFormat,
    InvalidToken,
    Expired,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::MissingHeader => "missing Authorization header",
            Self::InvalidFormat => "expected `Authorization: Bearer <token>`",
            Self::InvalidToken => "unknown token",
            Self::Expired => "token expired",
        };
        f.write_str(msg)
    }
}

/// Why a webhook delivery was treated as a possible replay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayReason {
    MissingSignature,
    BadSignature,
    MissingTimestamp,
    MalformedTimestamp,
    StaleTimestamp,
    FutureTimestamp,
}

impl fmt::Display for ReplayReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::MissingSignature => "signature header missing",
            Self::BadSignature => "signature mismatch",
            Self::MissingTimestamp => "timestamp missing",
            Self::MalformedTimestamp => "timestamp malformed",
            Self::StaleTimestamp => "timestamp too old",
            Self::FutureTimestamp => "timestamp in the future",
        };
        f.write_str(msg)
    }
}

/// Result type alias for guarded operations
pub type GuardResult<T> = std::result::Result<T, GuardError>;

impl GuardError {
    /// Create a validation error from a string
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        GuardError::Validation(msg.into())
    }

    /// Create an internal error from a string
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        GuardError::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication(_) | Self::Replay(_) => StatusCode::UNAUTHORIZED,
            Self::Authorization => StatusCode::FORBIDDEN,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::InvalidTransition { .. }
            | Self::ForbiddenTransition { .. }
            | Self::VersionConflict { .. } => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Timeout(_) | Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code; UI collaborators localize from this.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "UNAUTHORIZED",
            Self::Authorization | Self::ForbiddenTransition { .. } => "FORBIDDEN",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::MethodNotAllowed(_) => "METHOD_NOT_ALLOWED",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::VersionConflict { .. } => "VERSION_CONFLICT",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Replay(_) => "REPLAY_REJECTED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Unavailable(_) | Self::Store(StoreError::Unavailable(_)) => "UNAVAILABLE",
            Self::Store(_) | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to return to the caller.
    pub fn public_message(&self) -> String {
        match self {
            Self::Authentication(AuthFailure::MissingHeader) => "Authentication required".into(),
            Self::Authentication(AuthFailure::InvalidFormat) => {
                "Invalid Authorization format. Expected: Bearer <token>".into()
            }
            Self::Authentication(_) => "Invalid or expired token".into(),
            Self::Authorization => "Forbidden".into(),
            Self::Validation(msg) => msg.clone(),
            Self::NotFound => "Not found".into(),
            Self::MethodNotAllowed(method) => format!("Method {method} not allowed"),
            Self::InvalidTransition { from, to } => {
                format!("Cannot move a schedule from {from} to {to}")
            }
            Self::ForbiddenTransition { .. } => {
                "You don't have permission for this transition".into()
            }
            Self::VersionConflict { .. } => {
                "Resource was modified by another request; refetch and retry".into()
            }
            Self::RateLimited { retry_after, .. } => format!(
                "Too Many Requests. Retry after {} seconds.",
                retry_after.as_secs().max(1)
            ),
            Self::Replay(_) => "Invalid webhook signature".into(),
            Self::Timeout(_) | Self::Unavailable(_) | Self::Store(StoreError::Unavailable(_)) => {
                "Service temporarily unavailable; retry later".into()
            }
            Self::Store(_) | Self::Internal(_) => "Internal server error".into(),
        }
    }

    /// Extra structured fields for the error envelope.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::InvalidTransition { from, to } | Self::ForbiddenTransition { from, to, .. } => {
                Some(json!({ "from": from, "to": to }))
            }
            Self::VersionConflict { expected, current } => Some(json!({
                "expectedVersion": expected,
                "currentVersion": current,
            })),
            Self::RateLimited {
                retry_after,
                reset_at,
                limit,
            } => Some(json!({
                "retryAfter": retry_after.as_secs().max(1),
                "resetAt": reset_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                "limit": limit,
            })),
            _ => None,
        }
    }

    /// Whether the caller is expected to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. }
                | Self::RateLimited { .. }
                | Self::Timeout(_)
                | Self::Unavailable(_)
                | Self::Store(StoreError::Unavailable(_))
        )
    }

    /// 5xx errors are logged with full context and answered generically.
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    pub fn into_envelope(&self, request_id: &str) -> ApiEnvelope {
        ApiEnvelope {
            success: false,
            data: None,
            error: Some(self.public_message()),
            code: Some(self.code()),
            details: self.details(),
            request_id: request_id.to_string(),
        }
    }
}

/// JSON body of every wrapped response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub request_id: String,
}

impl ApiEnvelope {
    pub fn ok(data: serde_json::Value, request_id: &str) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
            details: None,
            request_id: request_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(
            GuardError::Authentication(AuthFailure::Expired).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(GuardError::Authorization.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(GuardError::validation("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            GuardError::Replay(ReplayReason::StaleTimestamp).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GuardError::VersionConflict {
                expected: 1,
                current: Some(2)
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            GuardError::internal("db exploded").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_conflict_codes_are_distinct() {
        let invalid = GuardError::InvalidTransition {
            from: ScheduleStatus::Waiting,
            to: ScheduleStatus::Completed,
        };
        let forbidden = GuardError::ForbiddenTransition {
            from: ScheduleStatus::Waiting,
            to: ScheduleStatus::Released,
            role: Role::Cleaner,
        };
        let conflict = GuardError::VersionConflict {
            expected: 1,
            current: Some(2),
        };
        assert_eq!(invalid.code(), "INVALID_TRANSITION");
        assert_eq!(forbidden.code(), "FORBIDDEN");
        assert_eq!(conflict.code(), "VERSION_CONFLICT");
    }

    #[test]
    fn test_internal_errors_do_not_leak() {
        let err = GuardError::internal("connection string postgres://admin:hunter2@db");
        assert_eq!(err.public_message(), "Internal server error");

        let err = GuardError::Store(StoreError::Corrupt("row 42 bad json".into()));
        assert!(!err.public_message().contains("row 42"));
    }

    #[test]
    fn test_forbidden_message_is_generic() {
        assert_eq!(GuardError::Authorization.public_message(), "Forbidden");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(GuardError::VersionConflict {
            expected: 3,
            current: None
        }
        .is_retryable());
        assert!(GuardError::Timeout(100).is_retryable());
        assert!(GuardError::Store(StoreError::Unavailable("down".into())).is_retryable());
        assert!(!GuardError::Authorization.is_retryable());
        assert!(!GuardError::validation("bad").is_retryable());
    }

    #[test]
    fn test_envelope_shape() {
        let err = GuardError::VersionConflict {
            expected: 1,
            current: Some(2),
        };
        let body = serde_json::to_value(err.into_envelope("req-9")).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "VERSION_CONFLICT");
        assert_eq!(body["requestId"], "req-9");
        assert_eq!(body["details"]["currentVersion"], 2);
        assert!(body.get("data").is_none());

        let ok = serde_json::to_value(ApiEnvelope::ok(json!({"a": 1}), "req-10")).unwrap();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["data"]["a"], 1);
        assert!(ok.get("error").is_none());
    }
}
