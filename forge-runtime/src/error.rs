//! Error Types for the Forge Runtime
//!
//! This module defines error handling for the request path, including:
//! - ApiError struct carried through handlers
//! - ErrorCode enum for categorizing errors
//! - IntoResponse implementation rendering the response envelope
//!
//! The response layer here is the only place an error kind becomes an
//! HTTP status; handlers either map lower-level failures to a kind or
//! let the conversions below do it. Internals never leak into the
//! user-visible message field.

use crate::envelope::{ApiMessage, Envelope};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
///
/// Each code maps to one HTTP status and names a category of failure.
/// The string form (SCREAMING_SNAKE_CASE) appears in the envelope's
/// `messages` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Authentication / authorization (401, 403)
    // ========================================================================
    /// Request lacks credentials on a route that requires them
    AuthRequired,

    /// Credentials are present but invalid or malformed
    AuthInvalid,

    /// Authentication token has expired
    TokenExpired,

    /// Authenticated but not permitted
    AccessDenied,

    // ========================================================================
    // Validation (400)
    // ========================================================================
    /// Request body or field constraint violated
    InvalidInput,

    /// Filter references an unknown or non-filterable field
    InvalidFilter,

    /// Sort references an unknown or non-sortable field
    InvalidSort,

    /// Cursor is not decodable or does not match the view's sort shape
    InvalidCursor,

    /// A required `param.*` value is missing
    MissingParam,

    /// Limit outside the accepted range
    InvalidLimit,

    // ========================================================================
    // Not found (404)
    // ========================================================================
    /// Route or row does not exist (or is policy-hidden)
    NotFound,

    // ========================================================================
    // Rule violation (422)
    // ========================================================================
    /// A business rule rejected the mutation; the envelope carries the
    /// rule's declared message code
    RuleViolation,

    // ========================================================================
    // System (500)
    // ========================================================================
    /// Database unreachable or pool exhausted
    DatabaseUnavailable,

    /// Job queue is full or shut down
    QueueFull,

    /// Anything unexpected
    InternalError,
}

impl ErrorCode {
    /// HTTP status for this code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::AuthRequired | ErrorCode::AuthInvalid | ErrorCode::TokenExpired => {
                StatusCode::UNAUTHORIZED
            }
            ErrorCode::AccessDenied => StatusCode::FORBIDDEN,
            ErrorCode::InvalidInput
            | ErrorCode::InvalidFilter
            | ErrorCode::InvalidSort
            | ErrorCode::InvalidCursor
            | ErrorCode::MissingParam
            | ErrorCode::InvalidLimit => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::RuleViolation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::DatabaseUnavailable | ErrorCode::QueueFull | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable envelope code string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::AuthInvalid => "AUTH_INVALID",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::AccessDenied => "ACCESS_DENIED",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::InvalidFilter => "INVALID_FILTER",
            ErrorCode::InvalidSort => "INVALID_SORT",
            ErrorCode::InvalidCursor => "INVALID_CURSOR",
            ErrorCode::MissingParam => "MISSING_PARAM",
            ErrorCode::InvalidLimit => "INVALID_LIMIT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::RuleViolation => "RULE_VIOLATION",
            ErrorCode::DatabaseUnavailable => "DATABASE_UNAVAILABLE",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Default user-visible message for this code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "Authentication required",
            ErrorCode::AuthInvalid => "Invalid credentials",
            ErrorCode::TokenExpired => "Authentication token has expired",
            ErrorCode::AccessDenied => "Access denied",
            ErrorCode::InvalidInput => "Invalid input",
            ErrorCode::InvalidFilter => "Invalid filter field",
            ErrorCode::InvalidSort => "Invalid sort field",
            ErrorCode::InvalidCursor => "Invalid pagination cursor",
            ErrorCode::MissingParam => "Missing required parameter",
            ErrorCode::InvalidLimit => "Limit must be between 1 and 100",
            ErrorCode::NotFound => "Not found",
            ErrorCode::RuleViolation => "A business rule rejected this change",
            ErrorCode::DatabaseUnavailable => "Service temporarily unavailable",
            ErrorCode::QueueFull => "Service temporarily unavailable",
            ErrorCode::InternalError => "Internal server error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error carried through the request pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    /// Category of the failure.
    pub code: ErrorCode,

    /// Code surfaced in the envelope. Defaults to the ErrorCode string;
    /// rule violations override it with the rule's declared message
    /// code (e.g. `TICKET_CLOSED`).
    pub message_code: String,

    /// Optional human-readable message.
    pub message: Option<String>,
}

impl ApiError {
    /// Create an error with the code's default message code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message_code: code.as_str().to_string(),
            message: Some(message.into()),
        }
    }

    /// Create an error carrying only the code.
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code,
            message_code: code.as_str().to_string(),
            message: None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    // ========================================================================
    // Convenience constructors
    // ========================================================================

    pub fn auth_required() -> Self {
        Self::from_code(ErrorCode::AuthRequired)
    }

    pub fn auth_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthInvalid, message)
    }

    pub fn token_expired() -> Self {
        Self::from_code(ErrorCode::TokenExpired)
    }

    pub fn access_denied() -> Self {
        Self::from_code(ErrorCode::AccessDenied)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn invalid_filter(field: &str) -> Self {
        Self::new(
            ErrorCode::InvalidFilter,
            format!("Field '{}' is not filterable", field),
        )
    }

    pub fn invalid_sort(field: &str) -> Self {
        Self::new(
            ErrorCode::InvalidSort,
            format!("Field '{}' is not sortable", field),
        )
    }

    pub fn invalid_cursor() -> Self {
        Self::from_code(ErrorCode::InvalidCursor)
    }

    pub fn missing_param(name: &str) -> Self {
        Self::new(
            ErrorCode::MissingParam,
            format!("Missing required parameter '{}'", name),
        )
    }

    pub fn invalid_limit() -> Self {
        Self::from_code(ErrorCode::InvalidLimit)
    }

    pub fn not_found() -> Self {
        Self::from_code(ErrorCode::NotFound)
    }

    /// Rule violation carrying the rule's declared message code.
    pub fn rule_violation(message_code: impl Into<String>, text: Option<String>) -> Self {
        Self {
            code: ErrorCode::RuleViolation,
            message_code: message_code.into(),
            message: text,
        }
    }

    pub fn queue_full() -> Self {
        Self::from_code(ErrorCode::QueueFull)
    }

    pub fn database_unavailable() -> Self {
        Self::from_code(ErrorCode::DatabaseUnavailable)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        // The message is logged by the conversion sites; the envelope
        // gets the generic text.
        Self {
            code: ErrorCode::InternalError,
            message_code: ErrorCode::InternalError.as_str().to_string(),
            message: Some(message.into()),
        }
    }

    /// The envelope message for this error.
    pub fn to_message(&self) -> ApiMessage {
        let text = match self.code {
            // Never leak internals.
            ErrorCode::InternalError | ErrorCode::DatabaseUnavailable | ErrorCode::QueueFull => {
                self.code.default_message().to_string()
            }
            _ => self
                .message
                .clone()
                .unwrap_or_else(|| self.code.default_message().to_string()),
        };
        ApiMessage {
            code: self.message_code.clone(),
            level: "error".to_string(),
            message: Some(text),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message_code)?;
        if let Some(message) = &self.message {
            write!(f, " ({})", message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body: Envelope<serde_json::Value> = Envelope::error(vec![self.to_message()]);
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// CONVERSIONS FROM LOWER-LEVEL ERRORS
// ============================================================================

impl From<tokio_postgres::Error> for ApiError {
    fn from(err: tokio_postgres::Error) -> Self {
        tracing::error!(error = ?err, "Database error");
        ApiError::database_unavailable()
    }
}

impl From<deadpool_postgres::PoolError> for ApiError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        tracing::error!(error = ?err, "Connection pool error");
        ApiError::database_unavailable()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::invalid_input(format!("Invalid JSON: {}", err))
    }
}

impl From<uuid::Error> for ApiError {
    fn from(_: uuid::Error) -> Self {
        ApiError::invalid_input("Invalid UUID")
    }
}

/// Result type alias for the runtime.
pub type ApiResult<T> = Result<T, ApiError>;
