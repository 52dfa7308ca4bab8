//! Error handling for Vitrine Core.
//!
//! This module provides:
//! - Structured error types with context and chaining
//! - HTTP status code mapping for API responses
//! - Machine-readable error codes
//! - Retryability classification driving the upstream retry loop
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use vitrine_core::error::{VitrineError, Result, ErrorContext};
//!
//! fn my_function() -> Result<()> {
//!     some_operation().context("Failed to perform operation")?;
//!     Ok(())
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Vitrine operations.
pub type Result<T> = std::result::Result<T, VitrineError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by clients for programmatic
/// error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Upstream commerce API (1000-1099)
    /// Upstream call exceeded its per-call timeout.
    UpstreamTimeout,
    /// Network-level failure or 5xx from the upstream.
    UpstreamUnavailable,
    /// Upstream returned 4xx; the request itself was malformed.
    UpstreamRejected,

    // Cache (2000-2099)
    CacheUnavailable,
    CacheError,

    // Catalog (3000-3099)
    CategoryResolutionFailed,
    NormalizationFailed,

    // Serialization (4000-4099)
    SerializationError,
    DeserializationError,

    // Validation (5000-5099)
    ValidationError,
    InvalidInput,

    // Configuration (6000-6099)
    ConfigurationError,

    // Internal (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            // 4xx from upstream mirrors as 502 unless a concrete status was
            // attached to the error (see `VitrineError::http_status`).
            Self::UpstreamRejected => StatusCode::BAD_GATEWAY,

            Self::CacheUnavailable | Self::CacheError => StatusCode::SERVICE_UNAVAILABLE,

            Self::CategoryResolutionFailed | Self::NormalizationFailed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }

            Self::SerializationError | Self::DeserializationError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }

            Self::ValidationError | Self::InvalidInput => StatusCode::UNPROCESSABLE_ENTITY,

            Self::ConfigurationError | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Drives the upstream retry loop: only transient failures (timeouts,
    /// connection resets, 5xx) are retried. 4xx responses indicate a malformed
    /// request and retrying would only repeat the rejection.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTimeout
                | Self::UpstreamUnavailable
                | Self::CacheUnavailable
                | Self::CacheError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self {
            Self::UpstreamTimeout | Self::UpstreamUnavailable | Self::UpstreamRejected => {
                "upstream"
            }
            Self::CacheUnavailable | Self::CacheError => "cache",
            Self::CategoryResolutionFailed | Self::NormalizationFailed => "catalog",
            Self::SerializationError | Self::DeserializationError => "serialization",
            Self::ValidationError | Self::InvalidInput => "validation",
            Self::ConfigurationError => "configuration",
            Self::InternalError => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// User errors (bad input, validation failures)
    Low,
    /// Operational issues (upstream hiccups, per-branch resolution failures)
    Medium,
    /// System errors (serialization bugs, configuration problems)
    High,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError | ErrorCode::InvalidInput => Self::Low,

            ErrorCode::UpstreamTimeout
            | ErrorCode::UpstreamUnavailable
            | ErrorCode::UpstreamRejected
            | ErrorCode::CacheUnavailable
            | ErrorCode::CacheError
            | ErrorCode::CategoryResolutionFailed
            | ErrorCode::NormalizationFailed => Self::Medium,

            ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::InternalError => Self::High,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Vitrine Core.
///
/// Supports structured error codes for API responses, error chaining, a
/// user-facing message distinct from the internal one, and an optional
/// mirrored upstream HTTP status for `UpstreamRejected` errors.
#[derive(Error, Debug)]
pub struct VitrineError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// HTTP status reported by the upstream, when one exists
    upstream_status: Option<u16>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for VitrineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl VitrineError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            upstream_status: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create an upstream-rejection error mirroring the upstream status.
    pub fn upstream_rejected(status: u16, body: impl Into<String>) -> Self {
        let mut error = Self::with_internal(
            ErrorCode::UpstreamRejected,
            "The upstream commerce API rejected the request",
            body,
        );
        error.upstream_status = Some(status);
        error
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the HTTP status reported by the upstream (if any).
    pub fn upstream_status(&self) -> Option<u16> {
        self.upstream_status
    }

    /// Get the HTTP status code for the API response.
    ///
    /// `UpstreamRejected` mirrors the concrete upstream status when one was
    /// recorded; everything else maps through the code table.
    pub fn http_status(&self) -> StatusCode {
        if self.code == ErrorCode::UpstreamRejected {
            if let Some(status) = self.upstream_status {
                if let Ok(status) = StatusCode::from_u16(status) {
                    return status;
                }
            }
        }
        self.code.http_status()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    /// Record error metrics.
    fn record_metrics(&self) {
        counter!(
            "vitrine_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.code.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Whether the request was successful (always false for errors)
    pub success: bool,

    /// Error information
    pub error: ErrorInfo,
}

/// Detailed error information for API responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// User-friendly error message
    pub message: String,

    /// Upstream HTTP status, when the failure originated upstream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&VitrineError> for ErrorResponse {
    fn from(error: &VitrineError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                message: error.user_message.to_string(),
                upstream_status: error.upstream_status,
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for VitrineError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| VitrineError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| VitrineError::new(code, e.to_string()).with_source(e))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for VitrineError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::CacheUnavailable, "Unable to connect to cache")
        } else if error.is_timeout() {
            (ErrorCode::CacheError, "Cache operation timed out")
        } else {
            (ErrorCode::CacheError, "A cache error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for VitrineError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Serialization failed", error.to_string()).with_source(error)
    }
}

impl From<reqwest::Error> for VitrineError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::with_internal(
                ErrorCode::UpstreamTimeout,
                "The upstream commerce API timed out",
                error.to_string(),
            )
            .with_source(error);
        }

        if let Some(status) = error.status() {
            if status.is_client_error() {
                return Self::upstream_rejected(status.as_u16(), error.to_string())
                    .with_source(error);
            }
        }

        Self::with_internal(
            ErrorCode::UpstreamUnavailable,
            "The upstream commerce API is unavailable",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
