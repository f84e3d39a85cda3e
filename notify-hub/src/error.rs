//! Hub-wide error types.
//!
//! [`Error`] is what the hub's public operations return. [`PlatformError`] is the
//! classified, per-target failure that adapters report and that ends up inside
//! [`PlatformResult`](crate::receipt::PlatformResult)s.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hub-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Hub-wide error type.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Platform already registered: {0}")]
    DuplicateName(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Queue is closed")]
    QueueClosed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Delivery failed for message {message_id}: {failed} of {total} targets failed")]
    DeliveryFailed {
        message_id: String,
        failed: usize,
        total: usize,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Error category, when the error maps onto the delivery taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::Configuration(_) | Self::Serialization(_) => {
                ErrorCategory::Validation
            }
            Self::Platform(e) => e.category,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::NotFound { .. } => ErrorCategory::PlatformUnavailable,
            _ => ErrorCategory::Internal,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Delivery error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad message or target shape.
    Validation,
    /// Adapter missing or unhealthy.
    PlatformUnavailable,
    /// Transient I/O failure.
    Network,
    /// The platform did not answer in time.
    Timeout,
    /// The platform signaled throttling.
    RateLimited,
    /// Credential or signature failure.
    Auth,
    /// Delivery was cancelled before it could complete.
    Cancelled,
    /// Panics and anything an adapter could not classify.
    Internal,
}

impl ErrorCategory {
    /// Whether a failure of this category may succeed on a later attempt.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::PlatformUnavailable | Self::Network | Self::Timeout | Self::RateLimited
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::PlatformUnavailable => "platform_unavailable",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Auth => "auth",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A classified failure for one delivery attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{category}: {message}")]
pub struct PlatformError {
    /// Failure classification.
    pub category: ErrorCategory,
    /// Human-readable detail.
    pub message: String,
    /// Platform-supplied retry hint, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl PlatformError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::PlatformUnavailable, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            category: ErrorCategory::RateLimited,
            message: message.into(),
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Auth, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, message)
    }

    /// Platform-supplied retry hint.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_categories() {
        assert!(ErrorCategory::Network.is_transient());
        assert!(ErrorCategory::Timeout.is_transient());
        assert!(ErrorCategory::RateLimited.is_transient());
        assert!(ErrorCategory::PlatformUnavailable.is_transient());
        assert!(!ErrorCategory::Validation.is_transient());
        assert!(!ErrorCategory::Auth.is_transient());
        assert!(!ErrorCategory::Internal.is_transient());
        assert!(!ErrorCategory::Cancelled.is_transient());
    }

    #[test]
    fn test_rate_limited_keeps_hint() {
        let err = PlatformError::rate_limited("slow down", Some(Duration::from_secs(2)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(err.to_string(), "rate_limited: slow down");
    }

    #[test]
    fn test_error_category_mapping() {
        assert_eq!(
            Error::validation("empty").category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            Error::from(PlatformError::auth("bad token")).category(),
            ErrorCategory::Auth
        );
        assert_eq!(Error::Cancelled.category(), ErrorCategory::Cancelled);
    }
}
