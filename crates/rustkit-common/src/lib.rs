//! # RustKit Common
//!
//! Shared plumbing for the RustKit service worker stack.
//!
//! ## Features
//!
//! - Unified error type for storage, configuration and scheduling failures
//! - Logging configuration and setup
//! - Exponential backoff and timeout helpers
//! - A strictly serial operation queue
//! - Serde helpers for configuration types

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod queue;
pub mod retry;
pub mod serde_helpers;

pub use logging::{init_logging, try_init_test_logging, LogConfig, LogFormat};
pub use queue::OperationQueue;
pub use retry::{with_timeout, BackoffPolicy};

/// Unified error type for RustKit.
#[derive(Error, Debug)]
pub enum RustKitError {
    /// Persistent storage failures.
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Cancelled operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl RustKitError {
    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error with source.
    pub fn storage_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether this is a missing-resource error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RustKitError::NotFound(_))
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RustKitError::Storage { .. } | RustKitError::Timeout(_)
        )
    }

    /// Get the error category for metrics.
    pub fn category(&self) -> &'static str {
        match self {
            RustKitError::Storage { .. } => "storage",
            RustKitError::Config { .. } => "config",
            RustKitError::Timeout(_) => "timeout",
            RustKitError::Cancelled => "cancelled",
            RustKitError::NotFound(_) => "not_found",
            RustKitError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

/// Result type alias for RustKit operations.
pub type Result<T> = std::result::Result<T, RustKitError>;

/// Extension trait for Option.
pub trait OptionExt<T> {
    /// Convert None to a NotFound error.
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| RustKitError::NotFound(resource.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(RustKitError::storage("disk full").category(), "storage");
        assert_eq!(RustKitError::config("bad json").category(), "config");
        assert_eq!(
            RustKitError::Timeout(Duration::from_secs(1)).category(),
            "timeout"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(RustKitError::storage("test").is_retryable());
        assert!(RustKitError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!RustKitError::config("test").is_retryable());
        assert!(!RustKitError::Cancelled.is_retryable());
    }

    #[test]
    fn test_not_found() {
        assert!(RustKitError::NotFound("registration 4".into()).is_not_found());
        assert!(!RustKitError::storage("io").is_not_found());
    }

    #[test]
    fn test_option_ext() {
        let some: Option<i32> = Some(42);
        assert_eq!(some.ok_or_not_found("test").unwrap(), 42);

        let none: Option<i32> = None;
        assert!(matches!(
            none.ok_or_not_found("test"),
            Err(RustKitError::NotFound(_))
        ));
    }
}
