//! Error types for the tiered cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tiered cache
///
/// Payloads are plain strings so the error is `Clone`: a single in-flight
/// fetch hands the same outcome to every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Caller-supplied fetcher failed
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// Persistent store (durable substrate) error
    #[error("Persistent store error: {0}")]
    Store(String),

    // =========================================================================
    // Query Errors
    // =========================================================================
    /// Data-store query failed
    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    /// A query inside a fail-fast batch failed
    #[error("Batch query {id} failed: {reason}")]
    BatchQueryFailed { id: String, reason: String },

    /// A queued query was dropped before it produced a result
    #[error("Batched query cancelled: {0}")]
    BatchCancelled(String),

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// TTL would produce an entry that is already expired
    #[error("Invalid TTL: {0}")]
    InvalidTtl(String),

    /// Invalidation pattern is not a valid regular expression
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Self {
        Error::InvalidPattern(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(format!("I/O error: {}", e))
    }
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Error::Internal(format!("metrics registry: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::BatchQueryFailed {
            id: "q1".to_string(),
            reason: "timeout".to_string(),
        };
        assert_eq!(err.to_string(), "Batch query q1 failed: timeout");
        assert_eq!(
            Error::Fetch("boom".to_string()).to_string(),
            "Fetch failed: boom"
        );
    }

    #[test]
    fn test_regex_error_conversion() {
        let err: Error = regex::Regex::new("(").unwrap_err().into();
        assert!(matches!(err, Error::InvalidPattern(_)));
    }

    #[test]
    fn test_error_is_clone() {
        let err = Error::Store("down".to_string());
        assert_eq!(err.clone(), err);
    }
}
