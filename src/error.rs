//! Error types for the multi-level cache engine

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Cache Path Errors
    // =========================================================================
    /// The stampede guard could not acquire the load lock in time
    #[error("Timed out after {wait:?} waiting for lock {lock_name}")]
    LockTimeout { lock_name: String, wait: Duration },

    /// The shared L2 store rejected or failed a call
    #[error("Remote store unavailable: {0}")]
    RemoteStoreUnavailable(String),

    /// The caller-supplied loader failed
    #[error("Value loader failed: {0}")]
    Loader(#[source] anyhow::Error),

    /// One chunk of a batch operation failed; earlier chunks stay committed
    #[error(
        "Batch {operation} failed at chunk {chunk_index} ({committed_chunks} chunk(s) committed): {source}"
    )]
    BatchPartialFailure {
        operation: &'static str,
        chunk_index: usize,
        committed_chunks: usize,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Sync Errors
    // =========================================================================
    /// Publishing a cache event failed
    #[error("Event publish failed: {0}")]
    EventPublish(String),

    /// Handling an inbound cache event failed
    #[error("Event handler failed: {0}")]
    EventHandler(String),

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// JSON encode/decode error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Redis client error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Metric registration or encoding error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::LockTimeout { .. } | Error::RemoteStoreUnavailable(_) => true,
            Error::BatchPartialFailure { source, .. } => source.is_retryable(),
            #[cfg(feature = "redis")]
            Error::Redis(e) => e.is_timeout() || e.is_connection_dropped(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_is_retryable() {
        let err = Error::LockTimeout {
            lock_name: "users:42".to_string(),
            wait: Duration::from_millis(100),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("users:42"));
    }

    #[test]
    fn test_loader_error_keeps_source() {
        let err = Error::Loader(anyhow::anyhow!("db down"));
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Value loader failed: db down");
    }

    #[test]
    fn test_batch_failure_reports_chunk() {
        let err = Error::BatchPartialFailure {
            operation: "put_all",
            chunk_index: 2,
            committed_chunks: 2,
            source: Box::new(Error::RemoteStoreUnavailable("timeout".into())),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("chunk 2"));
    }
}
