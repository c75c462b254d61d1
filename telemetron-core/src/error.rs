/*!
Error types for the Telemetron core engine.
*/

use std::path::PathBuf;
use telemetron_retry::RetryableError;
use thiserror::Error;

use crate::metric::MetricKind;

/// Result type used throughout the Telemetron core.
pub type Result<T> = std::result::Result<T, TelemetronError>;

/// Validation failures for a single metric.
///
/// These are always permanent: retrying the same input can never succeed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("metric id must not be empty")]
    EmptyId,

    #[error("unknown metric kind: '{0}'")]
    UnknownKind(String),

    #[error("gauge metric '{0}' is missing its value")]
    MissingValue(String),

    #[error("counter metric '{0}' is missing its delta")]
    MissingDelta(String),

    #[error("gauge metric '{0}' must not carry a delta")]
    UnexpectedDelta(String),

    #[error("counter metric '{0}' must not carry a value")]
    UnexpectedValue(String),

    #[error("kind mismatch for metric '{id}': expected {expected}, found {found}")]
    KindMismatch {
        id: String,
        expected: MetricKind,
        found: MetricKind,
    },

    #[error("id mismatch: '{left}' cannot be merged into '{right}'")]
    IdMismatch { left: String, right: String },

    #[error("counter '{0}' overflowed")]
    DeltaOverflow(String),

    #[error("invalid {kind} scalar: '{raw}'")]
    InvalidScalar { kind: MetricKind, raw: String },

    #[error("gauge metric '{0}' must be a finite number")]
    NonFiniteValue(String),
}

/// Errors raised by storage backends.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The metric failed validation or could not be merged
    #[error("Invalid metric: {0}")]
    Validation(#[from] MetricError),

    /// I/O failure on the backing file
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The backing file exists but is not a valid metrics document
    #[error("Malformed metrics document {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Metrics could not be encoded for writing
    #[error("Failed to encode metrics: {0}")]
    Encode(#[source] serde_json::Error),

    /// Relational database failure
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A writer panicked while holding the store lock
    #[error("Storage lock poisoned")]
    Poisoned,

    /// A blocking storage task could not be joined
    #[error("Storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true for client-side validation failures
    pub fn is_validation(&self) -> bool {
        matches!(self, StoreError::Validation(_))
    }
}

impl RetryableError for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Io { source, .. } => source.kind() == std::io::ErrorKind::ResourceBusy,
            #[cfg(feature = "postgres")]
            StoreError::Database(err) => is_connection_error(err),
            _ => false,
        }
    }
}

/// Connectivity failures: socket errors, pool exhaustion and SQLSTATE class 08.
#[cfg(feature = "postgres")]
fn is_connection_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| code.starts_with("08")),
        _ => false,
    }
}

/// Errors that can occur in the core outside the storage layer.
#[derive(Error, Debug)]
pub enum TelemetronError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Request signing errors
    #[error("Signature error: {0}")]
    Signature(String),

    /// Metric validation errors
    #[error("Validation error: {0}")]
    Metric(#[from] MetricError),

    /// Storage backend errors
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Logging or metrics registry setup failed
    #[error("Observability error: {0}")]
    Observability(String),
}

impl TelemetronError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new signature error
    pub fn signature<S: Into<String>>(msg: S) -> Self {
        Self::Signature(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new observability error
    pub fn observability<S: Into<String>>(msg: S) -> Self {
        Self::Observability(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let error = TelemetronError::config("missing address");
        assert_eq!(error.to_string(), "Configuration error: missing address");

        let error = TelemetronError::compression("truncated stream");
        assert_eq!(error.to_string(), "Compression error: truncated stream");

        let error = StoreError::Validation(MetricError::EmptyId);
        assert_eq!(error.to_string(), "Invalid metric: metric id must not be empty");
    }

    #[test]
    fn test_busy_file_is_transient() {
        let busy = StoreError::io(
            "/tmp/metrics.json",
            io::Error::new(io::ErrorKind::ResourceBusy, "busy"),
        );
        assert!(busy.is_transient());

        let denied = StoreError::io(
            "/tmp/metrics.json",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(denied.is_permanent());
    }

    #[test]
    fn test_validation_is_permanent() {
        let err = StoreError::from(MetricError::UnknownKind("histogram".to_string()));
        assert!(err.is_permanent());
        assert!(err.is_validation());
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(StoreError::Database(sqlx::Error::RowNotFound).is_permanent());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<TelemetronError>();
        assert_sync::<TelemetronError>();
        assert_send::<StoreError>();
        assert_sync::<StoreError>();
    }
}
