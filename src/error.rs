//! Error types for mongo-stage-sync.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mongo-stage-sync operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
        /// Source error if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// PostgreSQL connection error
    #[error("PostgreSQL connection error: {message}")]
    PostgresConnection {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// PostgreSQL query error
    #[error("PostgreSQL query error on table '{table}': {message}")]
    PostgresQuery {
        /// Table name
        table: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<tokio_postgres::Error>,
    },

    /// Source (MongoDB) connection error
    #[error("Source connection error: {message}")]
    SourceConnection {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<mongodb::error::Error>,
    },

    /// Source (MongoDB) query error
    #[error("Source query error on collection '{collection}': {message}")]
    SourceQuery {
        /// Collection name
        collection: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<mongodb::error::Error>,
    },

    /// Schema error
    #[error("Schema error: {message}")]
    Schema {
        /// Error message
        message: String,
        /// Underlying database error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error. The sanitizer is total, so this indicates a bug.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transformation script error
    #[error("Transform script '{script}' failed: {message}")]
    Transform {
        /// Script name
        script: String,
        /// Error message
        message: String,
    },

    /// A network call exceeded its deadline
    #[error("{operation} timed out after {}", format_duration(.after))]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Configured deadline
        after: Duration,
    },

    /// Retry exhausted
    #[error("Operation failed after {attempts} attempts: {message}")]
    RetryExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error message
        message: String,
        /// Last error encountered
        #[source]
        last_error: Option<Box<Error>>,
    },

    /// Cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source.
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a PostgreSQL connection error.
    pub fn postgres_connection(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::PostgresConnection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a PostgreSQL query error.
    pub fn postgres_query(
        table: impl Into<String>,
        message: impl Into<String>,
        source: tokio_postgres::Error,
    ) -> Self {
        Self::PostgresQuery {
            table: table.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a source connection error.
    pub fn source_connection(message: impl Into<String>, source: mongodb::error::Error) -> Self {
        Self::SourceConnection {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a source query error.
    pub fn source_query(
        collection: impl Into<String>,
        message: impl Into<String>,
        source: Option<mongodb::error::Error>,
    ) -> Self {
        Self::SourceQuery {
            collection: collection.into(),
            message: message.into(),
            source,
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            source: None,
        }
    }

    /// Create a schema error caused by a failed statement.
    pub fn schema_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Schema {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a serialization error.
    pub fn serialization(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transform script error.
    pub fn transform(script: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transform {
            script: script.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Query failures are included because a failed batch is rolled back in
    /// full and replaying it is safe.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PostgresConnection { .. }
                | Error::PostgresQuery { .. }
                | Error::SourceConnection { .. }
                | Error::SourceQuery { .. }
                | Error::Timeout { .. }
                | Error::Io(_)
        )
    }

    /// Get the error code for metrics/logging.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "CONFIG_ERROR",
            Error::PostgresConnection { .. } => "PG_CONNECTION_ERROR",
            Error::PostgresQuery { .. } => "PG_QUERY_ERROR",
            Error::SourceConnection { .. } => "SOURCE_CONNECTION_ERROR",
            Error::SourceQuery { .. } => "SOURCE_QUERY_ERROR",
            Error::Schema { .. } => "SCHEMA_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Serialization { .. } => "SERIALIZATION_ERROR",
            Error::Transform { .. } => "TRANSFORM_ERROR",
            Error::Timeout { .. } => "TIMEOUT",
            Error::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Error::Cancelled => "CANCELLED",
            Error::Io(_) => "IO_ERROR",
        }
    }
}

fn format_duration(after: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*after)
}

/// Run a future under a deadline, mapping expiry to [`Error::Timeout`].
pub async fn with_timeout<T, F>(operation: &str, after: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(operation, after)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::config("test").code(), "CONFIG_ERROR");
        assert_eq!(Error::validation("test").code(), "VALIDATION_ERROR");
        assert_eq!(Error::schema("test").code(), "SCHEMA_ERROR");
        assert_eq!(Error::transform("mart", "boom").code(), "TRANSFORM_ERROR");
    }

    #[test]
    fn test_schema_error_keeps_cause() {
        use std::error::Error as _;

        let cause = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no CREATE on schema");
        let err = Error::schema_with_source("DDL failed in staging", cause);
        assert_eq!(err.code(), "SCHEMA_ERROR");
        assert_eq!(
            err.source().map(|e| e.to_string()),
            Some("no CREATE on schema".to_string())
        );
        assert!(Error::schema("bare").source().is_none());
    }

    #[test]
    fn test_retryable() {
        assert!(!Error::config("test").is_retryable());
        assert!(!Error::validation("test").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(Error::timeout("fetch", Duration::from_secs(30)).is_retryable());
        assert!(Error::source_query("ads", "cursor died", None).is_retryable());
    }

    #[test]
    fn test_timeout_message() {
        let err = Error::timeout("fetch ads", Duration::from_secs(30));
        assert_eq!(err.to_string(), "fetch ads timed out after 30s");
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<()> = with_timeout("sleepy", Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[test]
    fn test_with_timeout_passes_result_through() {
        let result = tokio_test::block_on(with_timeout("quick", Duration::from_secs(1), async {
            Err::<(), _>(Error::Cancelled)
        }));
        assert_eq!(result.unwrap_err().code(), "CANCELLED");
    }
}
