//! Error types for the query engine.
//!
//! Every failure in the engine is a value of [`DbError`]. Variants map onto the
//! engine's error taxonomy; the helpers classify them for retry and pool
//! decisions, and carry a suggestion the caller can surface to users.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid connection URL: {reason}")]
    InvalidUrl { reason: String },

    #[error("A connection named '{name}' already exists")]
    DuplicateName { name: String },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Pool exhausted for connection '{connection_id}' after waiting {waited_ms}ms")]
    PoolExhausted {
        connection_id: String,
        waited_ms: u64,
    },

    #[error("Execution failed: {message}")]
    Execution {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Permission denied: {operation} - {reason}")]
    Permission { operation: String, reason: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create an invalid URL error.
    pub fn invalid_url(reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            reason: reason.into(),
        }
    }

    /// Create a duplicate name error.
    pub fn duplicate_name(name: impl Into<String>) -> Self {
        Self::DuplicateName { name: name.into() }
    }

    /// Create a not-found error for a registered connection.
    pub fn connection_not_found(key: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "Connection",
            key: key.into(),
        }
    }

    /// Create a not-found error for an arbitrary entity.
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a pool exhausted error.
    pub fn pool_exhausted(connection_id: impl Into<String>, waited: Duration) -> Self {
        Self::PoolExhausted {
            connection_id: connection_id.into(),
            waited_ms: waited.as_millis() as u64,
        }
    }

    /// Create an execution error with optional SQL state.
    pub fn execution(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Execution {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a permission error.
    pub fn permission(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permission {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Execution { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => {
                Some("Retry later or raise the per-connection session limit")
            }
            Self::Timeout { .. } => Some("Consider increasing the timeout or optimizing the query"),
            _ => None,
        }
    }

    /// Check if the caller may retry the operation with a fresh session.
    ///
    /// Only connection-class failures qualify. Timeouts and execution errors are
    /// never reported as retryable because re-running arbitrary SQL is unsafe.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Check if this error leaves the session that produced it unusable.
    pub fn is_connection_broken(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::Cancelled { .. }
        )
    }

    /// Check if this error is an interruption (deadline or caller cancel).
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Cancelled { .. })
    }
}

/// Driver errors: server-reported failures are `Execution`, transport and
/// session failures are `Connection`, decode problems are `Internal`.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;
        match err {
            E::Database(db_err) => DbError::execution(
                db_err.message(),
                db_err.code().map(|code| code.into_owned()),
                "Check the SQL syntax, referenced objects and permissions",
            ),
            E::RowNotFound => {
                DbError::execution("Statement returned no rows", None, "Check the query filters")
            }
            E::TypeNotFound { type_name } => DbError::execution(
                format!("Unknown type '{}'", type_name),
                None,
                "Check the types referenced by the query",
            ),
            E::ColumnNotFound(column) => DbError::execution(
                format!("Unknown column '{}'", column),
                None,
                "Check the column names referenced by the query",
            ),
            E::Configuration(source) => DbError::connection(
                source.to_string(),
                "Check the connection URL and its options",
            ),
            E::Io(source) => DbError::connection(
                format!("I/O failure: {}", source),
                "Check that the database server is reachable",
            ),
            E::Tls(source) => DbError::connection(
                format!("TLS failure: {}", source),
                "Check the server certificate and TLS settings",
            ),
            E::Protocol(detail) => DbError::connection(
                format!("Protocol violation: {}", detail),
                "Check that the server version is supported",
            ),
            E::PoolTimedOut | E::PoolClosed | E::WorkerCrashed => DbError::connection(
                err.to_string(),
                "Retry with a fresh session",
            ),
            E::ColumnIndexOutOfBounds { .. } | E::ColumnDecode { .. } | E::Decode(_) => {
                DbError::internal(format!("Could not decode result: {}", err))
            }
            other => DbError::internal(format!("Driver error: {}", other)),
        }
    }
}

/// Result type alias for engine operations.
pub type DbResult<T> = Result<T, DbError>;
