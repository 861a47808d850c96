//! Error types for pgprobe
//!
//! Failures are classified so callers can tell connectivity problems apart
//! from server-side rejections:
//! - Transport-level faults (refused, reset, timed out)
//! - Authentication failures reported by the server
//! - Statement failures (bad SQL, missing table, constraint violations)
//! - Local misconfiguration (bad DSN, bad identifiers)

use std::fmt;
use thiserror::Error;

/// Result type for pgprobe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Transport-level connection faults
    Connection,
    /// Server rejected the credentials
    Authentication,
    /// Statement execution failed
    Query,
    /// Transaction control failed or was misused
    Transaction,
    /// Constraint violation reported by the server
    Constraint,
    /// Missing table or column
    Schema,
    /// Operation exceeded its deadline
    Timeout,
    /// Invalid local configuration
    Configuration,
    /// Everything else
    Other,
}

impl ErrorCategory {
    /// Whether a failure of this category could succeed on a fresh attempt
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Authentication => write!(f, "authentication"),
            Self::Query => write!(f, "query"),
            Self::Transaction => write!(f, "transaction"),
            Self::Constraint => write!(f, "constraint"),
            Self::Schema => write!(f, "schema"),
            Self::Timeout => write!(f, "timeout"),
            Self::Configuration => write!(f, "configuration"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Main error type for pgprobe
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Could not reach the server or the connection dropped
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Server rejected the login
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// Statement failed on the server
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transaction control failure (including autocommit misuse)
    #[error("transaction error: {message}")]
    Transaction { message: String },

    /// Constraint violation (PK, FK, unique, check)
    #[error("constraint violation: {constraint}: {message}")]
    Constraint { constraint: String, message: String },

    /// Missing table, column or other schema object
    #[error("schema error: {message}")]
    Schema { message: String },

    /// Deadline exceeded
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Bad DSN, bad identifier, out-of-range value
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Bug territory
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Constraint { .. } => ErrorCategory::Constraint,
            Self::Schema { .. } => ErrorCategory::Schema,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Attach the offending SQL to a query error, leave other variants alone
    pub fn with_sql(self, sql: impl Into<String>) -> Self {
        match self {
            Self::Query {
                message,
                sql: None,
                source,
            } => Self::Query {
                message,
                sql: Some(sql.into()),
                source,
            },
            other => other,
        }
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        // SQLSTATE class drives the classification: 28 authentication,
        // 42 schema/syntax, 23 constraint, 25 transaction state.
        let server = err.as_db_error().map(|db| {
            (
                db.code().code().to_string(),
                db.message().to_string(),
                db.constraint().map(str::to_string),
            )
        });
        match server {
            Some((code, message, constraint)) => match code.get(..2).unwrap_or("") {
                "28" => Self::Authentication { message },
                "42" => Self::Schema { message },
                "23" => Self::Constraint {
                    constraint: constraint.unwrap_or_else(|| "unknown".to_string()),
                    message,
                },
                "25" => Self::Transaction { message },
                _ => Self::Query {
                    message,
                    sql: None,
                    source: Some(Box::new(err)),
                },
            },
            None if err.is_closed() => Self::Connection {
                message: "connection closed".to_string(),
                source: Some(Box::new(err)),
            },
            None => Self::Connection {
                message: err.to_string(),
                source: Some(Box::new(err)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_retriable() {
        assert!(ErrorCategory::Connection.is_retriable());
        assert!(ErrorCategory::Timeout.is_retriable());

        assert!(!ErrorCategory::Authentication.is_retriable());
        assert!(!ErrorCategory::Query.is_retriable());
        assert!(!ErrorCategory::Schema.is_retriable());
        assert!(!ErrorCategory::Configuration.is_retriable());
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(Error::connection("refused").is_retriable());
        assert!(Error::timeout("connect deadline").is_retriable());

        assert!(!Error::query("syntax error").is_retriable());
        assert!(!Error::config("bad dsn").is_retriable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::connection("connection refused");
        assert!(err.to_string().contains("connection refused"));

        let err = Error::Authentication {
            message: "password authentication failed".into(),
        };
        assert!(err.to_string().starts_with("authentication failed"));
    }

    #[test]
    fn test_with_sql_fills_query_variant_only() {
        let err = Error::query("relation does not exist").with_sql("SELECT * FROM missing");
        match err {
            Error::Query { sql, .. } => assert_eq!(sql.as_deref(), Some("SELECT * FROM missing")),
            other => panic!("unexpected variant: {other:?}"),
        }

        let err = Error::timeout("deadline").with_sql("SELECT 1");
        assert_eq!(err.category(), ErrorCategory::Timeout);
    }

    #[test]
    fn test_category_display_is_lowercase() {
        assert_eq!(ErrorCategory::Authentication.to_string(), "authentication");
        assert_eq!(ErrorCategory::Schema.to_string(), "schema");
    }
}
