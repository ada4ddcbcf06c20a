//! Error types for sqlgate
//!
//! Every failure surfaces unchanged to the caller; the gate itself never
//! retries. The category tells the caller whether a retry makes sense:
//! - Retriable errors (connection, admission)
//! - Non-retriable errors (configuration, statement, type conversion)

use std::fmt;
use thiserror::Error;

/// Result type for sqlgate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid limit, unknown driver or malformed settings
    Configuration,
    /// Handle could not be established or is closed (retriable)
    Connection,
    /// Capacity could not be acquired (retriable)
    Admission,
    /// The transport rejected or failed the statement
    Statement,
    /// A value could not be converted
    TypeConversion,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Admission)
    }
}

/// Main error type for sqlgate
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Invalid configuration, detected before anything is opened
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Connection handle could not be established or was closed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Capacity acquisition failed
    #[error("admission error: {message}")]
    Admission { message: String },

    /// Statement or query failed in the transport
    #[error("statement error: {message}")]
    Statement {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A single-row query produced no row
    #[error("query returned no rows")]
    NoRows { sql: Option<String> },

    /// Type conversion failed
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Admission { .. } => ErrorCategory::Admission,
            Self::Statement { .. } | Self::NoRows { .. } => ErrorCategory::Statement,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
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

    /// Create an admission error
    pub fn admission(message: impl Into<String>) -> Self {
        Self::Admission {
            message: message.into(),
        }
    }

    /// Create a statement error
    pub fn statement(message: impl Into<String>) -> Self {
        Self::Statement {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a statement error carrying the failed SQL
    pub fn statement_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Statement {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// The SQL text attached to the error, if any
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Statement { sql, .. } | Self::NoRows { sql } => sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Connection => write!(f, "connection"),
            Self::Admission => write!(f, "admission"),
            Self::Statement => write!(f, "statement"),
            Self::TypeConversion => write!(f, "type_conversion"),
        }
    }
}
