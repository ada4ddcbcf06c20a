//! Unit tests for sqlgate error module

use sqlgate::error::{Error, ErrorCategory};

#[test]
fn test_error_connection() {
    let err = Error::connection("Failed to connect");

    assert_eq!(err.category(), ErrorCategory::Connection);
    assert!(err.to_string().contains("Failed to connect"));
    assert!(err.is_retriable());
}

#[test]
fn test_error_config() {
    let err = Error::config("max_connections must be at least 1");

    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(err.to_string().contains("max_connections"));
    assert!(!err.is_retriable());
}

#[test]
fn test_error_admission() {
    let err = Error::admission("timed out waiting for capacity");

    assert_eq!(err.category(), ErrorCategory::Admission);
    assert!(err.is_retriable());
}

#[test]
fn test_error_statement_carries_sql() {
    let err = Error::statement_with_sql("syntax error", "SELEC 1");

    assert_eq!(err.category(), ErrorCategory::Statement);
    assert_eq!(err.sql(), Some("SELEC 1"));
    assert!(!err.is_retriable());

    assert_eq!(Error::statement("failed").sql(), None);
}

#[test]
fn test_error_no_rows() {
    let err = Error::NoRows {
        sql: Some("SELECT 1 WHERE false".into()),
    };

    assert_eq!(err.category(), ErrorCategory::Statement);
    assert_eq!(err.sql(), Some("SELECT 1 WHERE false"));
    assert_eq!(err.to_string(), "query returned no rows");
}

#[test]
fn test_error_with_source() {
    let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
    let err = Error::connection_with_source("failed to connect", io);

    let source = std::error::Error::source(&err).unwrap();
    assert!(source.to_string().contains("refused"));
}

#[test]
fn test_error_category_display() {
    assert_eq!(ErrorCategory::Configuration.to_string(), "configuration");
    assert_eq!(ErrorCategory::Admission.to_string(), "admission");
    assert_eq!(ErrorCategory::TypeConversion.to_string(), "type_conversion");
}

#[test]
fn test_error_category_retriable() {
    assert!(ErrorCategory::Connection.is_retriable());
    assert!(ErrorCategory::Admission.is_retriable());
    assert!(!ErrorCategory::Configuration.is_retriable());
    assert!(!ErrorCategory::Statement.is_retriable());
    assert!(!ErrorCategory::TypeConversion.is_retriable());
}
