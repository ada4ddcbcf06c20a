//! # sqlgate
//!
//! Concurrency-admission gate for a shared database connection handle.
//!
//! Database servers cap how many clients may connect at once and reject new
//! connections once that cap is reached. `sqlgate` lets any number of tasks
//! issue statements through one handle while keeping the number of
//! simultaneously running operations below the server's cap.
//!
//! ## Features
//!
//! - **Admission Control**: FIFO counting gate, one unit per running operation
//! - **Rejection-Threshold Correction**: withholds the one connection a
//!   server refuses to hand out, overridable per gate
//! - **Bounded or Unbounded Waits**: wait forever, time out, or fail fast
//! - **Immediate or Graceful Shutdown**: close now or drain in-flight work first
//! - **Lazy Results**: query rows are read after the gate has released the unit
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sqlgate::prelude::*;
//! use std::sync::Arc;
//!
//! // The server is configured with max_connections = 4
//! let gate = Arc::new(AdmissionGate::connect("postgres", "postgres://localhost/db", 4).await?);
//! assert_eq!(gate.capacity(), 3);
//!
//! let outcome = gate.execute("INSERT INTO test DEFAULT VALUES", &[]).await?;
//! let row = gate
//!     .query_one("SELECT id FROM test WHERE id = $1", &[Value::Int64(1)])
//!     .await?
//!     .get()
//!     .await?;
//!
//! gate.close_graceful(Duration::from_secs(5)).await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL support via tokio-postgres (default)
//! - `mysql` - MySQL/MariaDB support via mysql_async
//! - `full` - All backends enabled

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod gate;
pub mod handle;
pub mod testing;
pub mod types;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, ErrorCategory, Result};

    pub use crate::types::{Row, Value};

    pub use crate::connection::{
        Connection, ConnectionConfig, ConnectionFactory, DatabaseType, ExecResult, RowStream,
        Rows, SingleRow,
    };

    pub use crate::config::GateConfig;
    pub use crate::driver::DriverRegistry;
    pub use crate::gate::{admission_capacity, AdmissionGate, AtomicGateStats, GateStats};
    pub use crate::handle::{ConnectionHandle, HandleConfig, HandleStats};
}

pub use error::{Error, Result};
pub use gate::AdmissionGate;
pub use types::Value;

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _value = Value::Int32(42);
        let _config = GateConfig::new("postgres", "postgres://localhost/test", 4);
        let _handle = HandleConfig::default();
        let _outcome = ExecResult::affected(1);
    }

    #[test]
    fn test_error_types() {
        let err = Error::connection("test error");
        assert!(err.is_retriable());
        assert_eq!(err.category(), ErrorCategory::Connection);
    }
}
