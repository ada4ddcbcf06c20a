//! Testing utilities
//!
//! An in-memory driver for exercising a gate without a database server.
//! Clones of a [`MockDriver`] share state, so a test keeps one clone for
//! inspection while the gate owns another.
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlgate::testing::MockDriver;
//!
//! let driver = MockDriver::new().with_latency(Duration::from_millis(10));
//! let gate = AdmissionGate::with_factory(
//!     GateConfig::new("mock", "mock://localhost/db", 4),
//!     Arc::new(driver.clone()),
//! )
//! .await?;
//!
//! gate.execute("INSERT INTO test DEFAULT VALUES", &[]).await?;
//! assert!(driver.peak_executing() <= 3);
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, DatabaseType, ExecResult, RowStream,
    VecRowStream,
};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

#[derive(Debug)]
struct MockState {
    latency: Mutex<Duration>,
    refuse: AtomicBool,
    fail_pattern: Mutex<Option<String>>,
    rows: Mutex<Vec<Row>>,
    reserved: AtomicU32,
    connects: AtomicUsize,
    executing: AtomicUsize,
    peak: AtomicUsize,
    statements: AtomicUsize,
    last_insert_id: AtomicU64,
}

/// In-memory driver that records how it is used
#[derive(Debug, Clone)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Create a driver that accepts everything instantly
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                latency: Mutex::new(Duration::ZERO),
                refuse: AtomicBool::new(false),
                fail_pattern: Mutex::new(None),
                rows: Mutex::new(Vec::new()),
                reserved: AtomicU32::new(1),
                connects: AtomicUsize::new(0),
                executing: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                statements: AtomicUsize::new(0),
                last_insert_id: AtomicU64::new(0),
            }),
        }
    }

    /// Make every statement take this long
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock() = latency;
        self
    }

    /// Rows returned by every query
    pub fn with_rows(self, rows: Vec<Row>) -> Self {
        *self.state.rows.lock() = rows;
        self
    }

    /// Connections the simulated server withholds from the limit
    pub fn with_reserved_connections(self, reserved: u32) -> Self {
        self.state.reserved.store(reserved, Ordering::Relaxed);
        self
    }

    /// Refuse new connections, as an unreachable server would
    pub fn refuse_connections(self) -> Self {
        self.state.refuse.store(true, Ordering::Relaxed);
        self
    }

    /// Fail statements whose SQL contains `pattern`
    pub fn fail_statements_containing(self, pattern: impl Into<String>) -> Self {
        *self.state.fail_pattern.lock() = Some(pattern.into());
        self
    }

    /// Physical connections opened so far
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Statements currently running
    pub fn executing(&self) -> usize {
        self.state.executing.load(Ordering::SeqCst)
    }

    /// Highest number of statements ever running at once
    pub fn peak_executing(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    /// Statements that ran to completion, successful or not
    pub fn statements(&self) -> usize {
        self.state.statements.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for MockDriver {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        if self.state.refuse.load(Ordering::Relaxed) {
            return Err(Error::connection(format!(
                "connection refused: {}",
                crate::connection::redact_url(&config.url)
            )));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Unknown
    }

    fn reserved_connections(&self) -> u32 {
        self.state.reserved.load(Ordering::Relaxed)
    }
}

/// Tracks one running statement; decrements on every exit path
struct Running<'a>(&'a MockState);

impl<'a> Running<'a> {
    fn enter(state: &'a MockState) -> Self {
        let now = state.executing.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.executing.fetch_sub(1, Ordering::SeqCst);
        self.0.statements.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connection opened by [`MockDriver`]
pub struct MockConnection {
    state: Arc<MockState>,
    closed: AtomicBool,
}

impl MockConnection {
    async fn run(&self, sql: &str) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::connection("connection is closed"));
        }

        let _running = Running::enter(&self.state);
        let latency = *self.state.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        } else {
            tokio::task::yield_now().await;
        }

        let fail = self
            .state
            .fail_pattern
            .lock()
            .as_deref()
            .is_some_and(|p| sql.contains(p));
        if fail {
            return Err(Error::statement_with_sql("injected failure", sql));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<ExecResult> {
        self.run(sql).await?;
        let id = self.state.last_insert_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: Some(id),
        })
    }

    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Pin<Box<dyn RowStream>>> {
        self.run(sql).await?;
        let rows = self.state.rows.lock().clone();
        Ok(Box::pin(VecRowStream::new(rows)))
    }

    async fn is_valid(&self) -> bool {
        !self.closed.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}
