//! Shared connection handle for sqlgate
//!
//! The handle multiplexes statements over a set of physical connections:
//! - Idle connections are reused LIFO
//! - A new physical connection is opened whenever none is idle
//! - Expired or broken connections are discarded instead of reused
//!
//! The handle does not bound how many physical connections it opens. Bounding
//! is the job of the [`AdmissionGate`](crate::gate::AdmissionGate) in front of
//! it, which never lets more operations through than the server accepts.

use serde::Deserialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{
    redact_url, Connection, ConnectionConfig, ConnectionFactory, DatabaseType, ExecResult,
    RowStream,
};
use crate::error::{Error, ErrorCategory, Result};
use crate::types::Value;

/// Handle configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandleConfig {
    /// Connections opened eagerly when the handle is created
    pub min_idle: usize,
    /// Maximum idle connections kept for reuse
    pub max_idle: usize,
    /// Maximum connection lifetime in milliseconds (0 = unlimited)
    pub max_lifetime_ms: u64,
    /// Idle connections unused for longer are closed (0 = never)
    pub idle_timeout_ms: u64,
    /// Whether to validate idle connections before reuse
    pub test_on_borrow: bool,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            min_idle: 1,
            max_idle: 2,
            max_lifetime_ms: 1_800_000, // 30 minutes
            idle_timeout_ms: 600_000,   // 10 minutes
            test_on_borrow: false,
        }
    }
}

impl HandleConfig {
    /// Set connections opened eagerly
    pub fn with_min_idle(mut self, size: usize) -> Self {
        self.min_idle = size;
        self
    }

    /// Set maximum idle connections kept
    pub fn with_max_idle(mut self, size: usize) -> Self {
        self.max_idle = size;
        self
    }

    /// Set maximum connection lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime_ms = lifetime.as_millis() as u64;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable/disable validation before reuse
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }
}

/// Handle statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleStats {
    /// Physical connections opened
    pub connections_opened: u64,
    /// Physical connections closed or discarded
    pub connections_closed: u64,
    /// Checkouts served from the idle list
    pub reused: u64,
    /// Idle connections that failed validation
    pub health_check_failures: u64,
}

/// Atomic handle stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicHandleStats {
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
    pub reused: AtomicU64,
    pub health_check_failures: AtomicU64,
}

impl AtomicHandleStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection being opened
    pub fn record_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection being closed
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an idle connection being reused
    pub fn record_reused(&self) {
        self.reused.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed validation
    pub fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> HandleStats {
        HandleStats {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }
}

struct HandleEntry {
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
    open: Arc<AtomicUsize>,
}

impl HandleEntry {
    fn new(conn: Box<dyn Connection>, open: &Arc<AtomicUsize>) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used: now,
            open: Arc::clone(open),
        }
    }
}

// Runs on every exit path, including cancelled operations
impl Drop for HandleEntry {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::Release);
    }
}

/// Shared handle to the database, owned by one gate
pub struct ConnectionHandle {
    connection: ConnectionConfig,
    config: HandleConfig,
    factory: Arc<dyn ConnectionFactory>,
    /// Idle connections (LIFO for better cache locality)
    idle: Mutex<Vec<HandleEntry>>,
    open: Arc<AtomicUsize>,
    stats: AtomicHandleStats,
    closed: AtomicBool,
}

impl ConnectionHandle {
    /// Open the handle.
    ///
    /// `min_idle` connections are opened eagerly so an unreachable server or a
    /// malformed connection string fails here rather than on first use.
    pub async fn open(
        factory: Arc<dyn ConnectionFactory>,
        connection: ConnectionConfig,
        config: HandleConfig,
    ) -> Result<Self> {
        let handle = Self {
            idle: Mutex::new(Vec::with_capacity(config.max_idle)),
            connection,
            config,
            factory,
            open: Arc::new(AtomicUsize::new(0)),
            stats: AtomicHandleStats::new(),
            closed: AtomicBool::new(false),
        };

        {
            let mut idle = handle.idle.lock().await;
            for _ in 0..handle.config.min_idle {
                let conn = handle.connect().await?;
                idle.push(HandleEntry::new(conn, &handle.open));
            }
        }

        debug!(
            url = %redact_url(&handle.connection.url),
            database = %handle.factory.database_type(),
            eager = handle.config.min_idle,
            "opened connection handle"
        );
        Ok(handle)
    }

    /// Database type served by this handle
    pub fn database_type(&self) -> DatabaseType {
        self.factory.database_type()
    }

    /// Connection configuration
    pub fn connection_config(&self) -> &ConnectionConfig {
        &self.connection
    }

    /// Physical connections currently open (idle or busy)
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    /// Handle statistics
    pub fn stats(&self) -> HandleStats {
        self.stats.snapshot()
    }

    /// Whether the handle has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Execute a statement on some physical connection
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        let entry = self.checkout().await?;
        let result = entry.conn.execute(sql, params).await;
        self.checkin(entry, result.as_ref().err()).await;
        result
    }

    /// Issue a query on some physical connection
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Pin<Box<dyn RowStream>>> {
        let entry = self.checkout().await?;
        let result = entry.conn.query(sql, params).await;
        self.checkin(entry, result.as_ref().err()).await;
        result
    }

    /// Close the handle.
    ///
    /// Idle connections are closed now; busy ones are closed when their
    /// operation hands them back. Later operations fail with a connection
    /// error.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut idle = self.idle.lock().await;
        for entry in idle.drain(..) {
            self.discard(entry).await;
        }

        info!(
            url = %redact_url(&self.connection.url),
            still_open = self.open_connections(),
            "closed connection handle"
        );
        Ok(())
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let timeout = Duration::from_millis(self.connection.connect_timeout_ms);
        let conn = tokio::time::timeout(timeout, self.factory.connect(&self.connection))
            .await
            .map_err(|_| {
                Error::connection(format!(
                    "timed out connecting after {}ms",
                    self.connection.connect_timeout_ms
                ))
            })??;
        self.open.fetch_add(1, Ordering::Release);
        self.stats.record_opened();
        Ok(conn)
    }

    fn should_recycle(&self, entry: &HandleEntry) -> bool {
        let expired = self.config.max_lifetime_ms > 0
            && entry.created_at.elapsed() > Duration::from_millis(self.config.max_lifetime_ms);
        let stale = self.config.idle_timeout_ms > 0
            && entry.last_used.elapsed() > Duration::from_millis(self.config.idle_timeout_ms);
        expired || stale
    }

    async fn checkout(&self) -> Result<HandleEntry> {
        if self.is_closed() {
            return Err(Error::connection("connection handle is closed"));
        }

        loop {
            let entry = self.idle.lock().await.pop();
            let Some(entry) = entry else { break };

            if self.should_recycle(&entry) {
                self.discard(entry).await;
                continue;
            }
            if self.config.test_on_borrow && !entry.conn.is_valid().await {
                self.stats.record_health_check_failure();
                self.discard(entry).await;
                continue;
            }
            self.stats.record_reused();
            return Ok(entry);
        }

        let conn = self.connect().await?;
        Ok(HandleEntry::new(conn, &self.open))
    }

    async fn checkin(&self, mut entry: HandleEntry, error: Option<&Error>) {
        let broken = error.is_some_and(|e| e.category() == ErrorCategory::Connection);
        if broken || self.is_closed() {
            self.discard(entry).await;
            return;
        }

        entry.last_used = Instant::now();
        let mut idle = self.idle.lock().await;
        // close() drains under this lock, so a flag seen here is final
        if !self.is_closed() && idle.len() < self.config.max_idle && !self.should_recycle(&entry)
        {
            idle.push(entry);
        } else {
            drop(idle);
            self.discard(entry).await;
        }
    }

    async fn discard(&self, entry: HandleEntry) {
        if let Err(e) = entry.conn.close().await {
            warn!(error = %e, "failed to close connection");
        }
        self.stats.record_closed();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection", &self.connection)
            .field("config", &self.config)
            .field("database_type", &self.factory.database_type())
            .field("open", &self.open_connections())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDriver;

    async fn open(driver: &MockDriver, config: HandleConfig) -> ConnectionHandle {
        ConnectionHandle::open(
            Arc::new(driver.clone()),
            ConnectionConfig::new("mock://localhost/test"),
            config,
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_handle_config_builder() {
        let config = HandleConfig::default()
            .with_min_idle(0)
            .with_max_idle(8)
            .with_max_lifetime(Duration::from_secs(60))
            .with_idle_timeout(Duration::from_secs(5))
            .with_test_on_borrow(true);

        assert_eq!(config.min_idle, 0);
        assert_eq!(config.max_idle, 8);
        assert_eq!(config.max_lifetime_ms, 60_000);
        assert_eq!(config.idle_timeout_ms, 5_000);
        assert!(config.test_on_borrow);
    }

    #[tokio::test]
    async fn test_open_is_eager() {
        let driver = MockDriver::new();
        let handle = open(&driver, HandleConfig::default().with_min_idle(2)).await;

        assert_eq!(handle.open_connections(), 2);
        assert_eq!(driver.connects(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_operation_is_not_counted_open() {
        let driver = MockDriver::new().with_latency(Duration::from_millis(200));
        let handle = open(&driver, HandleConfig::default().with_min_idle(0)).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            handle.execute("UPDATE t SET x = 1", &[]),
        )
        .await;

        assert!(cancelled.is_err());
        assert_eq!(driver.connects(), 1);
        assert_eq!(handle.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_open_fails_when_unreachable() {
        let driver = MockDriver::new().refuse_connections();
        let result = ConnectionHandle::open(
            Arc::new(driver),
            ConnectionConfig::new("mock://nowhere/test"),
            HandleConfig::default(),
        )
        .await;

        assert!(matches!(result, Err(Error::Connection { .. })));
    }

    #[tokio::test]
    async fn test_idle_connection_is_reused() {
        let driver = MockDriver::new();
        let handle = open(&driver, HandleConfig::default()).await;

        handle.execute("UPDATE t SET x = 1", &[]).await.unwrap();
        handle.execute("UPDATE t SET x = 2", &[]).await.unwrap();

        assert_eq!(driver.connects(), 1);
        assert_eq!(handle.stats().reused, 2);
    }

    #[tokio::test]
    async fn test_failed_statement_keeps_connection() {
        let driver = MockDriver::new().fail_statements_containing("BOOM");
        let handle = open(&driver, HandleConfig::default()).await;

        let err = handle.execute("BOOM", &[]).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Statement);
        assert_eq!(handle.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_excess_idle_connections_are_closed() {
        let driver = MockDriver::new().with_latency(Duration::from_millis(20));
        let handle = open(&driver, HandleConfig::default().with_min_idle(0).with_max_idle(1)).await;

        let (a, b) = tokio::join!(
            handle.execute("UPDATE a", &[]),
            handle.execute("UPDATE b", &[])
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(driver.connects(), 2);
        assert_eq!(handle.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_closed_handle_rejects_operations() {
        let driver = MockDriver::new();
        let handle = open(&driver, HandleConfig::default()).await;

        handle.close().await.unwrap();
        handle.close().await.unwrap();

        assert!(handle.is_closed());
        assert_eq!(handle.open_connections(), 0);
        let err = handle.execute("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[tokio::test]
    async fn test_busy_connection_closed_after_handle_close() {
        let driver = MockDriver::new().with_latency(Duration::from_millis(50));
        let handle = open(&driver, HandleConfig::default().with_min_idle(0)).await;

        let (result, closed) = tokio::join!(handle.execute("UPDATE t SET x = 1", &[]), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.close().await
        });
        result.unwrap();
        closed.unwrap();

        assert_eq!(driver.connects(), 1);
        assert_eq!(handle.open_connections(), 0);
        assert_eq!(handle.stats().connections_closed, 1);
    }
}
