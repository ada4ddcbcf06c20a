//! Admission gate for sqlgate
//!
//! Bounds how many operations run against the shared connection handle at
//! once, so the client never drives the server past its connection cap.
//!
//! The server rejects a client once `max_connections` is *reached*, not once
//! that many are busy: with `max_connections = 4` only 3 may be active. The
//! gate therefore starts with `limit - reserved` units. `reserved` is 1 for
//! every bundled driver; the configuration can override it for servers that
//! admit exactly `max_connections` clients.
//!
//! Every operation moves through *pending → admitted → executing → released*.
//! The unit is released on every exit path, including failures and
//! cancellation, before the result reaches the caller.
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlgate::prelude::*;
//!
//! let gate = Arc::new(AdmissionGate::connect("postgres", "postgres://localhost/db", 4).await?);
//!
//! let outcome = gate.execute("INSERT INTO test DEFAULT VALUES", &[]).await?;
//! let mut rows = gate.query("SELECT id FROM test", &[]).await?;
//! while let Some(row) = rows.next().await? {
//!     println!("{:?}", row.get(0));
//! }
//! gate.close().await?;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore, SemaphorePermit, TryAcquireError};
use tracing::{debug, info, trace, warn};

use crate::config::GateConfig;
use crate::connection::{redact_url, ConnectionFactory, ExecResult, Rows, SingleRow};
use crate::driver::DriverRegistry;
use crate::error::{Error, Result};
use crate::handle::ConnectionHandle;
use crate::types::Value;

/// Units available for a server limit once `reserved` connections are
/// withheld.
///
/// Saturates at zero: a limit of 1 yields a gate that admits
/// nothing until it is closed.
pub fn admission_capacity(max_connections: i64, reserved: u32) -> Result<usize> {
    if max_connections < 1 {
        return Err(Error::config(format!(
            "max_connections must be at least 1, got {}",
            max_connections
        )));
    }
    let capacity = max_connections.saturating_sub(i64::from(reserved)).max(0) as u64;
    if capacity > Semaphore::MAX_PERMITS as u64 {
        return Err(Error::config(format!(
            "max_connections {} exceeds the supported maximum",
            max_connections
        )));
    }
    Ok(capacity as usize)
}

/// Gate statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateStats {
    /// Operations admitted
    pub admissions: u64,
    /// Admitted operations that succeeded
    pub completions: u64,
    /// Admitted operations whose statement failed
    pub failures: u64,
    /// Acquisitions that timed out or found no capacity
    pub rejections: u64,
    /// Total time spent waiting for capacity (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Highest number of operations admitted at once
    pub peak_in_flight: u64,
}

/// Atomic gate stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicGateStats {
    pub admissions: AtomicU64,
    pub completions: AtomicU64,
    pub failures: AtomicU64,
    pub rejections: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
    pub peak_in_flight: AtomicU64,
}

impl AtomicGateStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an admission and the concurrency it produced
    pub fn record_admission(&self, wait_time_ms: u64, in_flight: usize) {
        self.admissions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
        self.peak_in_flight
            .fetch_max(in_flight as u64, Ordering::Relaxed);
    }

    /// Record the outcome of an admitted operation
    pub fn record_outcome(&self, ok: bool) {
        if ok {
            self.completions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a rejected acquisition
    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> GateStats {
        GateStats {
            admissions: self.admissions.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
        }
    }

    /// Calculate average wait time in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        let admissions = self.admissions.load(Ordering::Relaxed);
        if admissions == 0 {
            0.0
        } else {
            self.total_wait_time_ms.load(Ordering::Relaxed) as f64 / admissions as f64
        }
    }
}

/// One admitted operation. Dropping it releases the capacity unit.
struct Admission<'a> {
    gate: &'a AdmissionGate,
    _permit: SemaphorePermit<'a>,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        let remaining = self.gate.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            self.gate.drained.notify_waiters();
        }
        trace!(in_flight = remaining, "released capacity unit");
    }
}

/// Concurrency-admission gate in front of a shared connection handle.
///
/// Share it between tasks with an `Arc`. Callers beyond the capacity wait in
/// FIFO order; nothing is ever refused for lack of capacity unless an acquire
/// timeout is configured or [`try_execute`](Self::try_execute) is used.
pub struct AdmissionGate {
    handle: ConnectionHandle,
    /// Sole admission state: one permit per capacity unit
    semaphore: Semaphore,
    capacity: usize,
    max_connections: i64,
    reserved: u32,
    acquire_timeout: Option<Duration>,
    in_flight: AtomicUsize,
    drained: Notify,
    closed: AtomicBool,
    stats: AtomicGateStats,
}

impl AdmissionGate {
    /// Open a gate for `driver` with the default driver registry.
    ///
    /// Fails with a configuration error for a limit below 1 or an unknown
    /// driver, and with a connection error when the server is unreachable.
    pub async fn connect(driver: &str, url: &str, max_connections: i64) -> Result<Self> {
        Self::from_config(GateConfig::new(driver, url, max_connections)).await
    }

    /// Open a gate from a configuration with the default driver registry
    pub async fn from_config(config: GateConfig) -> Result<Self> {
        Self::with_registry(config, &DriverRegistry::with_defaults()).await
    }

    /// Open a gate, resolving the driver through `registry`
    pub async fn with_registry(config: GateConfig, registry: &DriverRegistry) -> Result<Self> {
        config.validate()?;
        let factory = registry.get(&config.driver)?;
        Self::with_factory(config, factory).await
    }

    /// Open a gate over an explicit connection factory
    pub async fn with_factory(
        config: GateConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let reserved = config
            .reserved_connections
            .unwrap_or_else(|| factory.reserved_connections());
        let capacity = admission_capacity(config.max_connections, reserved)?;
        let acquire_timeout = config.acquire_timeout();
        let url = redact_url(&config.connection.url);

        // Never hold more connections open up front than may ever be admitted
        let mut handle_config = config.handle;
        handle_config.min_idle = handle_config.min_idle.min(capacity);
        let handle = ConnectionHandle::open(factory, config.connection, handle_config).await?;

        if capacity == 0 {
            warn!(
                url = %url,
                max_connections = config.max_connections,
                reserved,
                "gate capacity is zero; every operation waits until the gate is closed"
            );
        }
        info!(
            url = %url,
            driver = %config.driver,
            max_connections = config.max_connections,
            capacity,
            "admission gate opened"
        );

        Ok(Self {
            handle,
            semaphore: Semaphore::new(capacity),
            capacity,
            max_connections: config.max_connections,
            reserved,
            acquire_timeout,
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            closed: AtomicBool::new(false),
            stats: AtomicGateStats::new(),
        })
    }

    /// Execute a statement that returns no rows
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        let admission = self.admit(self.acquire_timeout).await?;
        self.run_execute(admission, sql, params).await
    }

    /// Like [`execute`](Self::execute), waiting at most `timeout` for capacity
    pub async fn execute_within(
        &self,
        sql: &str,
        params: &[Value],
        timeout: Duration,
    ) -> Result<ExecResult> {
        let admission = self.admit(Some(timeout)).await?;
        self.run_execute(admission, sql, params).await
    }

    /// Like [`execute`](Self::execute), failing at once when no unit is free
    pub async fn try_execute(&self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        let admission = self.try_admit()?;
        self.run_execute(admission, sql, params).await
    }

    /// Issue a query and return its rows.
    ///
    /// The unit is released as soon as the query has been issued. Reading the
    /// returned [`Rows`] happens outside admission, so the gate bounds
    /// concurrent query issuance rather than result consumption.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Rows> {
        let admission = self.admit(self.acquire_timeout).await?;
        self.run_query(admission, sql, params).await
    }

    /// Like [`query`](Self::query), waiting at most `timeout` for capacity
    pub async fn query_within(
        &self,
        sql: &str,
        params: &[Value],
        timeout: Duration,
    ) -> Result<Rows> {
        let admission = self.admit(Some(timeout)).await?;
        self.run_query(admission, sql, params).await
    }

    /// Issue a query whose first row is of interest.
    ///
    /// Never fails because the query matched nothing; that is reported when
    /// the [`SingleRow`] is read.
    pub async fn query_one(&self, sql: &str, params: &[Value]) -> Result<SingleRow> {
        self.query(sql, params).await.map(SingleRow::new)
    }

    /// Like [`query_one`](Self::query_one), waiting at most `timeout` for capacity
    pub async fn query_one_within(
        &self,
        sql: &str,
        params: &[Value],
        timeout: Duration,
    ) -> Result<SingleRow> {
        self.query_within(sql, params, timeout)
            .await
            .map(SingleRow::new)
    }

    /// Close the gate immediately.
    ///
    /// Callers waiting for capacity are woken with a connection error, and so
    /// is every later call. Operations already executing get no completion
    /// guarantee: their transport calls fail once the handle is gone.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.semaphore.close();
        info!(in_flight = self.in_flight(), "admission gate closed");
        self.handle.close().await
    }

    /// Stop admitting, wait for admitted operations to finish, then close.
    ///
    /// The handle is closed even when `timeout` expires first; the timeout is
    /// then reported as an admission error.
    pub async fn close_graceful(&self, timeout: Duration) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let drained = tokio::time::timeout(timeout, self.wait_drained())
            .await
            .is_ok();
        let remaining = self.in_flight();

        self.close().await?;

        if !drained {
            warn!(
                in_flight = remaining,
                timeout_ms = timeout.as_millis() as u64,
                "gate closed before admitted operations finished"
            );
            return Err(Error::admission(format!(
                "{} operations still in flight after {}ms",
                remaining,
                timeout.as_millis()
            )));
        }
        Ok(())
    }

    /// Capacity units the gate was built with
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Server limit the gate was configured for
    pub fn max_connections(&self) -> i64 {
        self.max_connections
    }

    /// Connections withheld from the server limit
    pub fn reserved_connections(&self) -> u32 {
        self.reserved
    }

    /// Units currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Operations currently admitted
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Gate statistics
    pub fn stats(&self) -> GateStats {
        self.stats.snapshot()
    }

    /// Average time callers waited for capacity
    pub fn avg_wait_time_ms(&self) -> f64 {
        self.stats.avg_wait_time_ms()
    }

    /// The underlying connection handle
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Whether the gate has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::connection("admission gate is closed"));
        }
        Ok(())
    }

    async fn admit(&self, timeout: Option<Duration>) -> Result<Admission<'_>> {
        self.ensure_open()?;
        let start = Instant::now();

        if self.semaphore.available_permits() == 0 {
            debug!(
                in_flight = self.in_flight(),
                capacity = self.capacity,
                "waiting for capacity"
            );
        }

        let acquired = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.semaphore.acquire())
                .await
                .map_err(|_| {
                    self.stats.record_rejection();
                    Error::admission(format!(
                        "timed out waiting for capacity ({}ms)",
                        limit.as_millis()
                    ))
                })?,
            None => self.semaphore.acquire().await,
        };
        let permit = acquired
            .map_err(|_| Error::connection("admission gate closed while waiting for capacity"))?;

        self.admitted(permit, start)
    }

    fn try_admit(&self) -> Result<Admission<'_>> {
        self.ensure_open()?;
        match self.semaphore.try_acquire() {
            Ok(permit) => self.admitted(permit, Instant::now()),
            Err(TryAcquireError::NoPermits) => {
                self.stats.record_rejection();
                Err(Error::admission(format!(
                    "no capacity available ({} of {} in flight)",
                    self.in_flight(),
                    self.capacity
                )))
            }
            Err(TryAcquireError::Closed) => Err(Error::connection("admission gate is closed")),
        }
    }

    fn admitted<'a>(
        &'a self,
        permit: SemaphorePermit<'a>,
        start: Instant,
    ) -> Result<Admission<'a>> {
        // Count first, then re-check: a graceful close that misses this
        // increment is guaranteed to see it.
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let admission = Admission {
            gate: self,
            _permit: permit,
        };
        self.ensure_open()?;

        self.stats
            .record_admission(start.elapsed().as_millis() as u64, in_flight);
        trace!(in_flight, "admitted");
        Ok(admission)
    }

    async fn run_execute(
        &self,
        admission: Admission<'_>,
        sql: &str,
        params: &[Value],
    ) -> Result<ExecResult> {
        let result = self.handle.execute(sql, params).await;
        self.stats.record_outcome(result.is_ok());
        drop(admission);
        result
    }

    async fn run_query(
        &self,
        admission: Admission<'_>,
        sql: &str,
        params: &[Value],
    ) -> Result<Rows> {
        let result = self.handle.query(sql, params).await;
        self.stats.record_outcome(result.is_ok());
        drop(admission);
        result.map(|stream| Rows::new(stream, sql))
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("handle", &self.handle)
            .field("capacity", &self.capacity)
            .field("max_connections", &self.max_connections)
            .field("reserved", &self.reserved)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::testing::MockDriver;

    async fn gate(driver: &MockDriver, max_connections: i64) -> AdmissionGate {
        AdmissionGate::with_factory(
            GateConfig::new("mock", "mock://localhost/test", max_connections),
            Arc::new(driver.clone()),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_admission_capacity() {
        assert_eq!(admission_capacity(4, 1).unwrap(), 3);
        assert_eq!(admission_capacity(1, 1).unwrap(), 0);
        assert_eq!(admission_capacity(4, 0).unwrap(), 4);
        assert_eq!(admission_capacity(2, 5).unwrap(), 0);
        assert!(admission_capacity(0, 1).is_err());
        assert!(admission_capacity(-3, 1).is_err());
        assert!(admission_capacity(i64::MAX, 0).is_err());
    }

    #[test]
    fn test_atomic_gate_stats() {
        let stats = AtomicGateStats::new();

        stats.record_admission(10, 1);
        stats.record_admission(30, 3);
        stats.record_admission(20, 2);
        stats.record_outcome(true);
        stats.record_outcome(false);
        stats.record_rejection();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.admissions, 3);
        assert_eq!(snapshot.completions, 1);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.rejections, 1);
        assert_eq!(snapshot.total_wait_time_ms, 60);
        assert_eq!(snapshot.peak_in_flight, 3);
        assert!((stats.avg_wait_time_ms() - 20.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_capacity_withholds_reserved() {
        let driver = MockDriver::new();
        let gate = gate(&driver, 4).await;

        assert_eq!(gate.capacity(), 3);
        assert_eq!(gate.available(), 3);
        assert_eq!(gate.reserved_connections(), 1);
        assert_eq!(gate.max_connections(), 4);
    }

    #[tokio::test]
    async fn test_reserved_override() {
        let driver = MockDriver::new();
        let gate = AdmissionGate::with_factory(
            GateConfig::new("mock", "mock://localhost/test", 4).with_reserved_connections(0),
            Arc::new(driver),
        )
        .await
        .unwrap();

        assert_eq!(gate.capacity(), 4);
    }

    #[tokio::test]
    async fn test_eager_connections_bounded_by_capacity() {
        let driver = MockDriver::new();
        let gate = gate(&driver, 1).await;
        assert_eq!(gate.capacity(), 0);
        assert_eq!(driver.connects(), 0);
        assert_eq!(gate.handle().open_connections(), 0);

        let driver = MockDriver::new();
        let handle = crate::handle::HandleConfig::default()
            .with_min_idle(5)
            .with_max_idle(5);
        let _gate = AdmissionGate::with_factory(
            GateConfig::new("mock", "mock://localhost/test", 3).with_handle(handle),
            Arc::new(driver.clone()),
        )
        .await
        .unwrap();
        assert_eq!(driver.connects(), 2);
    }

    #[tokio::test]
    async fn test_invalid_limit_opens_nothing() {
        let driver = MockDriver::new();
        let err = AdmissionGate::with_factory(
            GateConfig::new("mock", "mock://localhost/test", 0),
            Arc::new(driver.clone()),
        )
        .await
        .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert_eq!(driver.connects(), 0);
    }

    #[tokio::test]
    async fn test_unit_released_after_failure() {
        let driver = MockDriver::new().fail_statements_containing("BAD");
        let gate = gate(&driver, 2).await;

        let err = gate.execute("BAD STATEMENT", &[]).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Statement);
        assert_eq!(gate.available(), 1);
        assert_eq!(gate.in_flight(), 0);

        gate.execute("GOOD", &[]).await.unwrap();
        let stats = gate.stats();
        assert_eq!(stats.admissions, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.completions, 1);
    }

    #[tokio::test]
    async fn test_try_execute_without_capacity() {
        let driver = MockDriver::new();
        let gate = gate(&driver, 1).await;

        let err = gate.try_execute("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Admission { .. }));
        assert_eq!(gate.stats().rejections, 1);
        assert_eq!(driver.statements(), 0);
    }

    #[tokio::test]
    async fn test_execute_within_times_out() {
        let driver = MockDriver::new();
        let gate = gate(&driver, 1).await;

        let err = gate
            .execute_within("SELECT 1", &[], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Admission { .. }));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_closed_gate_rejects() {
        let driver = MockDriver::new();
        let gate = gate(&driver, 3).await;

        gate.close().await.unwrap();

        assert!(gate.is_closed());
        let err = gate.execute("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Connection);
        let err = gate.query_one("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Connection);
    }
}
