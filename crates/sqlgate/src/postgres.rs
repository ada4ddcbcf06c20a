//! PostgreSQL backend for sqlgate
//!
//! - Connections via tokio-postgres
//! - Lazy row streaming: rows are pulled from the server as the caller reads
//!   them, after the gate has already released the query's unit
//! - One reserved connection: the server refuses a client once
//!   `max_connections` is reached

use async_trait::async_trait;
use futures::TryStreamExt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_postgres::types::{ToSql, Type};

use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, DatabaseType, ExecResult, RowStream,
};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Convert a Value to a tokio-postgres compatible parameter
fn value_to_sql(value: &Value) -> Box<dyn ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(Option::<i32>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Int16(n) => Box::new(*n),
        Value::Int32(n) => Box::new(*n),
        Value::Int64(n) => Box::new(*n),
        // PostgreSQL has no unsigned integers
        Value::UInt64(n) => match i64::try_from(*n) {
            Ok(n) => Box::new(n),
            Err(_) => Box::new(rust_decimal::Decimal::from(*n)),
        },
        Value::Float32(n) => Box::new(*n),
        Value::Float64(n) => Box::new(*n),
        Value::Decimal(d) => Box::new(*d),
        Value::String(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Date(d) => Box::new(*d),
        Value::Time(t) => Box::new(*t),
        Value::DateTime(dt) => Box::new(*dt),
        Value::DateTimeTz(dt) => Box::new(*dt),
        Value::Uuid(u) => Box::new(*u),
        Value::Json(j) => Box::new(j.clone()),
    }
}

fn get<'a, T>(row: &'a tokio_postgres::Row, idx: usize, wrap: fn(T) -> Value) -> Value
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get::<_, Option<T>>(idx)
        .ok()
        .flatten()
        .map(wrap)
        .unwrap_or(Value::Null)
}

/// Convert a PostgreSQL column to a Value
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    match *pg_type {
        Type::BOOL => get(row, idx, Value::Bool),
        Type::INT2 => get(row, idx, Value::Int16),
        Type::INT4 => get(row, idx, Value::Int32),
        Type::INT8 => get(row, idx, Value::Int64),
        Type::FLOAT4 => get(row, idx, Value::Float32),
        Type::FLOAT8 => get(row, idx, Value::Float64),
        Type::NUMERIC => get(row, idx, Value::Decimal),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => get(row, idx, Value::String),
        Type::BYTEA => get(row, idx, Value::Bytes),
        Type::DATE => get(row, idx, Value::Date),
        Type::TIME => get(row, idx, Value::Time),
        Type::TIMESTAMP => get(row, idx, Value::DateTime),
        Type::TIMESTAMPTZ => get(row, idx, Value::DateTimeTz),
        Type::UUID => get(row, idx, Value::Uuid),
        Type::JSON | Type::JSONB => get(row, idx, Value::Json),
        // Unknown types come back as text when the server allows it
        _ => get(row, idx, Value::String),
    }
}

/// Convert a tokio-postgres row to a Row
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Row {
    let columns = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect();

    Row::new(columns, values)
}

/// Map a driver error: a dead connection is a connection error, anything
/// else is the statement's fault.
fn map_pg_error(e: tokio_postgres::Error, sql: &str) -> Error {
    if e.is_closed() {
        return Error::connection_with_source("connection closed", e);
    }
    Error::Statement {
        message: e.to_string(),
        sql: Some(sql.to_string()),
        source: Some(Box::new(e)),
    }
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: tokio_postgres::Client,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client,
            closed: AtomicBool::new(false),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        self.ensure_open()?;

        let boxed_params: Vec<Box<dyn ToSql + Sync + Send>> =
            params.iter().map(value_to_sql).collect();
        let param_refs: Vec<&(dyn ToSql + Sync)> = boxed_params
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let affected = self
            .client
            .execute(sql, &param_refs)
            .await
            .map_err(|e| map_pg_error(e, sql))?;

        Ok(ExecResult::affected(affected))
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Pin<Box<dyn RowStream>>> {
        self.ensure_open()?;

        let boxed_params: Vec<Box<dyn ToSql + Sync + Send>> =
            params.iter().map(value_to_sql).collect();
        let param_refs: Vec<&(dyn ToSql + Sync)> = boxed_params
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let stream = self
            .client
            .query_raw(sql, param_refs)
            .await
            .map_err(|e| map_pg_error(e, sql))?;

        Ok(Box::pin(PgRowStream {
            inner: Box::pin(stream),
            sql: sql.to_string(),
        }))
    }

    async fn is_valid(&self) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Rows read from the server on demand
struct PgRowStream {
    inner: Pin<Box<tokio_postgres::RowStream>>,
    sql: String,
}

impl RowStream for PgRowStream {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>> {
        Box::pin(async move {
            match self.inner.as_mut().try_next().await {
                Ok(row) => Ok(row.as_ref().map(pg_row_to_row)),
                Err(e) => Err(map_pg_error(e, &self.sql)),
            }
        })
    }
}

/// Build the driver configuration; settings in the URL win over the
/// `ConnectionConfig` fields.
fn pg_config(config: &ConnectionConfig) -> Result<tokio_postgres::Config> {
    let url = config.url_with_properties()?;
    let mut pg_config = tokio_postgres::Config::from_str(&url)
        .map_err(|e| Error::connection_with_source("invalid connection string", e))?;

    if pg_config.get_connect_timeout().is_none() && config.connect_timeout_ms > 0 {
        pg_config.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
    }
    if pg_config.get_application_name().is_none() {
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }
    }
    Ok(pg_config)
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let (client, connection) = pg_config(config)?
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "postgres connection terminated");
            }
        });

        Ok(Box::new(PgConnection::new(client)))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn reserved_connections(&self) -> u32 {
        1
    }
}
