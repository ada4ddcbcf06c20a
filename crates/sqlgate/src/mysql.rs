//! MySQL backend for sqlgate
//!
//! - Connections via mysql_async
//! - Query results are buffered before the connection is handed back, then
//!   streamed to the caller from memory
//! - `properties` are passed as URL parameters; `application_name` has no
//!   MySQL counterpart and is ignored

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder};
use std::pin::Pin;
use tokio::sync::Mutex;

use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, DatabaseType, ExecResult, RowStream,
    VecRowStream,
};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

fn datetime_to_sql(dt: &chrono::NaiveDateTime) -> mysql_async::Value {
    let (date, time) = (dt.date(), dt.time());
    mysql_async::Value::Date(
        date.year() as u16,
        date.month() as u8,
        date.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
        time.nanosecond() / 1000,
    )
}

/// Convert a Value to a MySQL compatible parameter
fn value_to_sql(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(b) => mysql_async::Value::from(*b),
        Value::Int16(n) => mysql_async::Value::from(*n),
        Value::Int32(n) => mysql_async::Value::from(*n),
        Value::Int64(n) => mysql_async::Value::from(*n),
        Value::UInt64(n) => mysql_async::Value::from(*n),
        Value::Float32(n) => mysql_async::Value::from(*n),
        Value::Float64(n) => mysql_async::Value::from(*n),
        Value::Decimal(d) => mysql_async::Value::from(d.to_string()),
        Value::String(s) => mysql_async::Value::from(s.clone()),
        Value::Bytes(b) => mysql_async::Value::from(b.clone()),
        Value::Date(d) => {
            mysql_async::Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0)
        }
        Value::Time(t) => mysql_async::Value::Time(
            false,
            0,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1000,
        ),
        Value::DateTime(dt) => datetime_to_sql(dt),
        Value::DateTimeTz(dt) => datetime_to_sql(&dt.naive_utc()),
        Value::Uuid(u) => mysql_async::Value::from(u.to_string()),
        Value::Json(j) => mysql_async::Value::from(j.to_string()),
    }
}

/// Convert a MySQL value to a Value
fn mysql_value_to_value(val: mysql_async::Value) -> Value {
    match val {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(b) => match String::from_utf8(b) {
            Ok(s) => Value::String(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        },
        mysql_async::Value::Int(n) => Value::Int64(n),
        mysql_async::Value::UInt(n) => Value::UInt64(n),
        mysql_async::Value::Float(f) => Value::Float32(f),
        mysql_async::Value::Double(d) => Value::Float64(d),
        mysql_async::Value::Date(year, month, day, hour, min, sec, micro) => {
            let Some(date) = chrono::NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
            else {
                return Value::Null;
            };
            if hour == 0 && min == 0 && sec == 0 && micro == 0 {
                return Value::Date(date);
            }
            chrono::NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                .map(|time| Value::DateTime(chrono::NaiveDateTime::new(date, time)))
                .unwrap_or(Value::Null)
        }
        // Durations beyond a day or negative have no TIME equivalent
        mysql_async::Value::Time(false, 0, hour, min, sec, micro) => {
            chrono::NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                .map(Value::Time)
                .unwrap_or(Value::Null)
        }
        mysql_async::Value::Time(..) => Value::Null,
    }
}

fn mysql_row_to_row(row: mysql_async::Row) -> Row {
    let columns = row
        .columns_ref()
        .iter()
        .map(|c| c.name_str().to_string())
        .collect();
    let values = row
        .unwrap()
        .into_iter()
        .map(mysql_value_to_value)
        .collect();
    Row::new(columns, values)
}

/// Map a driver error: I/O failures and a closed connection mean the
/// connection is gone, anything else is the statement's fault.
fn map_mysql_error(e: mysql_async::Error, sql: &str) -> Error {
    match e {
        mysql_async::Error::Io(_)
        | mysql_async::Error::Driver(mysql_async::DriverError::ConnectionClosed) => {
            Error::connection_with_source("connection failed", e)
        }
        other => Error::Statement {
            message: other.to_string(),
            sql: Some(sql.to_string()),
            source: Some(Box::new(other)),
        },
    }
}

/// MySQL connection implementation
pub struct MySqlConnection {
    /// `None` once closed
    conn: Mutex<Option<Conn>>,
}

impl MySqlConnection {
    /// Wrap an established connection
    pub fn new(conn: Conn) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
        }
    }
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::connection("connection is closed"))?;

        let mysql_params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();
        conn.exec_drop(sql, mysql_params)
            .await
            .map_err(|e| map_mysql_error(e, sql))?;

        Ok(ExecResult {
            rows_affected: conn.affected_rows(),
            last_insert_id: conn.last_insert_id(),
        })
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Pin<Box<dyn RowStream>>> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::connection("connection is closed"))?;

        let mysql_params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();
        let rows: Vec<mysql_async::Row> = conn
            .exec(sql, mysql_params)
            .await
            .map_err(|e| map_mysql_error(e, sql))?;

        let rows = rows.into_iter().map(mysql_row_to_row).collect();
        Ok(Box::pin(VecRowStream::new(rows)))
    }

    async fn is_valid(&self) -> bool {
        match self.conn.lock().await.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.disconnect()
                .await
                .map_err(|e| Error::connection_with_source("failed to close connection", e))?;
        }
        Ok(())
    }
}

fn mysql_opts(config: &ConnectionConfig) -> Result<Opts> {
    let url = config.url_with_properties()?;
    Opts::from_url(&url).map_err(|e| Error::connection_with_source("invalid connection string", e))
}

/// MySQL connection factory
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlConnectionFactory;

#[async_trait]
impl ConnectionFactory for MySqlConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let conn = Conn::new(OptsBuilder::from_opts(mysql_opts(config)?))
            .await
            .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        Ok(Box::new(MySqlConnection::new(conn)))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    fn reserved_connections(&self) -> u32 {
        1
    }
}
