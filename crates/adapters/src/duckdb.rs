use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use ::duckdb::types::{TimeUnit, Value};
use ::duckdb::Connection;
use tabula_core::backend::{BackendError, EmbeddedBackend, EmbeddedHandle};
use tabula_core::config::IN_MEMORY_PATH;
use tabula_core::results::{CellValue, NativeColumn, NativeResult};
use tempfile::TempDir;

/// Days from 0001-01-01 to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Clone)]
pub struct DuckDbBackend {
    path: String,
}

impl Default for DuckDbBackend {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl DuckDbBackend {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::open(IN_MEMORY_PATH)
    }

    #[must_use]
    pub fn open(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl EmbeddedBackend for DuckDbBackend {
    type Handle = DuckDbHandle;

    async fn boot(&self) -> Result<Self::Handle, BackendError> {
        let path = self.path.clone();
        let connection = tokio::task::spawn_blocking(move || open_connection(&path))
            .await
            .map_err(to_join_error)??;
        let staging = TempDir::new().map_err(|error| {
            BackendError::new(format!("failed to create staging directory: {error}"))
        })?;
        tracing::debug!(path = %self.path, staging = %staging.path().display(), "duckdb opened");

        Ok(DuckDbHandle {
            inner: Arc::new(Inner {
                connection: Mutex::new(Some(connection)),
                staging,
            }),
        })
    }
}

struct Inner {
    connection: Mutex<Option<Connection>>,
    staging: TempDir,
}

/// Open DuckDB connection plus the directory registered files are staged in.
#[derive(Clone)]
pub struct DuckDbHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for DuckDbHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuckDbHandle")
            .field("staging", &self.inner.staging.path())
            .finish_non_exhaustive()
    }
}

impl DuckDbHandle {
    async fn with_connection<F, R>(&self, f: F) -> Result<R, BackendError>
    where
        F: FnOnce(&Connection) -> Result<R, BackendError> + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let guard = inner.connection.lock().map_err(|error| {
                BackendError::new(format!("failed to lock DuckDB connection: {error}"))
            })?;
            let connection = guard
                .as_ref()
                .ok_or_else(|| BackendError::new("database is closed"))?;
            f(connection)
        })
        .await
        .map_err(to_join_error)?
    }

    fn staged_path(&self, name: &str) -> Result<PathBuf, BackendError> {
        let file_name = Path::new(name)
            .file_name()
            .ok_or_else(|| BackendError::new(format!("invalid file name `{name}`")))?;
        Ok(self.inner.staging.path().join(file_name))
    }
}

#[async_trait]
impl EmbeddedHandle for DuckDbHandle {
    async fn query(&self, sql: &str) -> Result<NativeResult, BackendError> {
        let sql = sql.to_string();
        self.with_connection(move |connection| run_query(connection, &sql))
            .await
    }

    async fn register_file(&self, name: &str, bytes: Vec<u8>) -> Result<String, BackendError> {
        let path = self.staged_path(name)?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|error| BackendError::new(format!("failed to stage {name}: {error}")))?;
        Ok(path.to_string_lossy().into_owned())
    }

    async fn drop_file(&self, name: &str) -> Result<(), BackendError> {
        let path = self.staged_path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(BackendError::new(format!("failed to drop {name}: {error}"))),
        }
    }

    async fn copy_file_to_buffer(&self, name: &str) -> Result<Vec<u8>, BackendError> {
        let path = self.staged_path(name)?;
        tokio::fs::read(&path)
            .await
            .map_err(|error| BackendError::new(format!("failed to read {name}: {error}")))
    }

    async fn close(&self) -> Result<(), BackendError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.connection.lock().map_err(|error| {
                BackendError::new(format!("failed to lock DuckDB connection: {error}"))
            })?;
            match guard.take() {
                Some(connection) => connection
                    .close()
                    .map_err(|(_, error)| to_backend_error(error)),
                None => Ok(()),
            }
        })
        .await
        .map_err(to_join_error)?
    }
}

fn open_connection(path: &str) -> Result<Connection, BackendError> {
    let path = path.trim();
    if path.is_empty() || path == IN_MEMORY_PATH {
        Connection::open_in_memory()
    } else {
        Connection::open(path)
    }
    .map_err(|error| BackendError::new(format!("failed to open DuckDB at `{path}`: {error}")))
}

// Column metadata is only available once the statement has run.
fn run_query(connection: &Connection, sql: &str) -> Result<NativeResult, BackendError> {
    let mut statement = connection.prepare(sql).map_err(to_backend_error)?;

    let mut rows = Vec::new();
    {
        let mut cursor = statement.query([]).map_err(to_backend_error)?;
        while let Some(row) = cursor.next().map_err(to_backend_error)? {
            let width = row.as_ref().column_count();
            let mut values = Vec::with_capacity(width);
            for index in 0..width {
                let value: Value = row.get(index).map_err(to_backend_error)?;
                values.push(duckdb_value_to_cell(value));
            }
            rows.push(values);
        }
    }

    let columns = (0..statement.column_count())
        .map(|index| {
            let name = statement
                .column_name(index)
                .map_or_else(|_| format!("column{index}"), Clone::clone);
            NativeColumn::new(name, statement.column_type(index).to_string())
        })
        .collect();
    Ok(NativeResult { columns, rows })
}

fn duckdb_value_to_cell(value: Value) -> CellValue {
    match value {
        Value::Null => CellValue::Null,
        Value::Boolean(value) => CellValue::Bool(value),
        Value::TinyInt(value) => CellValue::Int(value.into()),
        Value::SmallInt(value) => CellValue::Int(value.into()),
        Value::Int(value) => CellValue::Int(value.into()),
        Value::BigInt(value) => CellValue::Int(value),
        Value::HugeInt(value) => i64::try_from(value)
            .map_or_else(|_| CellValue::Text(value.to_string()), CellValue::Int),
        Value::UTinyInt(value) => CellValue::UInt(value.into()),
        Value::USmallInt(value) => CellValue::UInt(value.into()),
        Value::UInt(value) => CellValue::UInt(value.into()),
        Value::UBigInt(value) => CellValue::UInt(value),
        Value::Float(value) => CellValue::Float(value.into()),
        Value::Double(value) => CellValue::Float(value),
        Value::Decimal(value) => CellValue::Text(value.to_string()),
        Value::Text(value) | Value::Enum(value) => CellValue::Text(value),
        Value::Blob(value) => CellValue::Blob(value),
        Value::Date32(days) => date_from_days(days).map_or(CellValue::Null, CellValue::Date),
        Value::Time64(unit, value) => {
            time_from_micros(to_micros(unit, value)).map_or(CellValue::Null, CellValue::Time)
        }
        Value::Timestamp(unit, value) => timestamp_from_micros(to_micros(unit, value))
            .map_or(CellValue::Null, CellValue::Timestamp),
        other => CellValue::Text(format!("{other:?}")),
    }
}

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

fn date_from_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?)
}

fn time_from_micros(micros: i64) -> Option<NaiveTime> {
    let seconds = u32::try_from(micros.div_euclid(1_000_000)).ok()?;
    let nanos = u32::try_from(micros.rem_euclid(1_000_000) * 1_000).ok()?;
    NaiveTime::from_num_seconds_from_midnight_opt(seconds, nanos)
}

fn timestamp_from_micros(micros: i64) -> Option<NaiveDateTime> {
    let nanos = u32::try_from(micros.rem_euclid(1_000_000) * 1_000).ok()?;
    DateTime::from_timestamp(micros.div_euclid(1_000_000), nanos).map(|value| value.naive_utc())
}

fn to_backend_error(error: ::duckdb::Error) -> BackendError {
    BackendError::new(error.to_string())
}

fn to_join_error(error: tokio::task::JoinError) -> BackendError {
    BackendError::new(format!("DuckDB task failed: {error}"))
}
