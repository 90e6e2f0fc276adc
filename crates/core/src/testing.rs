//! In-memory stand-ins for the backend traits, shared by unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::backend::{
    BackendError, EmbeddedBackend, EmbeddedHandle, RemoteEndpoint, RemoteTransport,
};
use crate::results::{CellValue, NativeColumn, NativeResult};

#[derive(Debug, Clone)]
struct FakeTable {
    columns: Vec<(String, String)>,
    rows: i64,
}

#[derive(Debug, Default)]
struct FakeState {
    default_database: String,
    databases: Vec<String>,
    tables: BTreeMap<(String, String), FakeTable>,
    files: BTreeMap<String, Vec<u8>>,
    queries: Vec<String>,
    failing: Vec<String>,
    failing_files: Vec<String>,
    closed: bool,
}

#[derive(Debug)]
pub(crate) struct FakeEngine {
    state: Mutex<FakeState>,
    register_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeEngine {
    pub(crate) fn new() -> Self {
        Self::with_options(Duration::ZERO, "memory")
    }

    pub(crate) fn with_options(register_delay: Duration, default_database: &str) -> Self {
        Self {
            state: Mutex::new(FakeState {
                default_database: default_database.to_string(),
                databases: vec![default_database.to_string()],
                ..FakeState::default()
            }),
            register_delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake engine state poisoned")
    }

    pub(crate) fn seed_database(&self, name: &str) {
        let mut state = self.state();
        if !state.databases.iter().any(|database| database == name) {
            state.databases.push(name.to_string());
            state.databases.sort();
        }
    }

    pub(crate) fn seed_table(&self, database: &str, table: &str, columns: &[(&str, &str)], rows: i64) {
        self.seed_database(database);
        self.state().tables.insert(
            (database.to_string(), table.to_string()),
            FakeTable {
                columns: columns
                    .iter()
                    .map(|(name, data_type)| ((*name).to_string(), (*data_type).to_string()))
                    .collect(),
                rows,
            },
        );
    }

    pub(crate) fn fail_on(&self, pattern: &str) {
        self.state().failing.push(pattern.to_string());
    }

    pub(crate) fn fail_register(&self, file_name: &str) {
        self.state().failing_files.push(file_name.to_string());
    }

    pub(crate) fn queries(&self) -> Vec<String> {
        self.state().queries.clone()
    }

    pub(crate) fn count_queries(&self, needle: &str) -> usize {
        self.state()
            .queries
            .iter()
            .filter(|query| query.contains(needle))
            .count()
    }

    pub(crate) fn registered_files(&self) -> Vec<String> {
        self.state().files.keys().cloned().collect()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn respond(&self, sql: &str) -> Result<NativeResult, BackendError> {
        let mut state = self.state();
        state.queries.push(sql.to_string());
        if state.closed {
            return Err(BackendError::new("database is closed"));
        }
        if let Some(pattern) = state.failing.iter().find(|pattern| sql.contains(pattern.as_str())) {
            return Err(BackendError::new(format!("injected failure on `{pattern}`")));
        }

        let trimmed = sql.trim();
        let upper = trimmed.to_ascii_uppercase();
        let strings = delimited(trimmed, '\'');
        let idents = delimited(trimmed, '"');

        if upper.contains("CURRENT_DATABASE()") {
            let name = state.default_database.clone();
            return Ok(native(&[("current_database()", "VARCHAR")], vec![vec![text(&name)]]));
        }
        if trimmed.contains("duckdb_databases()") {
            let rows = state
                .databases
                .iter()
                .filter(|name| strings.is_empty() || strings.contains(*name))
                .map(|name| vec![text(name)])
                .collect();
            return Ok(native(&[("database_name", "VARCHAR")], rows));
        }
        if trimmed.contains("information_schema.tables") {
            let rows = state
                .tables
                .keys()
                .filter(|(database, table)| {
                    strings.first() == Some(database) && strings.get(1).map_or(true, |t| t == table)
                })
                .map(|(_, table)| vec![text("main"), text(table), text("BASE TABLE")])
                .collect();
            return Ok(native(
                &[("table_schema", "VARCHAR"), ("table_name", "VARCHAR"), ("table_type", "VARCHAR")],
                rows,
            ));
        }
        if trimmed.contains("information_schema.columns") {
            let key = (strings[0].clone(), strings[2].clone());
            let rows = state
                .tables
                .get(&key)
                .map(|table| {
                    table
                        .columns
                        .iter()
                        .map(|(name, data_type)| vec![text(name), text(data_type), text("YES")])
                        .collect()
                })
                .unwrap_or_default();
            return Ok(native(
                &[("column_name", "VARCHAR"), ("data_type", "VARCHAR"), ("is_nullable", "VARCHAR")],
                rows,
            ));
        }
        if upper.starts_with("SELECT COUNT(*)") {
            let key = (idents[0].clone(), idents[2].clone());
            let table = state
                .tables
                .get(&key)
                .ok_or_else(|| BackendError::new(format!("table {} does not exist", key.1)))?;
            return Ok(native(&[("count_star()", "BIGINT")], vec![vec![CellValue::Int(table.rows)]]));
        }
        if upper.starts_with("CREATE OR REPLACE TABLE") {
            if !state.databases.contains(&idents[0]) {
                return Err(BackendError::new(format!(
                    "Catalog Error: Schema with name {} does not exist!",
                    idents[0]
                )));
            }
            let location = strings
                .first()
                .cloned()
                .ok_or_else(|| BackendError::new("missing source location"))?;
            let bytes = state
                .files
                .get(&location)
                .cloned()
                .ok_or_else(|| BackendError::new(format!("no file registered at {location}")))?;
            let contents = String::from_utf8_lossy(&bytes).into_owned();
            let mut lines = contents.lines().filter(|line| !line.trim().is_empty());
            let columns = lines
                .next()
                .map(|header| {
                    header
                        .split(',')
                        .map(|name| (name.trim().to_string(), "VARCHAR".to_string()))
                        .collect()
                })
                .unwrap_or_default();
            let rows = i64::try_from(lines.count()).unwrap_or(i64::MAX);
            state.tables.insert(
                (idents[0].clone(), idents[1].clone()),
                FakeTable { columns, rows },
            );
            return Ok(native(&[("Count", "BIGINT")], vec![vec![CellValue::Int(rows)]]));
        }
        if upper.starts_with("ATTACH") {
            let alias = idents
                .first()
                .cloned()
                .ok_or_else(|| BackendError::new("missing alias"))?;
            state.databases.push(alias);
            state.databases.sort();
            return Ok(NativeResult::default());
        }
        if upper.starts_with("CREATE TABLE") {
            let name = trimmed["CREATE TABLE".len()..]
                .trim()
                .split(|c: char| c == '(' || c.is_whitespace())
                .next()
                .unwrap_or_default()
                .to_string();
            let database = state.default_database.clone();
            state.tables.insert(
                (database, name),
                FakeTable {
                    columns: Vec::new(),
                    rows: 0,
                },
            );
            return Ok(NativeResult::default());
        }
        if upper.starts_with("DROP TABLE") {
            let key = if idents.len() >= 2 {
                (idents[0].clone(), idents[idents.len() - 1].clone())
            } else {
                let name = trimmed.split_whitespace().last().unwrap_or_default();
                (state.default_database.clone(), name.to_string())
            };
            state.tables.remove(&key);
            return Ok(NativeResult::default());
        }
        if upper.starts_with("SELECT 1") {
            return Ok(native(&[("1", "INTEGER")], vec![vec![CellValue::Int(1)]]));
        }
        if upper.starts_with("SELECT") && upper.contains("FROM MISSING") {
            return Err(BackendError::new("Catalog Error: Table with name missing does not exist!"));
        }
        Ok(NativeResult::default())
    }
}

#[async_trait]
impl EmbeddedHandle for FakeEngine {
    async fn query(&self, sql: &str) -> Result<NativeResult, BackendError> {
        tokio::task::yield_now().await;
        self.respond(sql)
    }

    async fn register_file(&self, name: &str, bytes: Vec<u8>) -> Result<String, BackendError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if self.register_delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.register_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.state();
        if state.failing_files.iter().any(|failing| failing == name) {
            return Err(BackendError::new(format!("could not register {name}")));
        }
        let location = format!("fake://{name}");
        state.files.insert(location.clone(), bytes);
        Ok(location)
    }

    async fn drop_file(&self, name: &str) -> Result<(), BackendError> {
        self.state().files.remove(&format!("fake://{name}"));
        Ok(())
    }

    async fn copy_file_to_buffer(&self, name: &str) -> Result<Vec<u8>, BackendError> {
        self.state()
            .files
            .get(&format!("fake://{name}"))
            .cloned()
            .ok_or_else(|| BackendError::new(format!("no file named {name}")))
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.state().closed = true;
        Ok(())
    }
}

/// Boots a fresh [`FakeEngine`] every time and keeps the latest one around.
#[derive(Debug, Default)]
pub(crate) struct FakeBackend {
    pub(crate) boots: AtomicUsize,
    pub(crate) fail_boots: AtomicUsize,
    register_delay: Duration,
    default_database: Option<String>,
    latest: Mutex<Option<Arc<FakeEngine>>>,
}

impl FakeBackend {
    pub(crate) fn with_register_delay(register_delay: Duration) -> Self {
        Self {
            register_delay,
            ..Self::default()
        }
    }

    /// Boots engines whose main catalog is `name`, like a file-backed database.
    pub(crate) fn with_default_database(name: &str) -> Self {
        Self {
            default_database: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub(crate) fn engine(&self) -> Arc<FakeEngine> {
        self.latest
            .lock()
            .expect("fake backend poisoned")
            .clone()
            .expect("engine was never booted")
    }
}

#[async_trait]
impl EmbeddedBackend for FakeBackend {
    type Handle = Arc<FakeEngine>;

    async fn boot(&self) -> Result<Self::Handle, BackendError> {
        self.boots.fetch_add(1, Ordering::SeqCst);
        if self.fail_boots.load(Ordering::SeqCst) > 0 {
            self.fail_boots.fetch_sub(1, Ordering::SeqCst);
            return Err(BackendError::new("failed to instantiate engine"));
        }
        let engine = Arc::new(FakeEngine::with_options(
            self.register_delay,
            self.default_database.as_deref().unwrap_or("memory"),
        ));
        *self.latest.lock().expect("fake backend poisoned") = Some(Arc::clone(&engine));
        Ok(engine)
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeTransport {
    pub(crate) requests: Mutex<Vec<(String, String)>>,
    pub(crate) response: Mutex<Option<serde_json::Value>>,
    pub(crate) fail_with: Mutex<Option<String>>,
}

impl FakeTransport {
    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().expect("fake transport poisoned").len()
    }
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn post_query(
        &self,
        endpoint: &RemoteEndpoint,
        sql: &str,
    ) -> Result<serde_json::Value, BackendError> {
        self.requests
            .lock()
            .expect("fake transport poisoned")
            .push((endpoint.url(), sql.to_string()));
        if let Some(message) = self.fail_with.lock().expect("fake transport poisoned").clone() {
            return Err(BackendError::new(message));
        }
        Ok(self
            .response
            .lock()
            .expect("fake transport poisoned")
            .clone()
            .unwrap_or_else(|| {
                json!({"meta": [{"name": "1", "type": "UInt8"}], "data": [[1]], "rows": 1})
            }))
    }
}

fn native(columns: &[(&str, &str)], rows: Vec<Vec<CellValue>>) -> NativeResult {
    NativeResult {
        columns: columns
            .iter()
            .map(|(name, data_type)| NativeColumn::new(*name, *data_type))
            .collect(),
        rows,
    }
}

fn text(value: &str) -> CellValue {
    CellValue::Text(value.to_string())
}

fn delimited(sql: &str, quote: char) -> Vec<String> {
    let mut values = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c != quote {
            continue;
        }
        let mut value = String::new();
        while let Some(inner) = chars.next() {
            if inner == quote {
                if chars.peek() == Some(&quote) {
                    chars.next();
                    value.push(quote);
                    continue;
                }
                break;
            }
            value.push(inner);
        }
        values.push(value);
    }
    values
}
