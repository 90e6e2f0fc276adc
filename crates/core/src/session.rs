use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::backend::{BackendError, EmbeddedBackend, EmbeddedHandle, RemoteEndpoint, RemoteTransport};
use crate::connections::{
    ConnectionDescriptor, ConnectionKind, ConnectionRegistry, RegistryError,
    EMBEDDED_CONNECTION_ID,
};
use crate::history::HistoryLedger;
use crate::import::{load_into_engine, ImportError, ImportFormat};
use crate::query_executor::{QueryError, QueryExecutor, QueryRoute};
use crate::results::{CellValue, QueryResult};
use crate::schema::{introspect, quote_identifier, SchemaCatalog, SchemaError, SchemaSnapshot};
use crate::snapshot::SessionSnapshot;
use crate::tabs::TabSet;

pub const DEFAULT_DATABASE: &str = "memory";

const CURRENT_DATABASE_SQL: &str = "SELECT current_database()";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub connection_id: Option<String>,
    pub connection_name: Option<String>,
    pub kind: Option<ConnectionKind>,
    pub is_initialized: bool,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub struct Workspace {
    pub tabs: TabSet,
    pub history: HistoryLedger,
    pub schema: SchemaSnapshot,
    pub current_database: String,
    pub last_error: Option<String>,
}

impl Default for Workspace {
    fn default() -> Self {
        Self {
            tabs: TabSet::new(),
            history: HistoryLedger::default(),
            schema: SchemaSnapshot::default(),
            current_database: DEFAULT_DATABASE.to_string(),
            last_error: None,
        }
    }
}

pub type SharedWorkspace = Arc<Mutex<Workspace>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub baseline_extensions: Vec<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            baseline_extensions: vec!["parquet".to_string(), "json".to_string()],
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to open connection: {0}")]
    Connection(#[source] BackendError),
    #[error("connection `{0}` was not found")]
    NotFound(String),
    #[error("no active session")]
    NotConnected,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("statement failed: {0}")]
    Backend(#[source] BackendError),
}

#[derive(Debug)]
pub struct SessionController<E: EmbeddedBackend, T: RemoteTransport> {
    embedded: E,
    transport: T,
    options: SessionOptions,
    registry: ConnectionRegistry,
    phase: SessionPhase,
    handle: Option<Arc<E::Handle>>,
    default_database: String,
    active: Option<ConnectionDescriptor>,
    workspace: SharedWorkspace,
}

impl<E: EmbeddedBackend, T: RemoteTransport> SessionController<E, T> {
    #[must_use]
    pub fn new(embedded: E, transport: T, options: SessionOptions) -> Self {
        Self {
            embedded,
            transport,
            options,
            registry: ConnectionRegistry::new(),
            phase: SessionPhase::Uninitialized,
            handle: None,
            default_database: DEFAULT_DATABASE.to_string(),
            active: None,
            workspace: Arc::new(Mutex::new(Workspace::default())),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let last_error = self.workspace.lock().await.last_error.clone();
        SessionStatus {
            phase: self.phase,
            connection_id: self.active.as_ref().map(|active| active.id.clone()),
            connection_name: self.active.as_ref().map(|active| active.name.clone()),
            kind: self.active.as_ref().map(|active| active.kind),
            is_initialized: self.is_initialized(),
            last_error,
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.phase == SessionPhase::Connected && self.handle.is_some()
    }

    #[must_use]
    pub fn workspace(&self) -> &SharedWorkspace {
        &self.workspace
    }

    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    #[must_use]
    pub fn active_descriptor(&self) -> Option<&ConnectionDescriptor> {
        self.active.as_ref()
    }

    #[must_use]
    pub fn embedded_handle(&self) -> Option<Arc<E::Handle>> {
        self.handle.clone()
    }

    #[must_use]
    pub fn default_database(&self) -> &str {
        &self.default_database
    }

    pub async fn initialize_default(&mut self) -> Result<(), SessionError> {
        if self.is_initialized() {
            return Ok(());
        }
        self.connect(EMBEDDED_CONNECTION_ID).await
    }

    pub async fn connect(&mut self, connection_id: &str) -> Result<(), SessionError> {
        let Some(descriptor) = self.registry.get(connection_id).cloned() else {
            return self
                .record(Err(SessionError::NotFound(connection_id.to_string())))
                .await;
        };

        self.phase = SessionPhase::Connecting;
        if let Err(error) = self.ensure_handle().await {
            self.phase = if self.handle.is_some() {
                SessionPhase::Connected
            } else {
                SessionPhase::Uninitialized
            };
            tracing::warn!(id = connection_id, %error, "connection failed");
            return self.record(Err(error)).await;
        }

        tracing::info!(id = %descriptor.id, name = %descriptor.name, kind = ?descriptor.kind, "connected");
        let embedded = descriptor.kind == ConnectionKind::Embedded;
        self.active = Some(descriptor);
        self.phase = SessionPhase::Connected;
        self.workspace.lock().await.last_error = None;
        self.try_refresh_schema().await;

        if embedded {
            let mut workspace = self.workspace.lock().await;
            let known = workspace
                .schema
                .catalog()
                .database(&workspace.current_database)
                .is_some();
            if !known {
                workspace.current_database.clone_from(&self.default_database);
            }
        }
        Ok(())
    }

    pub async fn teardown(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(error) = handle.close().await {
                tracing::warn!(%error, "failed to close embedded engine");
            }
        }
        self.active = None;
        *self.workspace.lock().await = Workspace::default();
        if self.phase != SessionPhase::Disconnected {
            tracing::info!("session torn down");
        }
        self.phase = SessionPhase::Disconnected;
    }

    pub async fn refresh_schema(&self) -> Result<(), SessionError> {
        let remote = self
            .active
            .as_ref()
            .is_some_and(|active| active.kind == ConnectionKind::Remote);
        if remote {
            self.workspace
                .lock()
                .await
                .schema
                .publish(SchemaCatalog::default());
            return Ok(());
        }

        let handle = self.handle.clone().ok_or(SessionError::NotConnected)?;
        match introspect(handle.as_ref()).await {
            Ok(catalog) => {
                tracing::debug!(databases = catalog.databases.len(), "schema refreshed");
                self.workspace.lock().await.schema.publish(catalog);
                Ok(())
            }
            Err(error) => {
                tracing::warn!(%error, "schema refresh failed");
                self.record(Err(error.into())).await
            }
        }
    }

    pub async fn try_refresh_schema(&self) -> bool {
        match self.refresh_schema().await {
            Ok(()) => true,
            Err(error) => {
                tracing::debug!(%error, "skipped schema refresh");
                false
            }
        }
    }

    /// Failures come back inside the result.
    pub async fn execute(&self, sql: &str, tab_id: Option<&str>) -> QueryResult {
        let outcome = QueryExecutor::new(self.route(), &self.workspace)
            .execute(sql, tab_id)
            .await;
        if outcome.schema_changed {
            self.try_refresh_schema().await;
        }
        outcome.result
    }

    fn route(&self) -> Result<QueryRoute<'_, E::Handle, T>, QueryError> {
        let active = match &self.active {
            Some(active) if self.phase == SessionPhase::Connected => active,
            _ => return Err(QueryError::NotConnected),
        };
        match active.kind {
            ConnectionKind::Embedded => self
                .handle
                .as_deref()
                .map(QueryRoute::Embedded)
                .ok_or(QueryError::NotConnected),
            ConnectionKind::Remote => RemoteEndpoint::from_descriptor(active)
                .map(|endpoint| QueryRoute::Remote {
                    transport: &self.transport,
                    endpoint,
                })
                .ok_or_else(|| QueryError::MissingEndpoint(active.name.clone())),
        }
    }

    pub async fn add_connection(
        &mut self,
        descriptor: ConnectionDescriptor,
    ) -> Result<(), SessionError> {
        let added = self
            .registry
            .add(descriptor, &self.transport)
            .await
            .map_err(SessionError::from);
        self.record(added).await
    }

    pub async fn update_connection(
        &mut self,
        descriptor: ConnectionDescriptor,
    ) -> Result<(), SessionError> {
        let updated = self
            .registry
            .update(descriptor.clone())
            .map_err(SessionError::from);
        if updated.is_ok() && self.is_active(&descriptor.id) {
            self.active = Some(descriptor);
        }
        self.record(updated).await
    }

    pub async fn remove_connection(&mut self, connection_id: &str) -> Result<(), SessionError> {
        let removed = self
            .registry
            .remove(connection_id)
            .map(|_| ())
            .map_err(SessionError::from);
        if removed.is_ok() && self.is_active(connection_id) {
            self.active = self.registry.get(EMBEDDED_CONNECTION_ID).cloned();
            self.try_refresh_schema().await;
        }
        self.record(removed).await
    }

    pub async fn delete_table(&self, database: &str, table: &str) -> Result<(), SessionError> {
        let Some(handle) = self.handle.clone() else {
            return self.record(Err(SessionError::NotConnected)).await;
        };
        let sql = format!(
            "DROP TABLE {}.{}",
            quote_identifier(database),
            quote_identifier(table)
        );
        if let Err(error) = handle.query(&sql).await {
            return self.record(Err(SessionError::Backend(error))).await;
        }
        tracing::info!(database, table, "table dropped");
        self.try_refresh_schema().await;
        Ok(())
    }

    pub async fn set_current_database(&self, name: impl Into<String>) {
        self.workspace.lock().await.current_database = name.into();
    }

    /// Refreshes the schema whether or not the load succeeded.
    pub async fn import_file(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        table: &str,
        format: ImportFormat,
        database: Option<&str>,
    ) -> Result<(), ImportError> {
        let database = database.unwrap_or(&self.default_database);
        let loaded = match self.handle.clone() {
            Some(handle) => {
                load_into_engine(handle.as_ref(), file_name, bytes, table, format, database).await
            }
            None => Err(ImportError::NotConnected),
        };

        match &loaded {
            Ok(()) => tracing::info!(file = file_name, database, table, "file imported"),
            Err(error) => {
                tracing::warn!(file = file_name, %error, "import failed");
                self.workspace.lock().await.last_error = Some(error.to_string());
            }
        }
        self.try_refresh_schema().await;
        loaded
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let workspace = self.workspace.lock().await;
        SessionSnapshot {
            query_history: workspace.history.to_vec(),
            databases: workspace.schema.catalog().databases.clone(),
            tabs: workspace
                .tabs
                .tabs()
                .iter()
                .cloned()
                .map(|mut tab| {
                    tab.last_result = None;
                    tab
                })
                .collect(),
            active_tab: Some(workspace.tabs.active_id().to_string()),
            current_database: Some(workspace.current_database.clone()),
            current_connection: self.active.as_ref().map(|active| active.id.clone()),
            connection_list: self
                .registry
                .list()
                .iter()
                .filter(|descriptor| !descriptor.is_reserved())
                .cloned()
                .collect(),
        }
    }

    /// Returns the connection that was active when the snapshot was taken, if
    /// it still exists.
    pub async fn restore(&mut self, snapshot: SessionSnapshot) -> Option<String> {
        self.registry = ConnectionRegistry::from_descriptors(snapshot.connection_list);
        let mut workspace = self.workspace.lock().await;
        workspace.tabs = TabSet::from_tabs(snapshot.tabs, snapshot.active_tab.as_deref());
        workspace.history = HistoryLedger::from_entries(snapshot.query_history);
        workspace.schema = SchemaSnapshot::from_catalog(SchemaCatalog {
            databases: snapshot.databases,
        });
        workspace.current_database = snapshot
            .current_database
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string());
        drop(workspace);

        snapshot
            .current_connection
            .filter(|id| self.registry.get(id).is_some())
    }

    async fn ensure_handle(&mut self) -> Result<(), SessionError> {
        if self.handle.is_some() {
            return Ok(());
        }

        let handle = self
            .embedded
            .boot()
            .await
            .map_err(SessionError::Connection)?;
        for extension in &self.options.baseline_extensions {
            if let Err(error) = handle.query(&format!("LOAD {extension}")).await {
                if let Err(close_error) = handle.close().await {
                    tracing::debug!(%close_error, "failed to close half-booted engine");
                }
                return Err(SessionError::Connection(error));
            }
        }
        self.default_database = resolve_default_database(&handle).await;
        tracing::info!(
            extensions = ?self.options.baseline_extensions,
            database = %self.default_database,
            "embedded engine booted"
        );
        self.handle = Some(Arc::new(handle));
        Ok(())
    }

    fn is_active(&self, connection_id: &str) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.id == connection_id)
    }

    async fn record<V>(&self, result: Result<V, SessionError>) -> Result<V, SessionError> {
        if let Err(error) = &result {
            self.workspace.lock().await.last_error = Some(error.to_string());
        }
        result
    }
}

async fn resolve_default_database<H>(handle: &H) -> String
where
    H: EmbeddedHandle + ?Sized,
{
    match handle.query(CURRENT_DATABASE_SQL).await {
        Ok(result) => result
            .first_column()
            .next()
            .and_then(CellValue::as_str)
            .map_or_else(|| DEFAULT_DATABASE.to_string(), str::to_string),
        Err(error) => {
            tracing::debug!(%error, "could not read the engine's default database");
            DEFAULT_DATABASE.to_string()
        }
    }
}
