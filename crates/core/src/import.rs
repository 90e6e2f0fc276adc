use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, Semaphore};

use crate::backend::{BackendError, EmbeddedBackend, EmbeddedHandle, RemoteTransport};
use crate::schema::{quote_identifier, quote_literal};
use crate::session::SessionController;

pub const MAX_CONCURRENT_UPLOADS: usize = 3;
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImportFormat {
    Csv,
    Json,
    Parquet,
    Arrow,
    DuckDb,
}

impl ImportFormat {
    #[must_use]
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            "parquet" => Some(Self::Parquet),
            "arrow" => Some(Self::Arrow),
            "duckdb" => Some(Self::DuckDb),
            _ => None,
        }
    }

    #[must_use]
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        Self::from_extension(extension_of(file_name)?)
    }

    /// Table function used to read the format, `None` for attachable database files.
    #[must_use]
    pub fn reader(self) -> Option<&'static str> {
        match self {
            Self::Csv => Some("read_csv_auto"),
            Self::Json => Some("read_json_auto"),
            Self::Parquet => Some("read_parquet"),
            Self::Arrow => Some("read_arrow"),
            Self::DuckDb => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ImportSource {
    Bytes(Arc<[u8]>),
    Path(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ImportFile {
    pub file_name: String,
    pub size: u64,
    pub source: ImportSource,
}

impl ImportFile {
    #[must_use]
    pub fn from_bytes(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            size: bytes.len() as u64,
            source: ImportSource::Bytes(bytes.into()),
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ImportError> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|source| ImportError::Read {
                file_name: file_name.clone(),
                source,
            })?;
        Ok(Self {
            file_name,
            size: metadata.len(),
            source: ImportSource::Path(path.to_path_buf()),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Uploading,
    Processing,
    Success,
    Error,
}

impl JobStatus {
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Uploading | Self::Processing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportJob {
    pub file_name: String,
    pub target_table: String,
    pub format: ImportFormat,
    pub status: JobStatus,
    pub progress: Option<u8>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEvent {
    pub file_name: String,
    pub status: JobStatus,
    pub progress: Option<u8>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadRejection {
    #[error("unsupported file type `{0}`")]
    UnsupportedExtension(String),
    #[error("file is {size} bytes, the limit is {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{file_name}: {reason}")]
pub struct UploadError {
    pub file_name: String,
    pub reason: UploadRejection,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("invalid table name `{0}`: use letters, digits and underscores only")]
    InvalidTableName(String),
    #[error("table `{database}.{table}` was not found after import")]
    Verification { database: String, table: String },
    #[error("import failed: {0}")]
    Backend(#[source] BackendError),
    #[error("failed to read {file_name}: {source}")]
    Read {
        file_name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("embedded engine is not running")]
    NotConnected,
    #[error("file `{0}` is not in the upload queue")]
    UnknownFile(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug)]
pub struct ImportPipeline {
    database: Option<String>,
    jobs: Mutex<Vec<ImportJob>>,
    sources: HashMap<String, ImportSource>,
    upload_errors: Vec<UploadError>,
    cancellation: CancellationToken,
    events: broadcast::Sender<ImportEvent>,
}

impl Default for ImportPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ImportPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::with_target(None)
    }

    #[must_use]
    pub fn with_database(database: impl Into<String>) -> Self {
        Self::with_target(Some(database.into()))
    }

    fn with_target(database: Option<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            database,
            jobs: Mutex::new(Vec::new()),
            sources: HashMap::new(),
            upload_errors: Vec::new(),
            cancellation: CancellationToken::new(),
            events,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    #[must_use]
    pub fn upload_errors(&self) -> &[UploadError] {
        &self.upload_errors
    }

    pub async fn jobs(&self) -> Vec<ImportJob> {
        self.jobs.lock().await.clone()
    }

    pub fn submit(&mut self, files: Vec<ImportFile>) -> Vec<UploadError> {
        let mut rejected = Vec::new();
        let jobs = self.jobs.get_mut();
        for file in files {
            let format = match validate_file(&file) {
                Ok(format) => format,
                Err(reason) => {
                    tracing::debug!(file = %file.file_name, %reason, "rejected upload");
                    rejected.push(UploadError {
                        file_name: file.file_name,
                        reason,
                    });
                    continue;
                }
            };

            self.upload_errors
                .retain(|error| error.file_name != file.file_name);
            jobs.retain(|job| job.file_name != file.file_name);
            jobs.push(ImportJob {
                target_table: default_table_name(&file.file_name),
                file_name: file.file_name.clone(),
                format,
                status: JobStatus::Pending,
                progress: None,
                error: None,
            });
            self.sources.insert(file.file_name, file.source);
        }
        self.upload_errors.extend(rejected.iter().cloned());
        rejected
    }

    pub fn set_target_table(
        &mut self,
        file_name: &str,
        table: impl Into<String>,
    ) -> Result<(), ImportError> {
        let job = self.job_mut(file_name)?;
        job.target_table = table.into();
        Ok(())
    }

    pub fn retry(&mut self, file_name: &str) -> Result<(), ImportError> {
        let job = self.job_mut(file_name)?;
        job.status = JobStatus::Pending;
        job.progress = None;
        job.error = None;
        Ok(())
    }

    pub fn remove(&mut self, file_name: &str) -> Result<ImportJob, ImportError> {
        let jobs = self.jobs.get_mut();
        let index = jobs
            .iter()
            .position(|job| job.file_name == file_name)
            .ok_or_else(|| ImportError::UnknownFile(file_name.to_string()))?;
        self.sources.remove(file_name);
        Ok(jobs.remove(index))
    }

    /// Stops handing out upload slots. Jobs already running finish.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub async fn start_upload<E, T>(
        &mut self,
        session: &SessionController<E, T>,
    ) -> Result<UploadSummary, ImportError>
    where
        E: EmbeddedBackend,
        T: RemoteTransport,
    {
        let handle = session.embedded_handle().ok_or(ImportError::NotConnected)?;
        let database = self
            .database
            .clone()
            .unwrap_or_else(|| session.default_database().to_string());
        self.cancellation.reset();

        let queued = self.jobs.get_mut().clone();
        let mut summary = UploadSummary {
            skipped: queued
                .iter()
                .filter(|job| job.status == JobStatus::Success)
                .count(),
            ..UploadSummary::default()
        };
        let runnable = queued
            .into_iter()
            .filter(|job| job.status != JobStatus::Success)
            .collect::<Vec<_>>();
        tracing::info!(
            jobs = runnable.len(),
            skipped = summary.skipped,
            %database,
            "starting upload"
        );

        let slots = Semaphore::new(MAX_CONCURRENT_UPLOADS);
        let this = &*self;
        let outcomes = join_all(
            runnable
                .into_iter()
                .map(|job| this.run_job(&slots, handle.as_ref(), session, &database, job)),
        )
        .await;

        for outcome in outcomes {
            match outcome {
                JobOutcome::Succeeded => summary.succeeded += 1,
                JobOutcome::Failed => summary.failed += 1,
                JobOutcome::Cancelled => summary.cancelled += 1,
            }
        }
        session.try_refresh_schema().await;

        let jobs = self.jobs.get_mut();
        if jobs.iter().all(|job| job.status == JobStatus::Success) {
            jobs.clear();
            self.sources.clear();
        }
        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "upload finished"
        );
        Ok(summary)
    }

    async fn run_job<E, T>(
        &self,
        slots: &Semaphore,
        handle: &E::Handle,
        session: &SessionController<E, T>,
        database: &str,
        job: ImportJob,
    ) -> JobOutcome
    where
        E: EmbeddedBackend,
        T: RemoteTransport,
    {
        let file_name = job.file_name.as_str();
        if let Err(error) = validate_table_name(&job.target_table) {
            self.update(file_name, JobStatus::Error, None, Some(error.to_string()))
                .await;
            return JobOutcome::Failed;
        }

        let Ok(_permit) = slots.acquire().await else {
            return JobOutcome::Cancelled;
        };
        if self.cancellation.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        self.update(file_name, JobStatus::Uploading, Some(0), None).await;
        let loaded = async {
            let bytes = self.read_source(file_name).await?;
            let location = register(handle, file_name, bytes).await?;
            self.update(file_name, JobStatus::Processing, Some(50), None)
                .await;
            materialize(
                handle,
                file_name,
                &location,
                &job.target_table,
                job.format,
                database,
            )
            .await
        }
        .await;

        match loaded {
            Ok(()) => {
                self.update(file_name, JobStatus::Success, Some(100), None)
                    .await;
                JobOutcome::Succeeded
            }
            Err(error) => {
                tracing::warn!(file = file_name, %error, "import job failed");
                self.update(file_name, JobStatus::Error, None, Some(error.to_string()))
                    .await;
                session.try_refresh_schema().await;
                JobOutcome::Failed
            }
        }
    }

    async fn read_source(&self, file_name: &str) -> Result<Vec<u8>, ImportError> {
        match self.sources.get(file_name) {
            Some(ImportSource::Bytes(bytes)) => Ok(bytes.to_vec()),
            Some(ImportSource::Path(path)) => {
                tokio::fs::read(path)
                    .await
                    .map_err(|source| ImportError::Read {
                        file_name: file_name.to_string(),
                        source,
                    })
            }
            None => Err(ImportError::UnknownFile(file_name.to_string())),
        }
    }

    async fn update(
        &self,
        file_name: &str,
        status: JobStatus,
        progress: Option<u8>,
        error: Option<String>,
    ) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.iter_mut().find(|job| job.file_name == file_name) {
            job.status = status;
            job.progress = progress;
            job.error.clone_from(&error);
        }
        let _ = self.events.send(ImportEvent {
            file_name: file_name.to_string(),
            status,
            progress,
            error,
        });
    }

    fn job_mut(&mut self, file_name: &str) -> Result<&mut ImportJob, ImportError> {
        self.jobs
            .get_mut()
            .iter_mut()
            .find(|job| job.file_name == file_name)
            .ok_or_else(|| ImportError::UnknownFile(file_name.to_string()))
    }
}

pub async fn load_into_engine<H>(
    handle: &H,
    file_name: &str,
    bytes: Vec<u8>,
    table: &str,
    format: ImportFormat,
    database: &str,
) -> Result<(), ImportError>
where
    H: EmbeddedHandle + ?Sized,
{
    validate_table_name(table)?;
    let location = register(handle, file_name, bytes).await?;
    materialize(handle, file_name, &location, table, format, database).await
}

async fn register<H>(handle: &H, file_name: &str, bytes: Vec<u8>) -> Result<String, ImportError>
where
    H: EmbeddedHandle + ?Sized,
{
    handle
        .register_file(file_name, bytes)
        .await
        .map_err(ImportError::Backend)
}

async fn materialize<H>(
    handle: &H,
    file_name: &str,
    location: &str,
    table: &str,
    format: ImportFormat,
    database: &str,
) -> Result<(), ImportError>
where
    H: EmbeddedHandle + ?Sized,
{
    let Some(reader) = format.reader() else {
        let sql = format!(
            "ATTACH {} AS {}",
            quote_literal(location),
            quote_identifier(table)
        );
        handle.query(&sql).await.map_err(ImportError::Backend)?;
        return verify_attached(handle, table).await;
    };

    let sql = format!(
        "CREATE OR REPLACE TABLE {}.{} AS SELECT * FROM {reader}({})",
        quote_identifier(database),
        quote_identifier(table),
        quote_literal(location)
    );
    let created = handle.query(&sql).await;
    if let Err(error) = handle.drop_file(file_name).await {
        tracing::debug!(file = file_name, %error, "failed to release registered file");
    }
    created.map_err(ImportError::Backend)?;
    verify_table(handle, database, table).await
}

async fn verify_table<H>(handle: &H, database: &str, table: &str) -> Result<(), ImportError>
where
    H: EmbeddedHandle + ?Sized,
{
    let sql = format!(
        "SELECT table_schema, table_name, table_type FROM information_schema.tables \
         WHERE table_catalog = {} AND table_name = {}",
        quote_literal(database),
        quote_literal(table)
    );
    let found = handle.query(&sql).await.map_err(ImportError::Backend)?;
    if found.rows.is_empty() {
        return Err(ImportError::Verification {
            database: database.to_string(),
            table: table.to_string(),
        });
    }
    Ok(())
}

async fn verify_attached<H>(handle: &H, alias: &str) -> Result<(), ImportError>
where
    H: EmbeddedHandle + ?Sized,
{
    let sql = format!(
        "SELECT database_name FROM duckdb_databases() WHERE database_name = {}",
        quote_literal(alias)
    );
    let found = handle.query(&sql).await.map_err(ImportError::Backend)?;
    if found.rows.is_empty() {
        return Err(ImportError::Verification {
            database: alias.to_string(),
            table: alias.to_string(),
        });
    }
    Ok(())
}

#[must_use]
pub fn default_table_name(file_name: &str) -> String {
    let stem = match file_name.rsplit_once('.') {
        Some((stem, _)) => stem,
        None => file_name,
    };
    stem.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

pub fn validate_table_name(table: &str) -> Result<(), ImportError> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ImportError::InvalidTableName(table.to_string()))
    }
}

fn validate_file(file: &ImportFile) -> Result<ImportFormat, UploadRejection> {
    let extension = extension_of(&file.file_name).unwrap_or_default();
    let format = ImportFormat::from_extension(extension)
        .ok_or_else(|| UploadRejection::UnsupportedExtension(extension.to_string()))?;
    if file.size > MAX_FILE_SIZE {
        return Err(UploadRejection::TooLarge {
            size: file.size,
            limit: MAX_FILE_SIZE,
        });
    }
    Ok(format)
}

fn extension_of(file_name: &str) -> Option<&str> {
    file_name
        .rsplit_once('.')
        .map(|(_, extension)| extension)
        .filter(|extension| !extension.is_empty())
}
