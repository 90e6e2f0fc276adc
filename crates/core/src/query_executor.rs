use std::time::Instant;

use thiserror::Error;

use crate::backend::{BackendError, EmbeddedHandle, RemoteEndpoint, RemoteTransport};
use crate::results::{MalformedResultError, QueryResult, RawResult};
use crate::session::SharedWorkspace;

const SCHEMA_MUTATING_KEYWORDS: [&str; 4] = ["CREATE", "ALTER", "DROP", "ATTACH"];

#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("no active connection")]
    NotConnected,
    #[error("connection `{0}` has no remote endpoint configured")]
    MissingEndpoint(String),
    #[error("{0}")]
    Backend(#[source] BackendError),
    #[error(transparent)]
    MalformedResult(#[from] MalformedResultError),
}

#[derive(Debug)]
pub enum QueryRoute<'a, H: ?Sized, T: ?Sized> {
    Embedded(&'a H),
    Remote {
        transport: &'a T,
        endpoint: RemoteEndpoint,
    },
}

impl<H: ?Sized, T: ?Sized> QueryRoute<'_, H, T> {
    fn label(&self) -> &'static str {
        match self {
            Self::Embedded(_) => "embedded",
            Self::Remote { .. } => "remote",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub result: QueryResult,
    /// The statement changed the catalog and the schema snapshot is stale.
    pub schema_changed: bool,
}

#[derive(Debug)]
pub struct QueryExecutor<'a, H: ?Sized, T: ?Sized> {
    route: Result<QueryRoute<'a, H, T>, QueryError>,
    workspace: &'a SharedWorkspace,
}

impl<'a, H, T> QueryExecutor<'a, H, T>
where
    H: EmbeddedHandle + ?Sized,
    T: RemoteTransport + ?Sized,
{
    #[must_use]
    pub fn new(
        route: Result<QueryRoute<'a, H, T>, QueryError>,
        workspace: &'a SharedWorkspace,
    ) -> Self {
        Self { route, workspace }
    }

    pub async fn execute(&self, query_text: &str, tab_id: Option<&str>) -> ExecutionOutcome {
        let started_at = Instant::now();
        let attempt = match &self.route {
            Ok(route) => run(route, query_text).await,
            Err(error) => Err(error.clone()),
        };
        let route = self.route.as_ref().map_or("none", |route| route.label());

        let mut workspace = self.workspace.lock().await;
        let (result, schema_changed) = match attempt {
            Ok(result) => {
                tracing::info!(
                    route,
                    rows = result.row_count,
                    elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0,
                    "query succeeded"
                );
                workspace.history.record(query_text, None);
                workspace.last_error = None;
                (result, is_schema_mutation(query_text))
            }
            Err(error) => {
                let message = error.to_string();
                tracing::warn!(route, error = %message, "query failed");
                workspace.history.record(query_text, Some(message.clone()));
                workspace.last_error = Some(message.clone());
                (QueryResult::failed(message), false)
            }
        };

        if let Some(tab_id) = tab_id {
            if let Err(error) = workspace.tabs.attach_result(tab_id, result.clone()) {
                tracing::warn!(%error, "dropping result for unknown tab");
            }
        }

        ExecutionOutcome {
            result,
            schema_changed,
        }
    }
}

pub async fn run<H, T>(route: &QueryRoute<'_, H, T>, sql: &str) -> Result<QueryResult, QueryError>
where
    H: EmbeddedHandle + ?Sized,
    T: RemoteTransport + ?Sized,
{
    let raw = match route {
        QueryRoute::Embedded(handle) => {
            RawResult::Native(handle.query(sql).await.map_err(QueryError::Backend)?)
        }
        QueryRoute::Remote {
            transport,
            endpoint,
        } => RawResult::Envelope(
            transport
                .post_query(endpoint, sql)
                .await
                .map_err(QueryError::Backend)?,
        ),
    };
    Ok(raw.normalize()?)
}

#[must_use]
pub fn is_schema_mutation(sql: &str) -> bool {
    let head = sql.trim_start();
    SCHEMA_MUTATING_KEYWORDS.iter().any(|keyword| {
        head.get(..keyword.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(keyword))
    })
}
