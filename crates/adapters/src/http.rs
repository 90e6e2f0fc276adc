use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tabula_core::backend::{BackendError, RemoteEndpoint, RemoteTransport};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Posts raw SQL to an HTTP analytics endpoint and reads back the JSON envelope.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteTransport for ReqwestTransport {
    async fn post_query(
        &self,
        endpoint: &RemoteEndpoint,
        sql: &str,
    ) -> Result<serde_json::Value, BackendError> {
        let url = endpoint.url();
        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(sql.to_string());
        if let Some(credentials) = &endpoint.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }
        if let Some(database) = &endpoint.database {
            request = request.query(&[("database", database)]);
        }

        let response = request.send().await.map_err(|error| {
            BackendError::new(format!("request to {url} failed: {error}"))
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(%url, %status, "remote query rejected");
            return Err(BackendError::new(format!(
                "remote endpoint returned {status}: {}",
                body.trim()
            )));
        }

        response.json::<serde_json::Value>().await.map_err(|error| {
            BackendError::new(format!("invalid JSON from {url}: {error}"))
        })
    }
}
