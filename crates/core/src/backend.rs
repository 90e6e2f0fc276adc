use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::connections::{ConnectionDescriptor, Credentials};
use crate::results::NativeResult;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    message: String,
}

impl BackendError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[async_trait]
pub trait EmbeddedBackend: Send + Sync {
    type Handle: EmbeddedHandle;

    async fn boot(&self) -> Result<Self::Handle, BackendError>;
}

/// A live embedded engine. Shared between the session and running imports.
#[async_trait]
pub trait EmbeddedHandle: Send + Sync + 'static {
    async fn query(&self, sql: &str) -> Result<NativeResult, BackendError>;

    /// Makes `bytes` readable by SQL under the returned location.
    async fn register_file(&self, name: &str, bytes: Vec<u8>) -> Result<String, BackendError>;

    async fn drop_file(&self, name: &str) -> Result<(), BackendError>;

    async fn copy_file_to_buffer(&self, name: &str) -> Result<Vec<u8>, BackendError>;

    async fn close(&self) -> Result<(), BackendError>;
}

#[async_trait]
impl<H> EmbeddedHandle for Arc<H>
where
    H: EmbeddedHandle + ?Sized,
{
    async fn query(&self, sql: &str) -> Result<NativeResult, BackendError> {
        (**self).query(sql).await
    }

    async fn register_file(&self, name: &str, bytes: Vec<u8>) -> Result<String, BackendError> {
        (**self).register_file(name, bytes).await
    }

    async fn drop_file(&self, name: &str) -> Result<(), BackendError> {
        (**self).drop_file(name).await
    }

    async fn copy_file_to_buffer(&self, name: &str) -> Result<Vec<u8>, BackendError> {
        (**self).copy_file_to_buffer(name).await
    }

    async fn close(&self) -> Result<(), BackendError> {
        (**self).close().await
    }
}

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn post_query(
        &self,
        endpoint: &RemoteEndpoint,
        sql: &str,
    ) -> Result<serde_json::Value, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub credentials: Option<Credentials>,
}

impl RemoteEndpoint {
    #[must_use]
    pub fn from_descriptor(descriptor: &ConnectionDescriptor) -> Option<Self> {
        let host = descriptor.host.as_deref()?.trim();
        if host.is_empty() {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            port: descriptor.port,
            database: descriptor.database.clone(),
            credentials: descriptor.credentials.clone(),
        })
    }

    /// `host:port/`, defaulting to plain http when no scheme is given.
    #[must_use]
    pub fn url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        let base = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{host}")
        };
        match self.port {
            Some(port) => format!("{base}:{port}/"),
            None => format!("{base}/"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RemoteEndpoint;
    use crate::connections::{ConnectionDescriptor, Credentials};

    #[test]
    fn url_adds_scheme_and_trailing_slash() {
        let endpoint = RemoteEndpoint {
            host: "analytics.local".to_string(),
            port: Some(8123),
            database: None,
            credentials: None,
        };
        assert_eq!(endpoint.url(), "http://analytics.local:8123/");

        let endpoint = RemoteEndpoint {
            host: "https://ch.example.com/".to_string(),
            port: None,
            database: None,
            credentials: None,
        };
        assert_eq!(endpoint.url(), "https://ch.example.com/");
    }

    #[test]
    fn descriptor_without_host_has_no_endpoint() {
        let mut descriptor = ConnectionDescriptor::remote("prod", "  ", 8123);
        assert!(RemoteEndpoint::from_descriptor(&descriptor).is_none());

        descriptor.host = Some("10.0.0.5".to_string());
        descriptor.credentials = Some(Credentials::new("default", "secret"));
        let endpoint = RemoteEndpoint::from_descriptor(&descriptor).expect("endpoint");
        assert_eq!(endpoint.url(), "http://10.0.0.5:8123/");
        assert_eq!(
            endpoint.credentials.map(|credentials| credentials.username),
            Some("default".to_string())
        );
    }
}
