use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::backend::{RemoteEndpoint, RemoteTransport};

pub const EMBEDDED_CONNECTION_ID: &str = "WASM";
pub const EMBEDDED_CONNECTION_NAME: &str = "DuckDB (embedded)";

const PROBE_SQL: &str = "SELECT 1";
const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Embedded,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub id: String,
    pub name: String,
    pub kind: ConnectionKind,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

impl ConnectionDescriptor {
    #[must_use]
    pub fn embedded() -> Self {
        Self {
            id: EMBEDDED_CONNECTION_ID.to_string(),
            name: EMBEDDED_CONNECTION_NAME.to_string(),
            kind: ConnectionKind::Embedded,
            host: None,
            port: None,
            database: None,
            credentials: None,
        }
    }

    #[must_use]
    pub fn remote(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            kind: ConnectionKind::Remote,
            host: Some(host.into()),
            port: Some(port),
            database: None,
            credentials: None,
        }
    }

    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.id == EMBEDDED_CONNECTION_ID
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(String),
    Updated(String),
    Removed(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a connection named `{0}` already exists")]
    DuplicateName(String),
    #[error("a connection with id `{0}` already exists")]
    DuplicateId(String),
    #[error("connection test failed: {0}")]
    ConnectionTest(String),
    #[error("connection `{0}` was not found")]
    NotFound(String),
    #[error("the embedded connection cannot be modified or removed")]
    ReservedDescriptor,
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    descriptors: Vec<ConnectionDescriptor>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::from_descriptors(Vec::new())
    }

    /// Rebuilds a registry from persisted descriptors. The embedded descriptor
    /// is always re-seeded; later duplicates (by id or name) are dropped.
    #[must_use]
    pub fn from_descriptors(persisted: Vec<ConnectionDescriptor>) -> Self {
        let mut descriptors = vec![ConnectionDescriptor::embedded()];
        for descriptor in persisted {
            if descriptor.kind == ConnectionKind::Embedded || descriptor.is_reserved() {
                continue;
            }
            let clashes = descriptors
                .iter()
                .any(|existing| existing.id == descriptor.id || existing.name == descriptor.name);
            if clashes {
                tracing::warn!(name = %descriptor.name, "dropping duplicate persisted connection");
                continue;
            }
            descriptors.push(descriptor);
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            descriptors,
            events,
        }
    }

    #[must_use]
    pub fn list(&self) -> &[ConnectionDescriptor] {
        &self.descriptors
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ConnectionDescriptor> {
        self.descriptors.iter().find(|descriptor| descriptor.id == id)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub async fn add<T>(
        &mut self,
        descriptor: ConnectionDescriptor,
        transport: &T,
    ) -> Result<(), RegistryError>
    where
        T: RemoteTransport + ?Sized,
    {
        if self.name_taken(&descriptor.name, None) {
            return Err(RegistryError::DuplicateName(descriptor.name));
        }
        if descriptor.kind == ConnectionKind::Embedded || descriptor.is_reserved() {
            return Err(RegistryError::ReservedDescriptor);
        }
        if self.get(&descriptor.id).is_some() {
            return Err(RegistryError::DuplicateId(descriptor.id));
        }

        probe(&descriptor, transport).await?;

        tracing::info!(id = %descriptor.id, name = %descriptor.name, "connection added");
        let id = descriptor.id.clone();
        self.descriptors.push(descriptor);
        let _ = self.events.send(RegistryEvent::Added(id));
        Ok(())
    }

    pub fn update(&mut self, descriptor: ConnectionDescriptor) -> Result<(), RegistryError> {
        if descriptor.is_reserved() {
            return Err(RegistryError::ReservedDescriptor);
        }
        if descriptor.kind == ConnectionKind::Embedded {
            return Err(RegistryError::ReservedDescriptor);
        }
        if self.name_taken(&descriptor.name, Some(&descriptor.id)) {
            return Err(RegistryError::DuplicateName(descriptor.name));
        }
        let Some(existing) = self
            .descriptors
            .iter_mut()
            .find(|existing| existing.id == descriptor.id)
        else {
            return Err(RegistryError::NotFound(descriptor.id));
        };

        let id = descriptor.id.clone();
        *existing = descriptor;
        let _ = self.events.send(RegistryEvent::Updated(id));
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<ConnectionDescriptor, RegistryError> {
        if id == EMBEDDED_CONNECTION_ID {
            return Err(RegistryError::ReservedDescriptor);
        }
        let index = self
            .descriptors
            .iter()
            .position(|descriptor| descriptor.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let removed = self.descriptors.remove(index);
        tracing::info!(id = %removed.id, name = %removed.name, "connection removed");
        let _ = self.events.send(RegistryEvent::Removed(removed.id.clone()));
        Ok(removed)
    }

    fn name_taken(&self, name: &str, except_id: Option<&str>) -> bool {
        self.descriptors
            .iter()
            .any(|descriptor| descriptor.name == name && Some(descriptor.id.as_str()) != except_id)
    }
}

async fn probe<T>(descriptor: &ConnectionDescriptor, transport: &T) -> Result<(), RegistryError>
where
    T: RemoteTransport + ?Sized,
{
    let endpoint = RemoteEndpoint::from_descriptor(descriptor).ok_or_else(|| {
        RegistryError::ConnectionTest("remote connections require a host".to_string())
    })?;
    transport
        .post_query(&endpoint, PROBE_SQL)
        .await
        .map(|_| ())
        .map_err(|error| RegistryError::ConnectionTest(error.to_string()))
}
