/*!
Upstream cloud service clients shared by every check in an audit run.

One client per service is built before the run starts and handed to the
engine inside the run context, so checks never reach for ambient globals and
tests can swap in recorded responses.
*/

pub mod snapshot;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

pub use snapshot::{Snapshot, SnapshotClient};

/// Errors raised by upstream service calls
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("no client configured for service `{0}`")]
    UnknownService(String),

    #[error("{service}:{operation} is not present in the inventory snapshot")]
    OperationNotRecorded { service: String, operation: String },

    #[error("{service}:{operation} has no recorded response for request {request}")]
    RequestNotRecorded {
        service: String,
        operation: String,
        request: String,
    },

    #[error("{code}: {message}")]
    Service { code: String, message: String },

    #[error("malformed inventory snapshot: {0}")]
    Snapshot(String),
}

impl ApiError {
    /// Error code reported by the upstream service, if any
    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::Service { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether the service answered "this resource does not exist"
    pub fn is_not_found(&self) -> bool {
        self.code()
            .is_some_and(|code| code.ends_with("NotFoundException") || code.ends_with(".NotFound"))
    }
}

/// A configured client for one upstream service (e.g. "ec2", "shield")
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Service name this client answers for
    fn service(&self) -> &str;

    /// Invoke an API operation and return its raw response document
    async fn invoke(&self, operation: &str, request: Value) -> Result<Value, ApiError>;
}

/// Container holding the one client per service used during a run
#[derive(Clone, Default)]
pub struct ServiceClients {
    clients: BTreeMap<String, Arc<dyn ServiceClient>>,
}

impl ServiceClients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one snapshot-backed client per service recorded in `snapshot`
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let snapshot = Arc::new(snapshot);
        let mut clients = Self::new();
        for service in snapshot.services() {
            clients.insert(Arc::new(SnapshotClient::new(service, Arc::clone(&snapshot))));
        }
        clients
    }

    /// Add a client, replacing any previous client for the same service
    pub fn insert(&mut self, client: Arc<dyn ServiceClient>) {
        self.clients.insert(client.service().to_string(), client);
    }

    pub fn get(&self, service: &str) -> Option<&Arc<dyn ServiceClient>> {
        self.clients.get(service)
    }

    /// Names of all configured services
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    /// Route a call to the client registered for `service`
    pub async fn invoke(
        &self,
        service: &str,
        operation: &str,
        request: Value,
    ) -> Result<Value, ApiError> {
        let client = self
            .clients
            .get(service)
            .ok_or_else(|| ApiError::UnknownService(service.to_string()))?;
        tracing::debug!(service, operation, "invoking upstream operation");
        client.invoke(operation, request).await
    }
}

impl std::fmt::Debug for ServiceClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClients")
            .field("services", &self.clients.keys().collect::<Vec<_>>())
            .finish()
    }
}
