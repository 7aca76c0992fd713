/*!
Recorded inventory snapshots.

A snapshot is a JSON document of upstream API responses captured from an
account, keyed by service then operation:

```json
{
  "services": {
    "ec2": { "DescribeImages": { "Images": [] } },
    "ssm": {
      "DescribeDocumentPermission": {
        "Recorded": [
          { "Request": { "Name": "doc" }, "Response": { "AccountIds": ["all"] } }
        ]
      }
    },
    "shield": { "ListProtections": { "Error": { "Code": "AccessDeniedException", "Message": "denied" } } }
  }
}
```
*/

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::{ApiError, ServiceClient};

/// A parsed inventory snapshot
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    #[serde(default)]
    services: Map<String, Value>,
}

impl Snapshot {
    /// Load a snapshot from a JSON file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, ApiError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ApiError::Snapshot(format!("failed to read {}: {e}", path.display())))?;
        let snapshot: Snapshot = serde_json::from_str(&content)
            .map_err(|e| ApiError::Snapshot(format!("failed to parse {}: {e}", path.display())))?;

        info!(
            "Loaded inventory snapshot {} with {} services",
            path.display(),
            snapshot.services.len()
        );
        Ok(snapshot)
    }

    /// Build a snapshot from an in-memory document
    pub fn from_value(value: Value) -> Result<Self, ApiError> {
        serde_json::from_value(value).map_err(|e| ApiError::Snapshot(e.to_string()))
    }

    /// Services recorded in this snapshot
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    fn lookup(&self, service: &str, operation: &str, request: &Value) -> Result<Value, ApiError> {
        let entry = self
            .services
            .get(service)
            .and_then(|ops| ops.get(operation))
            .ok_or_else(|| ApiError::OperationNotRecorded {
                service: service.to_string(),
                operation: operation.to_string(),
            })?;

        let response = match entry.get("Recorded") {
            Some(Value::Array(recorded)) => recorded
                .iter()
                .find(|call| call.get("Request") == Some(request))
                .and_then(|call| call.get("Response"))
                .ok_or_else(|| ApiError::RequestNotRecorded {
                    service: service.to_string(),
                    operation: operation.to_string(),
                    request: request.to_string(),
                })?,
            Some(_) => {
                return Err(ApiError::Snapshot(format!(
                    "{service}:{operation} `Recorded` must be an array"
                )));
            }
            None => entry,
        };

        match response.get("Error") {
            Some(error) => Err(ApiError::Service {
                code: error
                    .get("Code")
                    .and_then(Value::as_str)
                    .unwrap_or("UnknownError")
                    .to_string(),
                message: error
                    .get("Message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            None => Ok(response.clone()),
        }
    }
}

/// Client answering one service's calls from a shared snapshot
pub struct SnapshotClient {
    service: String,
    snapshot: Arc<Snapshot>,
}

impl SnapshotClient {
    pub fn new(service: impl Into<String>, snapshot: Arc<Snapshot>) -> Self {
        Self {
            service: service.into(),
            snapshot,
        }
    }
}

#[async_trait]
impl ServiceClient for SnapshotClient {
    fn service(&self) -> &str {
        &self.service
    }

    async fn invoke(&self, operation: &str, request: Value) -> Result<Value, ApiError> {
        self.snapshot.lookup(&self.service, operation, &request)
    }
}
