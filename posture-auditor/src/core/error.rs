/*!
Error types for the auditor core
*/

use cloud_inventory::ApiError;
use thiserror::Error;

/// Raised while assembling the check catalog
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("check `{name}` is already registered in group `{group}`")]
    DuplicateCheck { group: String, name: String },

    #[error("no checks are registered for group `{0}`")]
    UnknownGroup(String),
}

/// Raised while a check drains its finding stream
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("upstream call failed: {0}")]
    Api(#[from] ApiError),

    #[error("unexpected response shape: {0}")]
    Response(String),

    #[error("invalid finding: {0}")]
    Finding(#[from] FindingError),

    #[error("check timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("run deadline exceeded")]
    DeadlineExceeded,

    #[error("check panicked: {0}")]
    Panicked(String),
}

/// Raised when a finding is built without its required fields
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FindingError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("confidence must be between 0 and 100, got {0}")]
    InvalidConfidence(u8),
}

/// Startup-time configuration problems
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required configuration: {0}")]
    Missing(String),

    #[error("invalid configuration value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("unknown output provider `{0}`")]
    UnknownProvider(String),

    #[error("output provider `{0}` is registered twice")]
    DuplicateProvider(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Delivery failures reported by output providers
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error(
        "batch {failed_batch} of {total_batches} failed after {delivered_batches} delivered: {reason}"
    )]
    BatchFailed {
        delivered_batches: usize,
        failed_batch: usize,
        total_batches: usize,
        reason: String,
    },

    #[error("{rejected} findings were rejected by the compliance API")]
    Rejected { rejected: usize },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("output delivery failed: {0}")]
    Dispatch(ProviderFailures),
}

/// Failures collected from every provider that could not deliver a batch
#[derive(Debug, Default)]
pub struct ProviderFailures(pub Vec<(String, OutputError)>);

impl ProviderFailures {
    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(provider, _)| provider.as_str())
    }
}

impl std::fmt::Display for ProviderFailures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (provider, error)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{provider}: {error}")?;
        }
        Ok(())
    }
}

/// Top-level error for a whole audit invocation
#[derive(Debug, Error)]
pub enum AuditError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("inventory error: {0}")]
    Inventory(#[from] ApiError),

    #[error(transparent)]
    Output(#[from] OutputError),
}

impl AuditError {
    /// Whether the failure happened before any check ran
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            AuditError::Config(_) | AuditError::Registry(_) | AuditError::Inventory(_)
        )
    }
}
