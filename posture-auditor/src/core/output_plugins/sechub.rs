/*!
Compliance API output: findings imported in bounded batches.

Each batch is independent. A batch that keeps failing after retries stops the
write, but everything delivered before it stays delivered.
*/

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::core::{
    config::{MAX_BATCH_SIZE, OutputsConfig, SecHubConfig},
    error::{ConfigError, OutputError},
    finding::Finding,
};

use super::OutputProvider;

pub const NAME: &str = "sechub";

const IMPORT_PATH: &str = "/findings/import";
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

pub fn factory(config: &OutputsConfig) -> Result<Box<dyn OutputProvider>, ConfigError> {
    let section = OutputsConfig::section(NAME, &config.sechub)?;
    section.validate()?;
    let transport = HttpBatchTransport::new(section)?;
    Ok(Box::new(SecHubProvider::new(
        Arc::new(transport),
        section.batch_size,
        section.max_retries,
    )))
}

/// Body of a successful import call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BatchImportResponse {
    pub success_count: usize,
    pub failed_count: usize,
    pub failed_findings: Vec<ImportFailure>,
}

/// A single finding the API refused
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImportFailure {
    pub id: String,
    pub error_code: String,
    pub error_message: String,
}

/// Sends one batch to the compliance API
#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn import(&self, batch: &[Finding]) -> Result<BatchImportResponse, OutputError>;
}

/// reqwest-backed transport posting `{"Findings": [...]}`
pub struct HttpBatchTransport {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
}

impl HttpBatchTransport {
    pub fn new(config: &SecHubConfig) -> Result<Self, ConfigError> {
        let auth_token = match &config.api_token_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                ConfigError::Missing(format!("environment variable {var} (outputs.sechub.api_token_env)"))
            })?),
            None => None,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ConfigError::Invalid {
                key: "outputs.sechub".to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            url: format!("{}{}", config.endpoint.trim_end_matches('/'), IMPORT_PATH),
            auth_token,
        })
    }
}

#[async_trait]
impl BatchTransport for HttpBatchTransport {
    async fn import(&self, batch: &[Finding]) -> Result<BatchImportResponse, OutputError> {
        let mut request = self.client.post(&self.url);

        if let Some(ref token) = self.auth_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.json(&json!({ "Findings": batch })).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(OutputError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.bytes().await?;
        Ok(decode_import_response(&body, batch.len()))
    }
}

/// Body of an accepted import. An undecodable body still means the batch was
/// accepted, so it is reported with zero counts rather than failed.
fn decode_import_response(body: &[u8], batch_len: usize) -> BatchImportResponse {
    match serde_json::from_slice(body) {
        Ok(response) => response,
        Err(e) => {
            warn!(
                "Batch of {} findings accepted but the response could not be decoded, counts unknown: {}",
                batch_len, e
            );
            BatchImportResponse::default()
        }
    }
}

/// Compliance API output provider
pub struct SecHubProvider {
    transport: Arc<dyn BatchTransport>,
    batch_size: usize,
    max_retries: u32,
    backoff: Duration,
}

impl SecHubProvider {
    pub fn new(transport: Arc<dyn BatchTransport>, batch_size: usize, max_retries: u32) -> Self {
        Self {
            transport,
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
            max_retries,
            backoff: RETRY_BACKOFF,
        }
    }

    /// Base delay between attempts; attempt `n` waits `n * backoff`
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    async fn import_with_retry(&self, batch: &[Finding]) -> Result<BatchImportResponse, OutputError> {
        let mut attempt = 0;
        loop {
            match self.transport.import(batch).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.max_retries && is_retryable(&e) => {
                    attempt += 1;
                    warn!("Import attempt {} failed, retrying: {}", attempt, e);
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl OutputProvider for SecHubProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn write_findings(&mut self, findings: &[Finding]) -> Result<(), OutputError> {
        let total_batches = findings.len().div_ceil(self.batch_size);
        let mut rejected = 0;

        for (index, batch) in findings.chunks(self.batch_size).enumerate() {
            let response = self.import_with_retry(batch).await.map_err(|e| {
                OutputError::BatchFailed {
                    delivered_batches: index,
                    failed_batch: index + 1,
                    total_batches,
                    reason: e.to_string(),
                }
            })?;

            for failure in &response.failed_findings {
                warn!(
                    "Finding {} rejected: {} {}",
                    failure.id, failure.error_code, failure.error_message
                );
            }
            rejected += response.failed_count;
            debug!(
                "Imported batch {}/{}: {} accepted, {} rejected",
                index + 1,
                total_batches,
                response.success_count,
                response.failed_count
            );
        }

        info!("Sent {} findings in {} batches", findings.len(), total_batches);
        if rejected > 0 {
            return Err(OutputError::Rejected { rejected });
        }
        Ok(())
    }
}

/// Throttling, server-side and connection failures are worth another attempt
fn is_retryable(error: &OutputError) -> bool {
    match error {
        OutputError::Api { status, .. } => *status == 429 || *status >= 500,
        OutputError::Http(e) => {
            e.is_connect()
                || e.is_timeout()
                || e
                    .status()
                    .is_some_and(|status| status.as_u16() == 429 || status.is_server_error())
        }
        _ => false,
    }
}
