/*!
JSON file output: the whole batch as one array of ASFF records
*/

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::core::{
    config::{JsonConfig, OutputsConfig},
    error::{ConfigError, OutputError},
    finding::Finding,
};

use super::OutputProvider;

pub const NAME: &str = "json";

pub fn factory(config: &OutputsConfig) -> Result<Box<dyn OutputProvider>, ConfigError> {
    let section = OutputsConfig::section(NAME, &config.json)?;
    Ok(Box::new(JsonOutputProvider::new(section)))
}

/// JSON file output provider
pub struct JsonOutputProvider {
    file_path: PathBuf,
    pretty: bool,
}

impl JsonOutputProvider {
    pub fn new(config: &JsonConfig) -> Self {
        Self {
            file_path: config.path.clone(),
            pretty: config.pretty,
        }
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.file_path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.file_path.with_file_name(name)
    }
}

#[async_trait]
impl OutputProvider for JsonOutputProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn write_findings(&mut self, findings: &[Finding]) -> Result<(), OutputError> {
        let json_str = if self.pretty {
            serde_json::to_string_pretty(findings)?
        } else {
            serde_json::to_string(findings)?
        };

        if let Some(parent) = self.file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        // readers never see a half-written file
        let staging = self.staging_path();
        tokio::fs::write(&staging, json_str).await?;
        tokio::fs::rename(&staging, &self.file_path).await?;

        debug!("Wrote {} findings to {}", findings.len(), self.file_path.display());
        Ok(())
    }
}
