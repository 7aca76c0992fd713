/*!
Configuration management for the posture auditor
*/

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::error::ConfigError;

const ENV_PREFIX: &str = "POSTURE_AUDITOR";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuditorConfig {
    /// Identity and scheduling of a run
    pub run: RunConfig,
    /// Where upstream responses come from
    pub inventory: InventoryConfig,
    /// Log level and format
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Output configuration
    #[serde(default)]
    pub outputs: OutputsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Account being audited
    #[serde(default)]
    pub account_id: String,
    /// Region being audited
    #[serde(default)]
    pub region: String,
    /// Partition used when building ARNs
    #[serde(default = "default_partition")]
    pub partition: String,
    /// Check groups to run; empty means all of them
    #[serde(default)]
    pub groups: Vec<String>,
    /// 1 runs checks sequentially
    #[serde(default = "default_concurrency")]
    pub max_concurrent_checks: usize,
    /// Per-check timeout in seconds
    #[serde(default)]
    pub check_timeout_secs: Option<u64>,
    /// Whole-run deadline in seconds
    #[serde(default)]
    pub run_deadline_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InventoryConfig {
    /// Recorded inventory snapshot answering upstream calls
    pub snapshot_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Log each check's span on close, with its elapsed time
    #[serde(default)]
    pub span_events: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OutputsConfig {
    /// Output providers that receive the finding batch, by name
    #[serde(default)]
    pub providers: Vec<String>,
    pub sechub: Option<SecHubConfig>,
    pub sqlite: Option<SqliteConfig>,
    pub json: Option<JsonConfig>,
    pub terminal: Option<TerminalConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SecHubConfig {
    /// Base URL of the compliance API
    pub endpoint: String,
    /// Environment variable holding the bearer token
    pub api_token_env: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteConfig {
    pub path: PathBuf,
    #[serde(default = "default_table_name")]
    pub table_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct JsonConfig {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub pretty: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TerminalConfig {
    #[serde(default)]
    pub format: TerminalFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalFormat {
    Plain,
    #[default]
    Colored,
    Json,
}

/// Upper bound the compliance API accepts per import call
pub const MAX_BATCH_SIZE: usize = 100;

fn default_partition() -> String {
    "aws".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    30
}

fn default_table_name() -> String {
    "findings".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            region: String::new(),
            partition: default_partition(),
            groups: Vec::new(),
            max_concurrent_checks: default_concurrency(),
            check_timeout_secs: None,
            run_deadline_secs: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            span_events: false,
        }
    }
}

impl AuditorConfig {
    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load a TOML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_toml(&content)
    }

    /// `~/.config/posture-auditor/auditor.toml` or the platform equivalent
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("posture-auditor").join("auditor.toml"))
    }

    /// Override run identity and log level from `POSTURE_AUDITOR_*` variables
    pub fn merge_env(&mut self) {
        self.merge_vars(|key| std::env::var(key).ok());
    }

    fn merge_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}_{name}")).filter(|value| !value.trim().is_empty())
        };
        if let Some(account_id) = var("ACCOUNT_ID") {
            self.run.account_id = account_id;
        }
        if let Some(region) = var("REGION") {
            self.run.region = region;
        }
        if let Some(partition) = var("PARTITION") {
            self.run.partition = partition;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Reject missing identity fields and out-of-range values before anything runs
    pub fn validate(&self) -> Result<(), ConfigError> {
        require("run.account_id", &self.run.account_id)?;
        require("run.region", &self.run.region)?;
        require("run.partition", &self.run.partition)?;
        if !self.run.account_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("run.account_id", "must contain only digits"));
        }
        if self.run.max_concurrent_checks == 0 {
            return Err(invalid("run.max_concurrent_checks", "must be at least 1"));
        }
        if self.run.check_timeout_secs == Some(0) {
            return Err(invalid("run.check_timeout_secs", "must be greater than 0"));
        }
        if self.run.run_deadline_secs == Some(0) {
            return Err(invalid("run.run_deadline_secs", "must be greater than 0"));
        }
        if self.inventory.snapshot_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("inventory.snapshot_path".to_string()));
        }
        self.outputs.validate()
    }
}

impl OutputsConfig {
    /// Bounds for whichever provider sections are present
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(sechub) = &self.sechub {
            sechub.validate()?;
        }
        if let Some(sqlite) = &self.sqlite {
            sqlite.validate()?;
        }
        Ok(())
    }

    /// Section for `provider`, or a startup error naming it
    pub fn section<'a, T>(
        provider: &str,
        section: &'a Option<T>,
    ) -> Result<&'a T, ConfigError> {
        section
            .as_ref()
            .ok_or_else(|| ConfigError::Missing(format!("[outputs.{provider}]")))
    }
}

impl SecHubConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require("outputs.sechub.endpoint", &self.endpoint)?;
        if !(self.endpoint.starts_with("https://") || self.endpoint.starts_with("http://")) {
            return Err(invalid("outputs.sechub.endpoint", "must be an http(s) URL"));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(invalid(
                "outputs.sechub.batch_size",
                &format!("must be between 1 and {MAX_BATCH_SIZE}"),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(invalid("outputs.sechub.request_timeout_secs", "must be greater than 0"));
        }
        Ok(())
    }
}

impl SqliteConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("outputs.sqlite.path".to_string()));
        }
        if !is_identifier(&self.table_name) {
            return Err(invalid(
                "outputs.sqlite.table_name",
                "must be a SQL identifier (letters, digits, underscore)",
            ));
        }
        Ok(())
    }
}

/// Letters, digits and underscores, not starting with a digit
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn require(key: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::Missing(key.to_string()))
    } else {
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: message.to_string(),
    }
}
