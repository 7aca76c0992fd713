/*!
Coordinator that wires configuration, checks and outputs into one audit run
*/

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cloud_inventory::{ServiceClients, snapshot::Snapshot};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::core::{
    cache::CacheStats,
    config::AuditorConfig,
    context::RunContext,
    engine::{AuditEngine, EngineSettings, RunReport},
    error::AuditError,
    output_plugins::{DispatchReport, OutputDispatcher, OutputRegistry},
    registry::{self, CheckRegistry, GroupSelection},
};

/// Main auditor that coordinates all components
pub struct Auditor<'r> {
    config: AuditorConfig,
    registry: &'r CheckRegistry,
    selection: GroupSelection,
    clients: Arc<ServiceClients>,
    dispatcher: OutputDispatcher,
}

impl Auditor<'static> {
    /// Auditor over the built-in checks and output providers
    pub async fn new(config: AuditorConfig) -> Result<Self, AuditError> {
        let registry = registry::global()?;
        Auditor::with_registries(config, registry, &OutputRegistry::with_builtin()).await
    }
}

impl<'r> Auditor<'r> {
    /// Validate everything that can be validated before a check runs: config
    /// values, group names, output providers and the inventory snapshot
    pub async fn with_registries(
        config: AuditorConfig,
        registry: &'r CheckRegistry,
        outputs: &OutputRegistry,
    ) -> Result<Self, AuditError> {
        info!("Initializing posture auditor...");
        config.validate()?;

        let selection = GroupSelection::from_names(config.run.groups.clone());
        registry.select(&selection)?;
        let dispatcher = outputs.resolve(&config.outputs.providers, &config.outputs)?;

        let snapshot = Snapshot::load(&config.inventory.snapshot_path).await?;
        let clients = Arc::new(ServiceClients::from_snapshot(snapshot));
        Ok(Self::from_parts(config, registry, selection, clients, dispatcher))
    }

    /// Assemble an auditor from already-built clients and outputs
    pub fn from_parts(
        config: AuditorConfig,
        registry: &'r CheckRegistry,
        selection: GroupSelection,
        clients: Arc<ServiceClients>,
        dispatcher: OutputDispatcher,
    ) -> Self {
        Self {
            config,
            registry,
            selection,
            clients,
            dispatcher,
        }
    }

    /// Run the selected checks once and deliver their findings.
    ///
    /// Check and output failures are reported in the summary, not as errors.
    pub async fn run(&mut self) -> Result<AuditSummary, AuditError> {
        let run = &self.config.run;
        info!(
            "Starting audit of account {} in {} ({})",
            run.account_id, run.region, run.partition
        );
        info!("Outputs: {:?}", self.dispatcher.names());

        let mut ctx = RunContext::new(
            run.account_id.as_str(),
            run.region.as_str(),
            run.partition.as_str(),
            Arc::clone(&self.clients),
        );
        if let Some(secs) = run.run_deadline_secs {
            ctx = ctx.with_deadline(Instant::now() + Duration::from_secs(secs));
        }

        let settings = EngineSettings {
            max_concurrent_checks: run.max_concurrent_checks,
            check_timeout: run.check_timeout_secs.map(Duration::from_secs),
        };
        let report = AuditEngine::new(self.registry, settings)
            .run(&self.selection, &ctx)
            .await?;

        let dispatch = self.dispatcher.dispatch(&report.findings).await;
        let summary = AuditSummary {
            report,
            dispatch,
            cache: ctx.cache.stats(),
        };

        if summary.has_failures() {
            warn!(
                "Audit finished with {} failed checks and {} failed outputs",
                summary.report.failed_checks().count(),
                summary.dispatch.failures.0.len()
            );
        } else {
            info!("Audit finished cleanly");
        }
        Ok(summary)
    }
}

/// Everything one run produced
#[derive(Debug)]
pub struct AuditSummary {
    pub report: RunReport,
    pub dispatch: DispatchReport,
    pub cache: CacheStats,
}

impl AuditSummary {
    /// Any check or output failed; drives the process exit code
    pub fn has_failures(&self) -> bool {
        self.report.has_failures() || !self.dispatch.is_success()
    }
}

/// Helper function to create an auditor from a config file, with
/// `POSTURE_AUDITOR_*` environment overrides applied
pub async fn create_auditor_from_config_file<P: AsRef<Path>>(
    config_path: P,
) -> Result<Auditor<'static>, AuditError> {
    let mut config = AuditorConfig::from_file(config_path).await?;
    config.merge_env();
    Auditor::new(config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ConfigError;

    fn config(snapshot: &Path) -> AuditorConfig {
        let mut config = AuditorConfig::default();
        config.run.account_id = "111122223333".into();
        config.run.region = "us-east-1".into();
        config.inventory.snapshot_path = snapshot.to_path_buf();
        config
    }

    #[tokio::test]
    async fn startup_rejects_unknown_groups() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("inventory.json");
        std::fs::write(&snapshot, r#"{"services": {}}"#).unwrap();

        let mut config = config(&snapshot);
        config.run.groups = vec!["rds".into()];
        let err = Auditor::new(config).await.err().unwrap();
        assert!(err.is_startup());
        assert!(matches!(err, AuditError::Registry(_)));
    }

    #[tokio::test]
    async fn startup_rejects_missing_snapshot() {
        let err = Auditor::new(config(Path::new("/nonexistent/inventory.json")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AuditError::Inventory(_)));
    }

    #[tokio::test]
    async fn startup_rejects_unconfigured_output() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("inventory.json");
        std::fs::write(&snapshot, r#"{"services": {}}"#).unwrap();

        let mut config = config(&snapshot);
        config.outputs.providers = vec!["sechub".into()];
        let err = Auditor::new(config).await.err().unwrap();
        assert!(matches!(err, AuditError::Config(ConfigError::Missing(_))));
    }

    #[tokio::test]
    async fn empty_inventory_fails_checks_but_completes_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("inventory.json");
        std::fs::write(&snapshot, r#"{"services": {}}"#).unwrap();

        let mut auditor = Auditor::new(config(&snapshot)).await.unwrap();
        let summary = auditor.run().await.unwrap();

        assert!(summary.report.findings.is_empty());
        assert!(summary.has_failures());
        assert_eq!(
            summary.report.outcomes.len(),
            registry::global().unwrap().len()
        );
    }
}
