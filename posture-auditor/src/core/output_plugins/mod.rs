/*!
Modular output system: every selected provider receives the complete finding batch
*/

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{error, info};

use crate::core::{
    config::OutputsConfig,
    error::{ConfigError, OutputError, ProviderFailures},
    finding::Finding,
};

pub mod json;
pub mod sechub;
pub mod sqlite;
pub mod terminal;

/// Trait for output providers
#[async_trait]
pub trait OutputProvider: Send {
    /// Name the provider is selected by
    fn name(&self) -> &'static str;

    /// Deliver the whole batch, applying the provider's own batching,
    /// retry and transaction strategy
    async fn write_findings(&mut self, findings: &[Finding]) -> Result<(), OutputError>;
}

/// Builds a provider from its configuration section
pub type ProviderFactory = fn(&OutputsConfig) -> Result<Box<dyn OutputProvider>, ConfigError>;

/// Provider name → factory, in registration order
#[derive(Default)]
pub struct OutputRegistry {
    factories: Vec<(&'static str, ProviderFactory)>,
}

impl OutputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in providers
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        // built-in names are distinct
        registry.factories.extend([
            (sechub::NAME, sechub::factory as ProviderFactory),
            (sqlite::NAME, sqlite::factory as ProviderFactory),
            (json::NAME, json::factory as ProviderFactory),
            (terminal::NAME, terminal::factory as ProviderFactory),
        ]);
        registry
    }

    pub fn register(
        &mut self,
        name: &'static str,
        factory: ProviderFactory,
    ) -> Result<(), ConfigError> {
        if self.contains(name) {
            return Err(ConfigError::DuplicateProvider(name.to_string()));
        }
        self.factories.push((name, factory));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.iter().any(|(registered, _)| *registered == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.iter().map(|(name, _)| *name)
    }

    /// Construct every selected provider, failing before the run on an
    /// unknown name or a missing/invalid provider section
    pub fn resolve(
        &self,
        names: &[String],
        config: &OutputsConfig,
    ) -> Result<OutputDispatcher, ConfigError> {
        let mut seen = HashSet::new();
        let mut providers = Vec::with_capacity(names.len());
        for name in names {
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Invalid {
                    key: "outputs.providers".to_string(),
                    message: format!("`{name}` is listed more than once"),
                });
            }
            let factory = self
                .factories
                .iter()
                .find(|(registered, _)| *registered == name)
                .map(|(_, factory)| *factory)
                .ok_or_else(|| ConfigError::UnknownProvider(name.clone()))?;
            providers.push(factory(config)?);
        }

        info!("Initialized output dispatcher with {} providers", providers.len());
        Ok(OutputDispatcher { providers })
    }
}

/// Holds the resolved providers for one run
pub struct OutputDispatcher {
    providers: Vec<Box<dyn OutputProvider>>,
}

impl OutputDispatcher {
    pub fn new(providers: Vec<Box<dyn OutputProvider>>) -> Self {
        Self { providers }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|provider| provider.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Hand the batch to every provider at once; one provider failing never
    /// stops delivery to the others
    pub async fn dispatch(&mut self, findings: &[Finding]) -> DispatchReport {
        let writes = self.providers.iter_mut().map(|provider| async move {
            let result = provider.write_findings(findings).await;
            (provider.name(), result)
        });

        let mut report = DispatchReport::default();
        for (name, result) in futures::future::join_all(writes).await {
            match result {
                Ok(()) => {
                    info!("Delivered {} findings to {}", findings.len(), name);
                    report.delivered.push(name);
                }
                Err(e) => {
                    error!("Output provider {} failed: {}", name, e);
                    report.failures.0.push((name.to_string(), e));
                }
            }
        }
        report
    }
}

/// Per-provider delivery outcome
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub delivered: Vec<&'static str>,
    pub failures: ProviderFailures,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.0.is_empty()
    }

    pub fn into_result(self) -> Result<(), OutputError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(OutputError::Dispatch(self.failures))
        }
    }
}

/// Resolve `names` against `registry` and deliver `findings` to each of them
pub async fn dispatch(
    registry: &OutputRegistry,
    findings: &[Finding],
    names: &[String],
    config: &OutputsConfig,
) -> Result<DispatchReport, ConfigError> {
    let mut dispatcher = registry.resolve(names, config)?;
    Ok(dispatcher.dispatch(findings).await)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn findings(count: usize) -> Vec<Finding> {
        (0..count)
            .map(|i| {
                Finding::builder("111122223333", "us-east-1", "aws")
                    .check(format!("test-check-{}", i % 3))
                    .title("Test finding")
                    .description("Generated for output tests")
                    .resource("AwsEc2Image", format!("arn:aws:ec2:us-east-1:111122223333:image/ami-{i:04}"))
                    .related_requirements(["NIST CSF PR.DS-5"])
                    .status(if i % 2 == 0 {
                        crate::core::finding::ComplianceStatus::Failed
                    } else {
                        crate::core::finding::ComplianceStatus::Passed
                    })
                    .build()
                    .unwrap()
            })
            .collect()
    }
}
