/*!
Terminal output: one block per finding plus a pass/fail summary
*/

use std::fmt::Write as _;

use async_trait::async_trait;

use crate::core::{
    config::{OutputsConfig, TerminalFormat},
    error::{ConfigError, OutputError},
    finding::{ComplianceStatus, Finding},
};

use super::OutputProvider;

pub const NAME: &str = "terminal";

/// The `[outputs.terminal]` section is optional
pub fn factory(config: &OutputsConfig) -> Result<Box<dyn OutputProvider>, ConfigError> {
    let format = config
        .terminal
        .as_ref()
        .map(|terminal| terminal.format)
        .unwrap_or_default();
    Ok(Box::new(TerminalOutputProvider::new(format)))
}

/// Terminal output provider
pub struct TerminalOutputProvider {
    format: TerminalFormat,
}

impl TerminalOutputProvider {
    pub fn new(format: TerminalFormat) -> Self {
        Self { format }
    }

    fn format_finding(&self, finding: &Finding) -> Result<String, OutputError> {
        let resource = finding
            .resource()
            .map(|resource| resource.id.as_str())
            .unwrap_or("[no resource]");
        let text = match self.format {
            TerminalFormat::Plain => format!(
                "[{}] {} {}\n  Resource: {}\n  {}",
                finding.compliance.status.as_str(),
                finding.severity.label,
                finding.title,
                resource,
                finding.description
            ),
            TerminalFormat::Colored => {
                let color = match finding.compliance.status {
                    ComplianceStatus::Failed => "\x1b[31m",
                    ComplianceStatus::Passed => "\x1b[32m",
                };
                format!(
                    "{color}[{}]\x1b[0m \x1b[1m{}\x1b[0m {}\n\
                     \x1b[36m  Resource:\x1b[0m {}\n\
                     \x1b[36m  Details:\x1b[0m {}",
                    finding.compliance.status.as_str(),
                    finding.severity.label,
                    finding.title,
                    resource,
                    finding.description
                )
            }
            TerminalFormat::Json => serde_json::to_string_pretty(finding)?,
        };
        Ok(text)
    }

    fn summary(&self, findings: &[Finding]) -> String {
        let failed = findings.iter().filter(|finding| finding.is_failed()).count();
        let passed = findings.len() - failed;
        let line = format!("{} findings: {} failed, {} passed", findings.len(), failed, passed);
        match self.format {
            TerminalFormat::Colored => format!("\x1b[33m{line}\x1b[0m"),
            _ => line,
        }
    }

    /// Everything the provider prints for one batch
    pub fn render(&self, findings: &[Finding]) -> Result<String, OutputError> {
        let mut out = String::new();
        if self.format == TerminalFormat::Json {
            out.push_str(&serde_json::to_string_pretty(findings)?);
            out.push('\n');
            return Ok(out);
        }
        for finding in findings {
            // writing to a String cannot fail
            let _ = writeln!(out, "{}\n", self.format_finding(finding)?);
        }
        out.push_str(&self.summary(findings));
        out.push('\n');
        Ok(out)
    }
}

#[async_trait]
impl OutputProvider for TerminalOutputProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn write_findings(&mut self, findings: &[Finding]) -> Result<(), OutputError> {
        print!("{}", self.render(findings)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::output_plugins::testing;

    #[test]
    fn plain_output_lists_findings_then_summary() {
        let provider = TerminalOutputProvider::new(TerminalFormat::Plain);
        let rendered = provider.render(&testing::findings(3)).unwrap();

        assert!(rendered.starts_with("[FAILED] INFORMATIONAL Test finding"));
        assert!(rendered.contains("ami-0001"));
        assert!(rendered.trim_end().ends_with("3 findings: 2 failed, 1 passed"));
        assert!(!rendered.contains("\x1b["));
    }

    #[test]
    fn json_output_is_an_asff_array() {
        let provider = TerminalOutputProvider::new(TerminalFormat::Json);
        let rendered = provider.render(&testing::findings(2)).unwrap();
        let parsed: Vec<Finding> = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn section_is_optional() {
        let provider = factory(&OutputsConfig::default()).ok().unwrap();
        assert_eq!(provider.name(), "terminal");
    }
}
