/*!
Execution engine: runs selected checks against a run context with per-check
failure isolation
*/

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::core::context::RunContext;
use crate::core::error::{CheckError, RegistryError};
use crate::core::finding::Finding;
use crate::core::registry::{CheckRegistry, CheckUnit, GroupSelection};

/// Scheduling knobs for a run
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// 1 runs checks strictly one after another
    pub max_concurrent_checks: usize,
    /// Upper bound for draining a single check
    pub check_timeout: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_checks: 1,
            check_timeout: None,
        }
    }
}

/// Life-cycle of one check invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    NotStarted,
    Running,
    Completed,
    Failed,
}

/// What happened to one check during a run
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub group: &'static str,
    pub check: &'static str,
    pub state: CheckState,
    pub findings: usize,
    pub elapsed: Duration,
    pub error: Option<String>,
}

/// Aggregated result of a run
#[derive(Debug, Default)]
pub struct RunReport {
    /// Findings in check execution order, then emission order
    pub findings: Vec<Finding>,
    pub outcomes: Vec<CheckOutcome>,
}

impl RunReport {
    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.state == CheckState::Failed)
    }

    pub fn has_failures(&self) -> bool {
        self.failed_checks().next().is_some()
    }

    pub fn failed_findings(&self) -> usize {
        self.findings.iter().filter(|finding| finding.is_failed()).count()
    }
}

/// Drives the registry: one pass over the selected checks per run
pub struct AuditEngine<'r> {
    registry: &'r CheckRegistry,
    settings: EngineSettings,
}

impl<'r> AuditEngine<'r> {
    pub fn new(registry: &'r CheckRegistry, settings: EngineSettings) -> Self {
        Self { registry, settings }
    }

    /// Run every check in `selection` and collect their findings.
    ///
    /// Only an unknown group fails the call; check failures are recorded in
    /// the report's outcomes and the run carries on.
    pub async fn run(
        &self,
        selection: &GroupSelection,
        ctx: &RunContext,
    ) -> Result<RunReport, RegistryError> {
        let units = self.registry.select(selection)?;
        let concurrency = self.settings.max_concurrent_checks.max(1);
        info!(
            "Running {} checks for account {} in {} (concurrency {})",
            units.len(),
            ctx.account_id,
            ctx.region,
            concurrency
        );

        // buffered() releases results in input order, so parallel runs keep
        // the same finding order as sequential ones
        let results = futures::StreamExt::buffered(
            futures::stream::iter(units).map(|unit| self.execute(unit, ctx.clone())),
            concurrency,
        );
        tokio::pin!(results);

        let mut report = RunReport::default();
        while let Some((outcome, findings)) = results.next().await {
            report.findings.extend(findings);
            report.outcomes.push(outcome);
        }

        info!(
            "Run finished: {} findings ({} failed), {} of {} checks failed",
            report.findings.len(),
            report.failed_findings(),
            report.failed_checks().count(),
            report.outcomes.len()
        );
        Ok(report)
    }

    async fn execute(&self, unit: &CheckUnit, ctx: RunContext) -> (CheckOutcome, Vec<Finding>) {
        let span = info_span!("check", group = unit.group(), check = unit.name());
        let started = Instant::now();
        let mut outcome = CheckOutcome {
            group: unit.group(),
            check: unit.name(),
            state: CheckState::NotStarted,
            findings: 0,
            elapsed: Duration::ZERO,
            error: None,
        };

        let deadline = self.deadline_for(&ctx, started);
        if deadline.is_some_and(|deadline| deadline <= started) {
            outcome.state = CheckState::Failed;
            outcome.error = Some(CheckError::DeadlineExceeded.to_string());
            warn!(parent: &span, "Skipping check: run deadline exceeded");
            return (outcome, Vec::new());
        }

        outcome.state = CheckState::Running;
        let drained = async {
            let drain = AssertUnwindSafe(drain(unit, ctx)).catch_unwind();
            let caught = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, drain).await {
                    Ok(caught) => caught,
                    Err(_) => return Err(self.timeout_error(started, deadline)),
                },
                None => drain.await,
            };
            caught.unwrap_or_else(|panic| Err(CheckError::Panicked(panic_message(panic))))
        }
        .instrument(span.clone())
        .await;

        outcome.elapsed = started.elapsed();
        match drained {
            Ok(findings) => {
                outcome.state = CheckState::Completed;
                outcome.findings = findings.len();
                debug!(parent: &span, "Check produced {} findings in {:?}", findings.len(), outcome.elapsed);
                (outcome, findings)
            }
            Err(e) => {
                outcome.state = CheckState::Failed;
                outcome.error = Some(e.to_string());
                warn!(parent: &span, "Check {}.{} failed: {}", unit.group(), unit.name(), e);
                (outcome, Vec::new())
            }
        }
    }

    /// Earlier of the run deadline and this check's own timeout
    fn deadline_for(&self, ctx: &RunContext, started: Instant) -> Option<Instant> {
        let check_deadline = self.settings.check_timeout.map(|timeout| started + timeout);
        match (ctx.deadline, check_deadline) {
            (Some(run), Some(check)) => Some(run.min(check)),
            (run, check) => run.or(check),
        }
    }

    fn timeout_error(&self, started: Instant, deadline: Instant) -> CheckError {
        match self.settings.check_timeout {
            Some(timeout) if started + timeout == deadline => CheckError::TimedOut(timeout),
            _ => CheckError::DeadlineExceeded,
        }
    }
}

/// Pull every finding out of a check; the first error discards the rest
async fn drain(unit: &CheckUnit, ctx: RunContext) -> Result<Vec<Finding>, CheckError> {
    let mut stream = unit.invoke(ctx);
    let mut findings = Vec::new();
    while let Some(finding) = stream.next().await {
        findings.push(finding?);
    }
    Ok(findings)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
