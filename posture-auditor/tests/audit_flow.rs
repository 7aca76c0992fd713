use std::sync::{Arc, Mutex};

use async_stream::try_stream;
use async_trait::async_trait;
use cloud_inventory::{ApiError, ServiceClients, snapshot::Snapshot};
use futures::Stream;
use serde_json::json;

use posture_auditor::core::{
    auditor::Auditor,
    config::{AuditorConfig, OutputsConfig},
    context::RunContext,
    engine::{AuditEngine, CheckState, EngineSettings},
    error::{CheckError, ConfigError, OutputError},
    finding::{ComplianceStatus, Finding},
    output_plugins::{OutputDispatcher, OutputProvider, OutputRegistry, dispatch},
    registry::{CheckRegistry, GroupSelection},
};
use posture_auditor::register_check;

/// Keeps every batch it receives
#[derive(Clone, Default)]
struct MemorySink {
    batches: Arc<Mutex<Vec<Vec<String>>>>,
}

#[async_trait]
impl OutputProvider for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write_findings(&mut self, findings: &[Finding]) -> Result<(), OutputError> {
        self.batches
            .lock()
            .unwrap()
            .push(findings.iter().map(|finding| finding.id.clone()).collect());
        Ok(())
    }
}

struct FailingSink;

#[async_trait]
impl OutputProvider for FailingSink {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn write_findings(&mut self, _findings: &[Finding]) -> Result<(), OutputError> {
        Err(OutputError::Api {
            status: 503,
            message: "service unavailable".into(),
        })
    }
}

fn failing_factory(_: &OutputsConfig) -> Result<Box<dyn OutputProvider>, ConfigError> {
    Ok(Box::new(FailingSink))
}

fn instance_finding(ctx: &RunContext, instance: &str, status: ComplianceStatus) -> Result<Finding, CheckError> {
    Ok(ctx
        .finding("instance-check")
        .title("Instances should be checked")
        .description(format!("instance {instance}"))
        .resource("AwsEc2Instance", instance)
        .status(status)
        .build()?)
}

fn instance_check(ctx: RunContext) -> impl Stream<Item = Result<Finding, CheckError>> {
    try_stream! {
        let listing = ctx
            .cached("ec2.describe_instances", "ec2", "DescribeInstances", json!({}))
            .await?;
        for instance in listing["Instances"].as_array().into_iter().flatten() {
            let id = instance.as_str().unwrap_or_default();
            yield instance_finding(&ctx, id, ComplianceStatus::Failed)?;
        }
    }
}

fn protection_check(ctx: RunContext) -> impl Stream<Item = Result<Finding, CheckError>> {
    try_stream! {
        let listing = ctx
            .cached("ec2.describe_instances", "ec2", "DescribeInstances", json!({}))
            .await?;
        let first = listing["Instances"][0].as_str().unwrap_or_default().to_string();
        yield instance_finding(&ctx, &first, ComplianceStatus::Passed)?;
    }
}

fn denied_check(_ctx: RunContext) -> impl Stream<Item = Result<Finding, CheckError>> {
    try_stream! {
        Err::<(), _>(ApiError::Service {
            code: "AccessDeniedException".into(),
            message: "no access".into(),
        })?;
        // Unreachable; only pins the stream's item type to `Finding`.
        #[allow(unreachable_code, unused_variables)]
        {
            let finding: Finding = unreachable!();
            yield finding;
        }
    }
}

fn registry() -> CheckRegistry {
    let mut registry = CheckRegistry::new();
    register_check!(registry, "ec2", instance_check).unwrap();
    register_check!(registry, "shield", denied_check).unwrap();
    register_check!(registry, "shield", protection_check).unwrap();
    registry
}

fn clients() -> Arc<ServiceClients> {
    let snapshot = Snapshot::from_value(json!({
        "services": {
            "ec2": { "DescribeInstances": { "Instances": ["i-aaa", "i-bbb"] } }
        }
    }))
    .unwrap();
    Arc::new(ServiceClients::from_snapshot(snapshot))
}

fn config() -> AuditorConfig {
    let mut config = AuditorConfig::default();
    config.run.account_id = "111122223333".into();
    config.run.region = "us-east-1".into();
    config
}

#[tokio::test]
async fn findings_flow_in_check_order_to_every_output() {
    let registry = registry();
    let sink = MemorySink::default();
    let dispatcher = OutputDispatcher::new(vec![Box::new(sink.clone())]);
    let mut auditor = Auditor::from_parts(
        config(),
        &registry,
        GroupSelection::All,
        clients(),
        dispatcher,
    );

    let summary = auditor.run().await.unwrap();

    let expected = vec![
        "i-aaa/instance-check".to_string(),
        "i-bbb/instance-check".to_string(),
        "i-aaa/instance-check".to_string(),
    ];
    let ids: Vec<_> = summary.report.findings.iter().map(|f| f.id.clone()).collect();
    assert_eq!(ids, expected);
    assert_eq!(*sink.batches.lock().unwrap(), vec![expected]);

    // the denied check fails alone; the listing was fetched once for both users
    let states: Vec<_> = summary.report.outcomes.iter().map(|o| (o.check, o.state)).collect();
    assert_eq!(
        states,
        vec![
            ("instance_check", CheckState::Completed),
            ("denied_check", CheckState::Failed),
            ("protection_check", CheckState::Completed),
        ]
    );
    assert_eq!((summary.cache.misses, summary.cache.hits), (1, 1));
    assert!(summary.has_failures());
    assert!(summary.dispatch.is_success());
}

#[tokio::test]
async fn parallel_runs_match_sequential_runs() {
    let registry = registry();
    let ctx = RunContext::new("111122223333", "us-east-1", "aws", clients());

    let sequential = AuditEngine::new(&registry, EngineSettings::default())
        .run(&GroupSelection::All, &ctx)
        .await
        .unwrap();
    let parallel = AuditEngine::new(
        &registry,
        EngineSettings {
            max_concurrent_checks: 3,
            check_timeout: None,
        },
    )
    .run(&GroupSelection::All, &ctx)
    .await
    .unwrap();

    let ids = |findings: &[Finding]| findings.iter().map(|f| f.id.clone()).collect::<Vec<_>>();
    assert_eq!(ids(&sequential.findings), ids(&parallel.findings));
}

#[tokio::test]
async fn group_selection_limits_the_run() {
    let registry = registry();
    let ctx = RunContext::new("111122223333", "us-east-1", "aws", clients());

    let report = AuditEngine::new(&registry, EngineSettings::default())
        .run(&GroupSelection::Named(vec!["shield".into()]), &ctx)
        .await
        .unwrap();

    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.outcomes.len(), 2);
}

#[tokio::test]
async fn failing_output_does_not_block_the_others() {
    let mut outputs = OutputRegistry::with_builtin();
    outputs.register("failing", failing_factory).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("findings.json");
    let outputs_config: OutputsConfig = toml::from_str(&format!(
        "providers = [\"failing\", \"json\"]\n[json]\npath = {:?}\n",
        path.display().to_string()
    ))
    .unwrap();

    let ctx = RunContext::new("111122223333", "us-east-1", "aws", clients());
    let report = AuditEngine::new(&registry(), EngineSettings::default())
        .run(&GroupSelection::All, &ctx)
        .await
        .unwrap();

    let dispatched = dispatch(
        &outputs,
        &report.findings,
        &outputs_config.providers,
        &outputs_config,
    )
    .await
    .unwrap();

    assert_eq!(dispatched.delivered, vec!["json"]);
    assert_eq!(dispatched.failures.providers().collect::<Vec<_>>(), vec!["failing"]);
    let written: Vec<Finding> =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written.len(), 3);
    assert!(dispatched.into_result().is_err());
}

#[tokio::test]
async fn repeated_ids_from_two_checks_all_reach_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("findings.db");
    let outputs_config: OutputsConfig = toml::from_str(&format!(
        "providers = [\"sqlite\"]\n[sqlite]\npath = {:?}\n",
        path.display().to_string()
    ))
    .unwrap();

    let ctx = RunContext::new("111122223333", "us-east-1", "aws", clients());
    let report = AuditEngine::new(&registry(), EngineSettings::default())
        .run(&GroupSelection::All, &ctx)
        .await
        .unwrap();
    // instance_check and protection_check both report i-aaa/instance-check
    assert_eq!(report.findings[0].id, report.findings[2].id);

    let dispatched = dispatch(
        &OutputRegistry::with_builtin(),
        &report.findings,
        &outputs_config.providers,
        &outputs_config,
    )
    .await
    .unwrap();
    assert!(dispatched.is_success());

    let conn = rusqlite::Connection::open(&path).unwrap();
    let stored: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM findings WHERE findingid = 'i-aaa/instance-check'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(stored, 2);
}
