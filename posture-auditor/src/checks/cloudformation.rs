/*!
CloudFormation stack checks
*/

use std::sync::Arc;

use async_stream::try_stream;
use futures::Stream;
use serde_json::{Value, json};

use super::{array, string};
use crate::core::context::RunContext;
use crate::core::error::{CheckError, RegistryError};
use crate::core::finding::{Finding, FindingBuilder, SeverityLabel};
use crate::core::registry::CheckRegistry;
use crate::register_check;

const GROUP: &str = "cloudformation";

const REQUIREMENTS: [&str; 5] = [
    "NIST CSF PR.MA-1",
    "NIST SP 800-53 MA-2",
    "NIST SP 800-53 MA-3",
    "AICPA TSC CC8.1",
    "ISO 27001:2013 A.11.2.4",
];

pub fn register(registry: &mut CheckRegistry) -> Result<(), RegistryError> {
    register_check!(registry, GROUP, cfn_drift_check)?;
    register_check!(registry, GROUP, cfn_monitoring_check)?;
    Ok(())
}

async fn describe_stacks(ctx: &RunContext) -> Result<Arc<Value>, CheckError> {
    Ok(ctx
        .cached("cloudformation.describe_stacks", "cloudformation", "DescribeStacks", json!({}))
        .await?)
}

fn stack_finding(ctx: &RunContext, slug: &str, stack: &Value) -> Result<FindingBuilder, CheckError> {
    let stack_id = string(stack, "StackId")?;
    Ok(ctx
        .finding(slug)
        .resource("AwsCloudFormationStack", stack_id)
        .details(json!({ "Other": { "StackName": string(stack, "StackName")? } }))
        .related_requirements(REQUIREMENTS))
}

/// [CloudFormation.1] CloudFormation stacks should be monitored for configuration drift
pub fn cfn_drift_check(ctx: RunContext) -> impl Stream<Item = Result<Finding, CheckError>> {
    try_stream! {
        let stacks = describe_stacks(&ctx).await?;
        for stack in array(&stacks, "Stacks")? {
            let name = string(stack, "StackName")?;
            let drift = stack
                .get("DriftInformation")
                .and_then(|drift| drift.get("StackDriftStatus"))
                .and_then(Value::as_str)
                .unwrap_or("NOT_CHECKED");
            let builder = stack_finding(&ctx, "cloudformation-drift-check", stack)?
                .title("[CloudFormation.1] CloudFormation stacks should be monitored for configuration drift")
                .remediation(
                    "To learn more about drift detection refer to the Detecting Unmanaged Configuration Changes to Stacks and Resources section of the AWS CloudFormation User Guide",
                    "https://docs.aws.amazon.com/AWSCloudFormation/latest/UserGuide/using-cfn-stack-drift.html",
                );

            let finding = if drift == "IN_SYNC" {
                builder
                    .description(format!(
                        "CloudFormation stack {name} is being monitored for drift and is in sync."
                    ))
                    .passed()
            } else {
                builder
                    .severity(SeverityLabel::Low)
                    .description(format!(
                        "CloudFormation stack {name} is either not in-sync with drift or is not monitored for drift. Refer to the remediation instructions if this configuration is not intended."
                    ))
                    .failed()
            };
            yield finding.build()?;
        }
    }
}

/// [CloudFormation.2] CloudFormation stacks should be monitored for changes
pub fn cfn_monitoring_check(ctx: RunContext) -> impl Stream<Item = Result<Finding, CheckError>> {
    try_stream! {
        let stacks = describe_stacks(&ctx).await?;
        for stack in array(&stacks, "Stacks")? {
            let name = string(stack, "StackName")?;
            let notified = stack
                .get("NotificationARNs")
                .and_then(Value::as_array)
                .is_some_and(|arns| !arns.is_empty());
            let builder = stack_finding(&ctx, "cloudformation-monitoring-check", stack)?
                .title("[CloudFormation.2] CloudFormation stacks should be monitored for changes")
                .remediation(
                    "If your stack should having monitoring enabled refer to the Monitor and Roll Back Stack Operations section of the AWS CloudFormation User Guide",
                    "https://docs.aws.amazon.com/AWSCloudFormation/latest/UserGuide/using-cfn-rollback-triggers.html",
                );

            let finding = if notified {
                builder
                    .description(format!("CloudFormation stack {name} has monitoring enabled."))
                    .passed()
            } else {
                builder
                    .severity(SeverityLabel::Low)
                    .description(format!(
                        "CloudFormation stack {name} does not have monitoring enabled. Refer to the remediation instructions if this configuration is not intended."
                    ))
                    .failed()
            };
            yield finding.build()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::testing::{collect, context};
    use crate::core::finding::ComplianceStatus;

    fn stacks() -> Value {
        json!({
            "cloudformation": {
                "DescribeStacks": {
                    "Stacks": [
                        {
                            "StackName": "network",
                            "StackId": "arn:aws:cloudformation:us-east-1:111122223333:stack/network/1",
                            "DriftInformation": { "StackDriftStatus": "IN_SYNC" },
                            "NotificationARNs": []
                        },
                        {
                            "StackName": "app",
                            "StackId": "arn:aws:cloudformation:us-east-1:111122223333:stack/app/2",
                            "DriftInformation": { "StackDriftStatus": "DRIFTED" },
                            "NotificationARNs": ["arn:aws:sns:us-east-1:111122223333:stack-events"]
                        }
                    ]
                }
            }
        })
    }

    #[tokio::test]
    async fn drifted_stack_fails() {
        let findings = collect(cfn_drift_check(context(stacks()))).await.unwrap();
        let statuses: Vec<_> = findings.iter().map(|f| f.status()).collect();
        assert_eq!(statuses, vec![ComplianceStatus::Passed, ComplianceStatus::Failed]);
        assert_eq!(
            findings[1].id,
            "arn:aws:cloudformation:us-east-1:111122223333:stack/app/2/cloudformation-drift-check"
        );
    }

    #[tokio::test]
    async fn stack_without_notifications_fails() {
        let findings = collect(cfn_monitoring_check(context(stacks()))).await.unwrap();
        let statuses: Vec<_> = findings.iter().map(|f| f.status()).collect();
        assert_eq!(statuses, vec![ComplianceStatus::Failed, ComplianceStatus::Passed]);
        assert_eq!(findings[0].severity.label, SeverityLabel::Low);
    }

    #[tokio::test]
    async fn malformed_stack_fails_the_check() {
        let ctx = context(json!({
            "cloudformation": { "DescribeStacks": { "Stacks": [{ "StackName": "no-id" }] } }
        }));
        let err = collect(cfn_drift_check(ctx)).await.unwrap_err();
        assert!(matches!(err, CheckError::Response(_)));
    }
}
