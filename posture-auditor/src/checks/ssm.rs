/*!
Systems Manager checks
*/

use async_stream::try_stream;
use futures::Stream;
use serde_json::{Value, json};

use super::{array, string};
use crate::core::context::RunContext;
use crate::core::error::{CheckError, RegistryError};
use crate::core::finding::{BEST_PRACTICES_TYPE, Finding, SeverityLabel};
use crate::core::registry::CheckRegistry;
use crate::register_check;

const GROUP: &str = "ssm";

const AGENT_UPDATE_DOCUMENT: &str = "AWS-UpdateSSMAgent";

pub fn register(registry: &mut CheckRegistry) -> Result<(), RegistryError> {
    register_check!(registry, GROUP, ssm_self_owned_document_public_share_check)?;
    register_check!(registry, GROUP, ssm_update_ssm_agent_association_check)?;
    Ok(())
}

/// [SSM.1] Self-owned SSM Documents should not be publicly shared
pub fn ssm_self_owned_document_public_share_check(
    ctx: RunContext,
) -> impl Stream<Item = Result<Finding, CheckError>> {
    try_stream! {
        let documents = ctx
            .cached(
                "ssm.list_documents.self",
                "ssm",
                "ListDocuments",
                json!({ "Filters": [{ "Key": "Owner", "Values": ["Self"] }] }),
            )
            .await?;

        for document in array(&documents, "DocumentIdentifiers")? {
            let name = string(document, "Name")?;
            // per-document lookups are never shared between checks
            let permission = ctx
                .clients
                .invoke(
                    "ssm",
                    "DescribeDocumentPermission",
                    json!({ "Name": name, "PermissionType": "Share" }),
                )
                .await?;
            let public = array(&permission, "AccountIds")?
                .iter()
                .any(|account| account.as_str() == Some("all"));

            let arn = ctx.arn("ssm", &ctx.region, &ctx.account_id, &format!("document/{name}"));
            let builder = ctx
                .finding("self-owned-ssm-doc-public-check")
                .title("[SSM.1] Self-owned SSM Documents should not be publicly shared")
                .finding_type(BEST_PRACTICES_TYPE)
                .finding_type("Effects/Data Exposure")
                .resource("AwsSsmDocument", arn)
                .details(json!({
                    "Other": {
                        "Name": name,
                        "DocumentType": document.get("DocumentType").and_then(Value::as_str).unwrap_or_default(),
                    }
                }))
                .remediation(
                    "For more information on sharing SSM Documents refer to the Share an SSM document section of the AWS Systems Manager User Guide",
                    "https://docs.aws.amazon.com/systems-manager/latest/userguide/ssm-how-to-share.html",
                )
                .related_requirements([
                    "NIST CSF PR.AC-3",
                    "NIST SP 800-53 AC-1",
                    "AICPA TSC CC6.6",
                    "ISO 27001:2013 A.6.2.1",
                ]);

            let finding = if public {
                builder
                    .severity(SeverityLabel::High)
                    .description(format!(
                        "AWS Systems Manager Document {name} is publicly shared. SSM Documents may contain direct or indirect references to sensitive values and business logic and should only be shared with AWS Accounts who have a 'need to know'. If this configuration is not intended refer to the remediation instructions."
                    ))
                    .failed()
            } else {
                builder
                    .description(format!("AWS Systems Manager Document {name} is not publicly shared."))
                    .passed()
            };
            yield finding.build()?;
        }
    }
}

/// [SSM.2] AWS State Manager should be used to update SSM Agents for all EC2 instances in your Region
///
/// Account-level check; a region without instances yields nothing.
pub fn ssm_update_ssm_agent_association_check(
    ctx: RunContext,
) -> impl Stream<Item = Result<Finding, CheckError>> {
    try_stream! {
        let instances = ctx
            .cached(
                "ec2.describe_instances.running_or_stopped",
                "ec2",
                "DescribeInstances",
                json!({
                    "Filters": [{ "Name": "instance-state-name", "Values": ["running", "stopped"] }]
                }),
            )
            .await?;
        let mut instance_count = 0;
        for reservation in array(&instances, "Reservations")? {
            instance_count += array(reservation, "Instances")?.len();
        }

        if instance_count > 0 {
            let associations = ctx
                .cached("ssm.list_associations", "ssm", "ListAssociations", json!({}))
                .await?;
            let mut agent_associations = Vec::new();
            for association in array(&associations, "Associations")? {
                if string(association, "Name")? == AGENT_UPDATE_DOCUMENT {
                    agent_associations.push(association);
                }
            }
            let targets_everything = agent_associations.iter().any(|association| {
                association
                    .get("Targets")
                    .and_then(Value::as_array)
                    .is_some_and(|targets| targets.iter().any(targets_all_instances))
            });

            let builder = ctx
                .finding("ssm-state-mgr-ssm-agent-update-check")
                .title("[SSM.2] AWS State Manager should be used to update SSM Agents for all EC2 instances in your Region")
                .resource("AwsAccount", format!("{}/{}", ctx.account_id, ctx.region))
                .details(json!({ "Other": { "InstanceCount": instance_count.to_string() } }))
                .remediation(
                    "To learn how to set up a State Manager association to update the SSM Agent refer to the Systems Manager best practices section of the AWS Systems Manager User Guide",
                    "https://docs.aws.amazon.com/systems-manager/latest/userguide/systems-manager-best-practices.html",
                )
                .related_requirements([
                    "NIST CSF ID.AM-2",
                    "NIST SP 800-53 CM-8",
                    "AICPA TSC CC6.1",
                    "ISO 27001:2013 A.8.1.1",
                ]);

            let finding = if targets_everything {
                builder
                    .description(format!(
                        "AWS Account {} for AWS Region {} has a State Manager Association to update SSM Agents for EC2 that targets all instances.",
                        ctx.account_id, ctx.region
                    ))
                    .passed()
            } else if agent_associations.is_empty() {
                builder
                    .severity(SeverityLabel::Medium)
                    .description(format!(
                        "AWS Account {} for AWS Region {} does not have a State Manager Association to update SSM Agents for EC2. Refer to the remediation instructions if this configuration is not intended.",
                        ctx.account_id, ctx.region
                    ))
                    .failed()
            } else {
                builder
                    .severity(SeverityLabel::Low)
                    .description(format!(
                        "AWS Account {} for AWS Region {} has a State Manager Association to update SSM Agents for EC2, but it does not target all current and future instances. Refer to the remediation instructions if this configuration is not intended.",
                        ctx.account_id, ctx.region
                    ))
                    .failed()
            };
            yield finding.build()?;
        }
    }
}

/// `InstanceIds` target containing the `*` wildcard
fn targets_all_instances(target: &Value) -> bool {
    target.get("Key").and_then(Value::as_str) == Some("InstanceIds")
        && target
            .get("Values")
            .and_then(Value::as_array)
            .is_some_and(|values| values.iter().any(|value| value.as_str() == Some("*")))
}
