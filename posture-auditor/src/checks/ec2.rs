/*!
Checks for self-owned Amazon Machine Images
*/

use std::sync::Arc;

use async_stream::try_stream;
use futures::Stream;
use serde_json::{Value, json};

use super::{array, string};
use crate::core::context::RunContext;
use crate::core::error::{CheckError, RegistryError};
use crate::core::finding::{BEST_PRACTICES_TYPE, Finding, FindingBuilder, SeverityLabel};
use crate::core::registry::CheckRegistry;
use crate::register_check;

const GROUP: &str = "ec2";

pub fn register(registry: &mut CheckRegistry) -> Result<(), RegistryError> {
    register_check!(registry, GROUP, public_ami_check)?;
    register_check!(registry, GROUP, encrypted_ami_check)?;
    Ok(())
}

/// Images owned by the audited account, listed once per run
async fn describe_images(ctx: &RunContext) -> Result<Arc<Value>, CheckError> {
    let request = json!({
        "Filters": [{ "Name": "owner-id", "Values": [&*ctx.account_id] }]
    });
    Ok(ctx
        .cached("ec2.describe_images", "ec2", "DescribeImages", request)
        .await?)
}

/// Builder pre-filled with what both image checks share
fn image_finding(ctx: &RunContext, slug: &str, image: &Value) -> Result<FindingBuilder, CheckError> {
    let image_id = string(image, "ImageId")?;
    let arn = ctx.arn("ec2", &ctx.region, "", &format!("image/{image_id}"));
    Ok(ctx
        .finding(slug)
        .finding_type(BEST_PRACTICES_TYPE)
        .finding_type("Effects/Data Exposure")
        .resource("AwsEc2Image", arn)
        .details(json!({
            "Other": {
                "ImageId": image_id,
                "ImageCreatedDate": image.get("CreationDate").and_then(Value::as_str).unwrap_or_default(),
            }
        })))
}

/// `Encrypted` flag of every EBS block device mapping on an image
fn ebs_encryption(image: &Value) -> Vec<bool> {
    image
        .get("BlockDeviceMappings")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(|mapping| mapping.get("Ebs")?.get("Encrypted")?.as_bool())
        .collect()
}

/// [AMI.1] Self-managed Amazon Machine Images (AMIs) should not be public
pub fn public_ami_check(ctx: RunContext) -> impl Stream<Item = Result<Finding, CheckError>> {
    try_stream! {
        let images = describe_images(&ctx).await?;
        for image in array(&images, "Images")? {
            let name = string(image, "Name")?;
            let public = image.get("Public").and_then(Value::as_bool).unwrap_or(false);
            let builder = image_finding(&ctx, "public-ami", image)?
                .title("[AMI.1] Self-managed Amazon Machine Images (AMIs) should not be public")
                .remediation(
                    "If your AMI is not intended to be public refer to the Sharing an AMI with Specific AWS Accounts section of the EC2 user guide",
                    "https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/sharingamis-explicit.html",
                )
                .related_requirements([
                    "NIST CSF PR.AC-3",
                    "NIST SP 800-53 AC-1",
                    "NIST SP 800-53 AC-17",
                    "NIST SP 800-53 SC-15",
                    "AICPA TSC CC6.6",
                    "ISO 27001:2013 A.13.1.1",
                ]);

            let finding = if public {
                builder
                    .severity(SeverityLabel::Critical)
                    .description(format!(
                        "Amazon Machine Image (AMI) {name} is exposed to the public. Refer to the remediation instructions if this configuration is not intended"
                    ))
                    .failed()
            } else {
                builder
                    .description(format!("Amazon Machine Image (AMI) {name} is private."))
                    .passed()
            };
            yield finding.build()?;
        }
    }
}

/// [AMI.2] Self-managed Amazon Machine Images (AMIs) should be encrypted
///
/// An image passes when every EBS mapping is encrypted; images without EBS
/// mappings are skipped.
pub fn encrypted_ami_check(ctx: RunContext) -> impl Stream<Item = Result<Finding, CheckError>> {
    try_stream! {
        let images = describe_images(&ctx).await?;
        for image in array(&images, "Images")? {
            let name = string(image, "Name")?;
            let encryption = ebs_encryption(image);
            if encryption.is_empty() {
                continue;
            }

            let builder = image_finding(&ctx, "encrypted-ami", image)?
                .title("[AMI.2] Self-managed Amazon Machine Images (AMIs) should be encrypted")
                .remediation(
                    "If your AMI should be encrypted refer to the Image-Copying Scenarios section of the EC2 user guide",
                    "https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/AMIEncryption.html#AMI-encryption-copy",
                )
                .related_requirements([
                    "NIST CSF PR.DS-1",
                    "NIST SP 800-53 MP-8",
                    "NIST SP 800-53 SC-12",
                    "NIST SP 800-53 SC-28",
                    "AICPA TSC CC6.1",
                    "ISO 27001:2013 A.8.2.3",
                ]);

            let finding = if encryption.iter().all(|encrypted| *encrypted) {
                builder
                    .description(format!("Amazon Machine Image (AMI) {name} is encrypted."))
                    .passed()
            } else {
                builder
                    .severity(SeverityLabel::High)
                    .description(format!(
                        "Amazon Machine Image (AMI) {name} is not encrypted. Refer to the remediation instructions if this configuration is not intended"
                    ))
                    .failed()
            };
            yield finding.build()?;
        }
    }
}
