/*!
Compliance findings in the AWS Security Finding Format (ASFF).

Findings serialise with the exact ASFF key names so every sink, from the
compliance API to the relational table, can rely on the same shape.
*/

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::FindingError;

/// ASFF schema version written on every finding
pub const SCHEMA_VERSION: &str = "2018-10-08";

/// Product name recorded in `ProductFields`
pub const PRODUCT_NAME: &str = "Posture Auditor";

/// Default finding type for configuration checks
pub const BEST_PRACTICES_TYPE: &str = "Software and Configuration Checks/AWS Security Best Practices";

/// One compliance assertion about one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Finding {
    pub schema_version: String,
    pub id: String,
    pub product_arn: String,
    pub generator_id: String,
    pub aws_account_id: String,
    pub types: Vec<String>,
    pub first_observed_at: String,
    pub created_at: String,
    pub updated_at: String,
    pub severity: Severity,
    pub confidence: u8,
    pub title: String,
    pub description: String,
    pub remediation: Remediation,
    pub product_fields: BTreeMap<String, String>,
    pub resources: Vec<Resource>,
    pub compliance: Compliance,
    pub workflow: Workflow,
    pub record_state: RecordState,
}

impl Finding {
    /// Start building a finding for the given account, region and partition
    pub fn builder(
        account_id: impl Into<String>,
        region: impl Into<String>,
        partition: impl Into<String>,
    ) -> FindingBuilder {
        FindingBuilder::new(account_id, region, partition)
    }

    /// The resource this finding is about
    pub fn resource(&self) -> Option<&Resource> {
        self.resources.first()
    }

    pub fn status(&self) -> ComplianceStatus {
        self.compliance.status
    }

    pub fn is_failed(&self) -> bool {
        self.compliance.status == ComplianceStatus::Failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Severity {
    pub label: SeverityLabel,
}

/// ASFF severity label
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SeverityLabel {
    #[default]
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

impl SeverityLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityLabel::Informational => "INFORMATIONAL",
            SeverityLabel::Low => "LOW",
            SeverityLabel::Medium => "MEDIUM",
            SeverityLabel::High => "HIGH",
            SeverityLabel::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for SeverityLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Remediation {
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Recommendation {
    pub text: String,
    pub url: String,
}

/// Reference to the inspected cloud resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    #[serde(rename = "Type")]
    pub resource_type: String,
    pub id: String,
    pub partition: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Compliance {
    pub status: ComplianceStatus,
    #[serde(default)]
    pub related_requirements: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ComplianceStatus {
    Passed,
    Failed,
}

impl ComplianceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceStatus::Passed => "PASSED",
            ComplianceStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Workflow {
    pub status: WorkflowStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowStatus {
    New,
    Resolved,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::New => "NEW",
            WorkflowStatus::Resolved => "RESOLVED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordState {
    Active,
    Archived,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Active => "ACTIVE",
            RecordState::Archived => "ARCHIVED",
        }
    }
}

/// Builder for findings; `build` validates required fields
#[derive(Debug, Clone)]
pub struct FindingBuilder {
    account_id: String,
    region: String,
    partition: String,
    check_slug: Option<String>,
    title: Option<String>,
    description: Option<String>,
    severity: SeverityLabel,
    confidence: u8,
    types: Vec<String>,
    remediation_text: String,
    remediation_url: String,
    resource_type: Option<String>,
    resource_id: Option<String>,
    generator_id: Option<String>,
    details: Option<Value>,
    related_requirements: Vec<String>,
    status: Option<ComplianceStatus>,
    observed_at: Option<String>,
}

impl FindingBuilder {
    pub fn new(
        account_id: impl Into<String>,
        region: impl Into<String>,
        partition: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
            partition: partition.into(),
            check_slug: None,
            title: None,
            description: None,
            severity: SeverityLabel::Informational,
            confidence: 99,
            types: Vec::new(),
            remediation_text: String::new(),
            remediation_url: String::new(),
            resource_type: None,
            resource_id: None,
            generator_id: None,
            details: None,
            related_requirements: Vec::new(),
            status: None,
            observed_at: None,
        }
    }

    /// Stable suffix naming the check; the finding id is `{resource_id}/{check_slug}`
    pub fn check(mut self, slug: impl Into<String>) -> Self {
        self.check_slug = Some(slug.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn severity(mut self, severity: SeverityLabel) -> Self {
        self.severity = severity;
        self
    }

    pub fn confidence(mut self, confidence: u8) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn finding_type(mut self, finding_type: impl Into<String>) -> Self {
        self.types.push(finding_type.into());
        self
    }

    pub fn remediation(mut self, text: impl Into<String>, url: impl Into<String>) -> Self {
        self.remediation_text = text.into();
        self.remediation_url = url.into();
        self
    }

    /// Resource type and id; the id doubles as the generator id unless overridden
    pub fn resource(mut self, resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(id.into());
        self
    }

    pub fn generator(mut self, generator_id: impl Into<String>) -> Self {
        self.generator_id = Some(generator_id.into());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn related_requirements<I, S>(mut self, requirements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.related_requirements = requirements.into_iter().map(Into::into).collect();
        self
    }

    /// Override the observation timestamp (RFC 3339); defaults to now
    pub fn observed_at(mut self, timestamp: impl Into<String>) -> Self {
        self.observed_at = Some(timestamp.into());
        self
    }

    /// Compliant resource: PASSED, workflow RESOLVED, record ARCHIVED
    pub fn passed(mut self) -> Self {
        self.status = Some(ComplianceStatus::Passed);
        self
    }

    /// Non-compliant resource: FAILED, workflow NEW, record ACTIVE
    pub fn failed(mut self) -> Self {
        self.status = Some(ComplianceStatus::Failed);
        self
    }

    pub fn status(mut self, status: ComplianceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn build(self) -> Result<Finding, FindingError> {
        let check_slug = non_empty(self.check_slug, "check")?;
        let title = non_empty(self.title, "Title")?;
        let description = non_empty(self.description, "Description")?;
        let resource_type = non_empty(self.resource_type, "Resources.Type")?;
        let resource_id = non_empty(self.resource_id, "Resources.Id")?;
        let status = self.status.ok_or(FindingError::MissingField("Compliance.Status"))?;
        if self.account_id.is_empty() {
            return Err(FindingError::MissingField("AwsAccountId"));
        }
        if self.confidence > 100 {
            return Err(FindingError::InvalidConfidence(self.confidence));
        }

        let (workflow, record_state) = match status {
            ComplianceStatus::Passed => (WorkflowStatus::Resolved, RecordState::Archived),
            ComplianceStatus::Failed => (WorkflowStatus::New, RecordState::Active),
        };
        let observed_at = self
            .observed_at
            .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        let types = if self.types.is_empty() {
            vec![BEST_PRACTICES_TYPE.to_string()]
        } else {
            self.types
        };

        Ok(Finding {
            schema_version: SCHEMA_VERSION.to_string(),
            id: format!("{resource_id}/{check_slug}"),
            product_arn: product_arn(&self.partition, &self.region, &self.account_id),
            generator_id: self.generator_id.unwrap_or_else(|| resource_id.clone()),
            aws_account_id: self.account_id,
            types,
            first_observed_at: observed_at.clone(),
            created_at: observed_at.clone(),
            updated_at: observed_at,
            severity: Severity {
                label: self.severity,
            },
            confidence: self.confidence,
            title,
            description,
            remediation: Remediation {
                recommendation: Recommendation {
                    text: self.remediation_text,
                    url: self.remediation_url,
                },
            },
            product_fields: BTreeMap::from([(
                "Product Name".to_string(),
                PRODUCT_NAME.to_string(),
            )]),
            resources: vec![Resource {
                resource_type,
                id: resource_id,
                partition: self.partition,
                region: self.region,
                details: self.details,
            }],
            compliance: Compliance {
                status,
                related_requirements: self.related_requirements,
            },
            workflow: Workflow { status: workflow },
            record_state,
        })
    }
}

fn non_empty(value: Option<String>, field: &'static str) -> Result<String, FindingError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(FindingError::MissingField(field)),
    }
}

/// Security Hub product ARN findings are imported under
pub fn product_arn(partition: &str, region: &str, account_id: &str) -> String {
    format!("arn:{partition}:securityhub:{region}:{account_id}:product/{account_id}/default")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ami(public: bool) -> Finding {
        let builder = Finding::builder("111122223333", "us-east-1", "aws")
            .check("public-ami")
            .title("[AMI.1] Self-managed Amazon Machine Images (AMIs) should not be public")
            .description("AMI web-base is checked for public exposure")
            .resource("AwsEc2Image", "arn:aws:ec2:us-east-1::image/ami-0abc")
            .remediation(
                "Refer to the Sharing an AMI with Specific AWS Accounts section",
                "https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/sharingamis-explicit.html",
            )
            .related_requirements(["NIST CSF PR.AC-3"]);
        if public {
            builder.severity(SeverityLabel::Critical).failed().build().unwrap()
        } else {
            builder.passed().build().unwrap()
        }
    }

    #[test]
    fn finding_id_is_resource_and_check() {
        let finding = ami(true);
        assert_eq!(finding.id, "arn:aws:ec2:us-east-1::image/ami-0abc/public-ami");
        assert_eq!(finding.generator_id, "arn:aws:ec2:us-east-1::image/ami-0abc");
        assert_eq!(
            finding.product_arn,
            "arn:aws:securityhub:us-east-1:111122223333:product/111122223333/default"
        );
    }

    #[test]
    fn fixed_resource_keeps_id_and_archives() {
        let before = ami(true);
        let after = ami(false);

        assert_eq!(before.id, after.id);
        assert_eq!(before.status(), ComplianceStatus::Failed);
        assert_eq!(before.workflow.status, WorkflowStatus::New);
        assert_eq!(before.record_state, RecordState::Active);

        assert_eq!(after.status(), ComplianceStatus::Passed);
        assert_eq!(after.workflow.status, WorkflowStatus::Resolved);
        assert_eq!(after.record_state, RecordState::Archived);
    }

    #[test]
    fn missing_fields_are_rejected_at_build_time() {
        let err = Finding::builder("111122223333", "us-east-1", "aws")
            .check("public-ami")
            .description("no title")
            .resource("AwsEc2Image", "arn:aws:ec2:us-east-1::image/ami-0abc")
            .failed()
            .build()
            .unwrap_err();
        assert_eq!(err, FindingError::MissingField("Title"));

        let err = Finding::builder("111122223333", "us-east-1", "aws")
            .check("public-ami")
            .title("t")
            .description("d")
            .resource("AwsEc2Image", "arn")
            .build()
            .unwrap_err();
        assert_eq!(err, FindingError::MissingField("Compliance.Status"));

        let err = Finding::builder("111122223333", "us-east-1", "aws")
            .check("public-ami")
            .title("t")
            .description("d")
            .resource("AwsEc2Image", "arn")
            .confidence(101)
            .passed()
            .build()
            .unwrap_err();
        assert_eq!(err, FindingError::InvalidConfidence(101));
    }

    #[test]
    fn serialises_with_asff_keys() {
        let json = serde_json::to_value(ami(true)).unwrap();

        assert_eq!(json["SchemaVersion"], "2018-10-08");
        assert_eq!(json["AwsAccountId"], "111122223333");
        assert_eq!(json["Severity"]["Label"], "CRITICAL");
        assert_eq!(json["Compliance"]["Status"], "FAILED");
        assert_eq!(json["Compliance"]["RelatedRequirements"][0], "NIST CSF PR.AC-3");
        assert_eq!(json["Workflow"]["Status"], "NEW");
        assert_eq!(json["RecordState"], "ACTIVE");
        assert_eq!(json["Resources"][0]["Type"], "AwsEc2Image");
        assert_eq!(json["Resources"][0]["Partition"], "aws");
        assert_eq!(json["ProductFields"]["Product Name"], PRODUCT_NAME);
        assert_eq!(json["Types"][0], BEST_PRACTICES_TYPE);
        assert!(json["Resources"][0].get("Details").is_none());
        assert!(json["Remediation"]["Recommendation"]["Url"].is_string());
    }

    #[test]
    fn severity_labels_order_by_impact() {
        assert!(SeverityLabel::Critical > SeverityLabel::High);
        assert!(SeverityLabel::Low > SeverityLabel::Informational);
        assert_eq!(SeverityLabel::Medium.to_string(), "MEDIUM");
    }
}
