/*!
Shield Advanced protection checks.

Protections are listed once per run and shared by every check in the group.
*/

use std::collections::HashSet;

use async_stream::try_stream;
use futures::Stream;
use serde_json::{Value, json};

use super::{array, string};
use crate::core::context::RunContext;
use crate::core::error::{CheckError, RegistryError};
use crate::core::finding::{Finding, SeverityLabel};
use crate::core::registry::CheckRegistry;
use crate::register_check;

const GROUP: &str = "shield";

const REMEDIATION_TEXT: &str = "For information on adding Shield Advanced protection to resources refer to the Adding AWS Shield Advanced Protection to AWS Resources section of the AWS WAF, AWS Firewall Manager, and AWS Shield Advanced Developer Guide";
const REMEDIATION_URL: &str =
    "https://docs.aws.amazon.com/waf/latest/developerguide/configure-new-protection.html";
const REQUIREMENTS: [&str; 6] = [
    "NIST CSF ID.BE-5",
    "NIST CSF PR.PT-5",
    "NIST SP 800-53 CP-2",
    "AICPA TSC A1.2",
    "ISO 27001:2013 A.17.1.1",
    "MITRE ATT&CK T1498",
];

pub fn register(registry: &mut CheckRegistry) -> Result<(), RegistryError> {
    register_check!(registry, GROUP, shield_advanced_route_53_protection_check)?;
    register_check!(registry, GROUP, shield_advanced_elb_protection_check)?;
    register_check!(registry, GROUP, shield_advanced_elb_v2_protection_check)?;
    Ok(())
}

/// ARNs of every resource with a Shield Advanced protection
async fn protected_arns(ctx: &RunContext) -> Result<HashSet<String>, CheckError> {
    let response = match ctx
        .cached("shield.list_protections", "shield", "ListProtections", json!({}))
        .await
    {
        Ok(response) => response,
        // an account without any protection answers ResourceNotFoundException
        Err(e) if e.is_not_found() => return Ok(HashSet::new()),
        Err(e) => return Err(e.into()),
    };
    array(&response, "Protections")?
        .iter()
        .map(|protection| string(protection, "ResourceArn").map(str::to_string))
        .collect()
}

/// One protected/unprotected resource
struct Protection<'a> {
    slug: &'a str,
    title: &'a str,
    resource_type: &'a str,
    arn: String,
    label: String,
    details: Value,
}

impl Protection<'_> {
    fn finding(self, ctx: &RunContext, protected: &HashSet<String>) -> Result<Finding, CheckError> {
        let builder = ctx
            .finding(self.slug)
            .title(self.title)
            .resource(self.resource_type, &self.arn)
            .details(json!({ "Other": self.details }))
            .remediation(REMEDIATION_TEXT, REMEDIATION_URL)
            .related_requirements(REQUIREMENTS);

        let finding = if protected.contains(&self.arn) {
            builder
                .description(format!("{} is protected by Shield Advanced.", self.label))
                .passed()
        } else {
            builder
                .severity(SeverityLabel::Medium)
                .description(format!(
                    "{} is not protected by Shield Advanced. Refer to the remediation instructions if this configuration is not intended",
                    self.label
                ))
                .failed()
        };
        Ok(finding.build()?)
    }
}

/// [ShieldAdvanced.1] Route 53 Hosted Zones should be protected by Shield Advanced
pub fn shield_advanced_route_53_protection_check(
    ctx: RunContext,
) -> impl Stream<Item = Result<Finding, CheckError>> {
    try_stream! {
        let protected = protected_arns(&ctx).await?;
        let zones = ctx
            .cached("route53.list_hosted_zones", "route53", "ListHostedZones", json!({}))
            .await?;
        for zone in array(&zones, "HostedZones")? {
            let zone_id = string(zone, "Id")?.trim_start_matches("/hostedzone/");
            yield (Protection {
                slug: "route53-shield-adv-protection-check",
                title: "[ShieldAdvanced.1] Route 53 Hosted Zones should be protected by Shield Advanced",
                resource_type: "AwsRoute53HostedZone",
                arn: ctx.arn("route53", "", "", &format!("hostedzone/{zone_id}")),
                label: format!("Route53 Hosted Zone {zone_id}"),
                details: json!({ "hostedZoneId": zone_id }),
            })
            .finding(&ctx, &protected)?;
        }
    }
}

/// [ShieldAdvanced.2] Classic Load Balancers should be protected by Shield Advanced
pub fn shield_advanced_elb_protection_check(
    ctx: RunContext,
) -> impl Stream<Item = Result<Finding, CheckError>> {
    try_stream! {
        let protected = protected_arns(&ctx).await?;
        let balancers = ctx
            .cached("elb.describe_load_balancers", "elb", "DescribeLoadBalancers", json!({}))
            .await?;
        for balancer in array(&balancers, "LoadBalancerDescriptions")? {
            let name = string(balancer, "LoadBalancerName")?;
            yield (Protection {
                slug: "classiclb-shield-adv-protection-check",
                title: "[ShieldAdvanced.2] Classic Load Balancers should be protected by Shield Advanced",
                resource_type: "AwsElbLoadBalancer",
                arn: ctx.arn(
                    "elasticloadbalancing",
                    &ctx.region,
                    &ctx.account_id,
                    &format!("loadbalancer/{name}"),
                ),
                label: format!("Classic Load Balancer {name}"),
                details: json!({ "LoadBalancerName": name }),
            })
            .finding(&ctx, &protected)?;
        }
    }
}

/// [ShieldAdvanced.3] ELBv2 Load Balancers should be protected by Shield Advanced
///
/// Gateway load balancers cannot be protected and are skipped.
pub fn shield_advanced_elb_v2_protection_check(
    ctx: RunContext,
) -> impl Stream<Item = Result<Finding, CheckError>> {
    try_stream! {
        let protected = protected_arns(&ctx).await?;
        let balancers = ctx
            .cached("elbv2.describe_load_balancers", "elbv2", "DescribeLoadBalancers", json!({}))
            .await?;
        for balancer in array(&balancers, "LoadBalancers")? {
            let kind = string(balancer, "Type")?;
            if kind == "gateway" {
                continue;
            }
            let name = string(balancer, "LoadBalancerName")?;
            yield (Protection {
                slug: "elbv2-shield-adv-protection-check",
                title: "[ShieldAdvanced.3] ELBv2 Load Balancers should be protected by Shield Advanced",
                resource_type: "AwsElbv2LoadBalancer",
                arn: string(balancer, "LoadBalancerArn")?.to_string(),
                label: format!("ELBv2 {kind} load balancer {name}"),
                details: json!({
                    "Type": kind,
                    "VpcId": balancer.get("VpcId").and_then(Value::as_str).unwrap_or_default(),
                }),
            })
            .finding(&ctx, &protected)?;
        }
    }
}
