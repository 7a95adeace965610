//! IAM roles for the control plane, managed nodes, and Karpenter.

use super::cluster::Cluster;
use super::{interpolate, StackBuilder};
use crate::core::error::Result;
use crate::core::types::{Projection, ResourceDescriptor, ResourceKind, Value};
use serde_json::json;

const NODE_POLICIES: [&str; 4] = [
    "arn:aws:iam::aws:policy/AmazonEKSWorkerNodePolicy",
    "arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy",
    "arn:aws:iam::aws:policy/AmazonEC2ContainerRegistryReadOnly",
    "arn:aws:iam::aws:policy/AmazonSSMManagedInstanceCore",
];

const CLUSTER_POLICY: &str = "arn:aws:iam::aws:policy/AmazonEKSClusterPolicy";

/// Ids of the roles and attachments other layers depend on.
#[derive(Debug, Clone)]
pub struct Roles {
    pub cluster_role: String,
    pub cluster_policy: String,
    pub node_role: String,
    pub node_policies: Vec<String>,
    pub karpenter_node_role: String,
    pub karpenter_node_profile: String,
}

fn service_trust(service: &str) -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": service },
            "Action": "sts:AssumeRole"
        }]
    })
    .to_string()
}

fn attach(b: &mut StackBuilder<'_>, id: String, role: &str, policy_arn: Value) -> Result<String> {
    b.add(
        ResourceDescriptor::new(id, ResourceKind::RolePolicyAttachment)
            .prop("role", Value::output(role, "name"))
            .prop("policy_arn", policy_arn),
    )
}

pub(crate) fn build(b: &mut StackBuilder<'_>) -> Result<Roles> {
    let name = b.name("cluster-role");
    let cluster_role = b.add(
        ResourceDescriptor::new(&name, ResourceKind::IamRole)
            .prop("assume_role_policy", service_trust("eks.amazonaws.com"))
            .prop("tags", b.tags(&name, &[])),
    )?;
    let id = b.name("cluster-policy");
    let cluster_policy = attach(b, id, &cluster_role, CLUSTER_POLICY.into())?;

    let name = b.name("node-role");
    let node_role = b.add(
        ResourceDescriptor::new(&name, ResourceKind::IamRole)
            .prop("assume_role_policy", service_trust("ec2.amazonaws.com"))
            .prop("tags", b.tags(&name, &[])),
    )?;
    let mut node_policies = Vec::with_capacity(NODE_POLICIES.len());
    for (i, arn) in NODE_POLICIES.iter().enumerate() {
        let id = b.name(&format!("node-policy-{}", i));
        node_policies.push(attach(b, id, &node_role, (*arn).into())?);
    }

    // Karpenter-launched nodes get their own, explicitly named role
    let name = b.name("karpenter-node-role");
    let karpenter_node_role = b.add(
        ResourceDescriptor::new(&name, ResourceKind::IamRole)
            .prop("name", name.as_str())
            .prop("assume_role_policy", service_trust("ec2.amazonaws.com"))
            .prop("tags", b.tags(&name, &[])),
    )?;
    for (i, arn) in NODE_POLICIES.iter().enumerate() {
        let id = b.name(&format!("karpenter-node-policy-{}", i));
        attach(b, id, &karpenter_node_role, (*arn).into())?;
    }

    let profile = format!("{}-profile", name);
    let karpenter_node_profile = b.add(
        ResourceDescriptor::new(&profile, ResourceKind::InstanceProfile)
            .prop("name", name.as_str())
            .prop("role", Value::output(&karpenter_node_role, "name"))
            .prop("tags", b.tags(&profile, &[])),
    )?;

    Ok(Roles {
        cluster_role,
        cluster_policy,
        node_role,
        node_policies,
        karpenter_node_role,
        karpenter_node_profile,
    })
}

/// Trust policy letting the `karpenter` service account assume a role
/// through the cluster's OIDC provider.
fn controller_trust(cluster: &str, namespace: &str) -> Value {
    let issuer = Value::project(
        cluster,
        Projection::custom("oidc-issuer", |result| {
            let url = result
                .get("oidcProviderUrl")
                .and_then(|v| v.as_str())
                .ok_or("cluster has no OIDC provider URL")?;
            Ok(json!(url.trim_start_matches("https://")))
        }),
    );
    let template = json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Federated": "@ARN@" },
            "Action": "sts:AssumeRoleWithWebIdentity",
            "Condition": {
                "StringEquals": {
                    "@ISSUER@:sub": format!("system:serviceaccount:{}:karpenter", namespace),
                    "@ISSUER@:aud": "sts.amazonaws.com"
                }
            }
        }]
    })
    .to_string();
    interpolate(
        &template,
        &[
            ("@ARN@", Value::output(cluster, "oidcProviderArn")),
            ("@ISSUER@", issuer),
        ],
    )
}

fn controller_policy() -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": [
                    "ec2:CreateLaunchTemplate",
                    "ec2:CreateFleet",
                    "ec2:RunInstances",
                    "ec2:CreateTags",
                    "ec2:TerminateInstances",
                    "ec2:DeleteLaunchTemplate",
                    "ec2:DescribeLaunchTemplates",
                    "ec2:DescribeInstances",
                    "ec2:DescribeInstanceTypes",
                    "ec2:DescribeInstanceTypeOfferings",
                    "ec2:DescribeAvailabilityZones",
                    "ec2:DescribeSpotPriceHistory",
                    "ec2:DescribeImages",
                    "ec2:DescribeSecurityGroups",
                    "ec2:DescribeSubnets",
                    "pricing:GetProducts"
                ],
                "Resource": "*"
            },
            {
                "Effect": "Allow",
                "Action": ["eks:DescribeCluster", "eks:DescribeNodegroup"],
                "Resource": "*"
            },
            {
                "Effect": "Allow",
                "Action": ["iam:PassRole"],
                "Resource": "*",
                "Condition": {
                    "StringEquals": { "iam:PassedToService": "ec2.amazonaws.com" }
                }
            },
            {
                "Effect": "Allow",
                "Action": [
                    "iam:GetInstanceProfile",
                    "iam:CreateInstanceProfile",
                    "iam:DeleteInstanceProfile",
                    "iam:AddRoleToInstanceProfile",
                    "iam:RemoveRoleFromInstanceProfile",
                    "iam:TagInstanceProfile",
                    "iam:UntagInstanceProfile"
                ],
                "Resource": "*"
            },
            {
                "Effect": "Allow",
                "Action": ["ssm:GetParameter"],
                "Resource": "*"
            }
        ]
    })
    .to_string()
}

/// Ids of the Karpenter controller role and its policy attachment.
#[derive(Debug, Clone)]
pub struct ControllerRole {
    pub role: String,
    pub attachment: String,
}

/// The controller's OIDC-federated role; needs the cluster's OIDC outputs.
pub(crate) fn karpenter_controller(b: &mut StackBuilder<'_>, eks: &Cluster) -> Result<ControllerRole> {
    let namespace = b.settings.karpenter_namespace.clone();

    let name = b.name("karpenter-role");
    let role = b.add(
        ResourceDescriptor::new(&name, ResourceKind::IamRole)
            .prop("assume_role_policy", controller_trust(&eks.cluster, &namespace))
            .prop("tags", b.tags(&name, &[])),
    )?;

    let name = b.name("karpenter-policy");
    let policy = b.add(
        ResourceDescriptor::new(&name, ResourceKind::IamPolicy)
            .prop("policy", controller_policy())
            .prop("tags", b.tags(&name, &[])),
    )?;

    let id = b.name("karpenter-policy-attachment");
    let attachment = attach(b, id, &role, Value::output(&policy, "arn"))?;

    Ok(ControllerRole { role, attachment })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::output::OutputResolver;

    #[test]
    fn test_service_trust_is_valid_json() {
        let doc: serde_json::Value = serde_json::from_str(&service_trust("eks.amazonaws.com")).unwrap();
        assert_eq!(doc["Statement"][0]["Principal"]["Service"], "eks.amazonaws.com");
    }

    #[test]
    fn test_controller_trust_resolves_to_federated_policy() {
        let trust = controller_trust("eks", "kube-system");
        let deps: Vec<_> = trust.output_refs().iter().map(|r| r.resource_id.clone()).collect();
        assert!(deps.iter().all(|d| d == "eks"));

        let mut outputs = OutputResolver::new();
        outputs
            .resolve(
                "eks",
                json!({
                    "oidcProviderArn": "arn:aws:iam::123456789012:oidc-provider/oidc.eks.us-east-2.amazonaws.com/id/ABC",
                    "oidcProviderUrl": "https://oidc.eks.us-east-2.amazonaws.com/id/ABC"
                }),
            )
            .unwrap();
        let resolved = outputs.snapshot().resolve_value(&trust, "role").unwrap();
        let doc: serde_json::Value = serde_json::from_str(resolved.as_str().unwrap()).unwrap();
        let statement = &doc["Statement"][0];
        assert_eq!(
            statement["Principal"]["Federated"],
            "arn:aws:iam::123456789012:oidc-provider/oidc.eks.us-east-2.amazonaws.com/id/ABC"
        );
        let cond = &statement["Condition"]["StringEquals"];
        assert_eq!(
            cond["oidc.eks.us-east-2.amazonaws.com/id/ABC:sub"],
            "system:serviceaccount:kube-system:karpenter"
        );
        assert_eq!(
            cond["oidc.eks.us-east-2.amazonaws.com/id/ABC:aud"],
            "sts.amazonaws.com"
        );
    }

    #[test]
    fn test_controller_trust_needs_oidc_url() {
        let trust = controller_trust("eks", "kube-system");
        let mut outputs = OutputResolver::new();
        outputs.resolve("eks", json!({"oidcProviderArn": "arn"})).unwrap();
        assert!(outputs.snapshot().resolve_value(&trust, "role").is_err());
    }
}
