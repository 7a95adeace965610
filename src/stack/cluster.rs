//! EKS control plane, node security group and managed node group.

use super::iam::Roles;
use super::network::Network;
use super::StackBuilder;
use crate::core::error::Result;
use crate::core::types::{ResourceDescriptor, ResourceKind, Value};

#[derive(Debug, Clone)]
pub struct Cluster {
    pub cluster: String,
    pub node_group: String,
    pub security_group: String,
}

pub(crate) fn build(b: &mut StackBuilder<'_>, net: &Network, roles: &Roles) -> Result<Cluster> {
    let settings = b.settings;
    let subnet_ids = Value::list(net.subnets.iter().map(|s| Value::output(s, "id")));

    let sg_name = b.name("node-sg");
    let security_group = b.add(
        ResourceDescriptor::new(&sg_name, ResourceKind::SecurityGroup)
            .prop("vpc_id", Value::output(&net.vpc, "id"))
            .prop(
                "description",
                "Security group for EKS node group with HTTPS egress",
            )
            .prop(
                "egress",
                Value::list([Value::map([
                    ("protocol", Value::from("tcp")),
                    ("from_port", Value::from(443u32)),
                    ("to_port", Value::from(443u32)),
                    ("cidr_blocks", Value::list(["0.0.0.0/0"])),
                ])]),
            )
            .prop(
                "tags",
                b.tags(
                    &sg_name,
                    &[("karpenter.sh/discovery", settings.cluster_name.as_str())],
                ),
            ),
    )?;

    // the service role must carry its policy before the control plane is created
    let cluster = b.add(
        ResourceDescriptor::new(&settings.cluster_name, ResourceKind::EksCluster)
            .prop("name", settings.cluster_name.as_str())
            .prop("version", settings.kubernetes_version.as_str())
            .prop("role_arn", Value::output(&roles.cluster_role, "arn"))
            .prop("vpc_id", Value::output(&net.vpc, "id"))
            .prop("subnet_ids", subnet_ids.clone())
            .prop("create_oidc_provider", true)
            .prop("tags", b.tags(&settings.cluster_name, &[]))
            .depends_on(&roles.cluster_policy),
    )?;

    let ng_name = b.name("nodes");
    let mut node_group = ResourceDescriptor::new(&ng_name, ResourceKind::NodeGroup)
        .prop("cluster_name", Value::output(&cluster, "name"))
        .prop("node_role_arn", Value::output(&roles.node_role, "arn"))
        .prop("subnet_ids", subnet_ids)
        .prop(
            "instance_types",
            Value::list([settings.instance_type.as_str()]),
        )
        .prop("desired_size", settings.node_count)
        .prop("min_size", settings.min_size)
        .prop("max_size", settings.max_size)
        .prop(
            "security_group_ids",
            Value::list([Value::output(&security_group, "id")]),
        )
        .prop("tags", b.tags(&ng_name, &[]));
    for policy in &roles.node_policies {
        node_group = node_group.depends_on(policy);
    }
    let node_group = b.add(node_group)?;

    Ok(Cluster {
        cluster,
        node_group,
        security_group,
    })
}
