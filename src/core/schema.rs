//! Property contracts per resource kind.
//!
//! Every kind declares a fixed set of keys with a type and a required flag.
//! Descriptors are checked at graph-build time (literal values and key
//! presence); output-derived values are checked again once resolved, right
//! before the provider call.

use super::error::{EngineError, Result};
use super::graph::DependencyGraph;
use super::types::{ResourceDescriptor, ResourceKind, Value};

/// JSON type a property must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Bool,
    Integer,
    List,
    Map,
}

impl FieldType {
    fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::List => "list",
            Self::Map => "map",
        }
    }

    fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Bool => value.is_boolean(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::List => value.is_array(),
            Self::Map => value.is_object(),
        }
    }
}

/// One key of a kind's property contract.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
}

const fn req(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec {
        name,
        ty,
        required: true,
    }
}

const fn opt(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec {
        name,
        ty,
        required: false,
    }
}

use FieldType::{Bool, Integer, List, Map, String as Str};

const TAGS: FieldSpec = opt("tags", Map);

const VPC: &[FieldSpec] = &[
    req("cidr_block", Str),
    opt("enable_dns_hostnames", Bool),
    opt("enable_dns_support", Bool),
    TAGS,
];
const INTERNET_GATEWAY: &[FieldSpec] = &[req("vpc_id", Str), TAGS];
const ROUTE_TABLE: &[FieldSpec] = &[req("vpc_id", Str), opt("routes", List), TAGS];
const SUBNET: &[FieldSpec] = &[
    req("vpc_id", Str),
    req("cidr_block", Str),
    req("availability_zone", Str),
    opt("map_public_ip_on_launch", Bool),
    TAGS,
];
const ROUTE_TABLE_ASSOCIATION: &[FieldSpec] = &[req("subnet_id", Str), req("route_table_id", Str)];
const SECURITY_GROUP: &[FieldSpec] = &[
    req("vpc_id", Str),
    opt("description", Str),
    opt("ingress", List),
    opt("egress", List),
    TAGS,
];
const IAM_ROLE: &[FieldSpec] = &[opt("name", Str), req("assume_role_policy", Str), TAGS];
const IAM_POLICY: &[FieldSpec] = &[opt("name", Str), req("policy", Str), TAGS];
const ROLE_POLICY_ATTACHMENT: &[FieldSpec] = &[req("role", Str), req("policy_arn", Str)];
const INSTANCE_PROFILE: &[FieldSpec] = &[opt("name", Str), req("role", Str), TAGS];
const EKS_CLUSTER: &[FieldSpec] = &[
    req("name", Str),
    req("version", Str),
    req("role_arn", Str),
    req("vpc_id", Str),
    req("subnet_ids", List),
    opt("create_oidc_provider", Bool),
    TAGS,
];
const NODE_GROUP: &[FieldSpec] = &[
    req("cluster_name", Str),
    req("node_role_arn", Str),
    req("subnet_ids", List),
    req("instance_types", List),
    req("desired_size", Integer),
    req("min_size", Integer),
    req("max_size", Integer),
    opt("security_group_ids", List),
    TAGS,
];
const KUBERNETES_PROVIDER: &[FieldSpec] = &[req("kubeconfig", Str)];
const NAMESPACE: &[FieldSpec] = &[req("name", Str), req("provider", Str)];
const HELM_RELEASE: &[FieldSpec] = &[
    req("name", Str),
    req("chart", Str),
    req("version", Str),
    req("namespace", Str),
    req("provider", Str),
    opt("skip_crds", Bool),
    opt("values", Map),
];
const MANIFEST: &[FieldSpec] = &[req("name", Str), req("yaml", Str), req("provider", Str)];

/// The property contract of a kind.
pub fn fields(kind: ResourceKind) -> &'static [FieldSpec] {
    match kind {
        ResourceKind::Vpc => VPC,
        ResourceKind::InternetGateway => INTERNET_GATEWAY,
        ResourceKind::RouteTable => ROUTE_TABLE,
        ResourceKind::Subnet => SUBNET,
        ResourceKind::RouteTableAssociation => ROUTE_TABLE_ASSOCIATION,
        ResourceKind::SecurityGroup => SECURITY_GROUP,
        ResourceKind::IamRole => IAM_ROLE,
        ResourceKind::IamPolicy => IAM_POLICY,
        ResourceKind::RolePolicyAttachment => ROLE_POLICY_ATTACHMENT,
        ResourceKind::InstanceProfile => INSTANCE_PROFILE,
        ResourceKind::EksCluster => EKS_CLUSTER,
        ResourceKind::NodeGroup => NODE_GROUP,
        ResourceKind::KubernetesProvider => KUBERNETES_PROVIDER,
        ResourceKind::Namespace => NAMESPACE,
        ResourceKind::HelmRelease => HELM_RELEASE,
        ResourceKind::Manifest => MANIFEST,
    }
}

fn spec_for(kind: ResourceKind, key: &str) -> Option<&'static FieldSpec> {
    fields(kind).iter().find(|f| f.name == key)
}

/// Check a descriptor before submission. Output-derived values are deferred.
pub fn validate_descriptor(descriptor: &ResourceDescriptor) -> Vec<String> {
    let mut errors = Vec::new();

    for spec in fields(descriptor.kind) {
        if spec.required && !descriptor.properties.contains_key(spec.name) {
            errors.push(format!("missing required property '{}'", spec.name));
        }
    }

    for (key, value) in &descriptor.properties {
        let Some(spec) = spec_for(descriptor.kind, key) else {
            errors.push(format!(
                "unknown property '{}' for kind {}",
                key, descriptor.kind
            ));
            continue;
        };
        let shape_ok = match value {
            Value::Output(_) => true,
            Value::Literal(v) => spec.ty.matches(v),
            Value::List(_) => spec.ty == FieldType::List,
            Value::Map(_) => spec.ty == FieldType::Map,
            Value::Concat(_) => spec.ty == FieldType::String,
        };
        if !shape_ok {
            errors.push(format!("property '{}' must be a {}", key, spec.ty.name()));
        }
    }

    errors
}

/// Check a fully resolved property object right before the provider call.
pub fn validate_resolved(kind: ResourceKind, properties: &serde_json::Value) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(object) = properties.as_object() else {
        return vec!["properties must be a map".to_string()];
    };

    for spec in fields(kind) {
        match object.get(spec.name) {
            None if spec.required => {
                errors.push(format!("missing required property '{}'", spec.name))
            }
            Some(v) if !spec.ty.matches(v) => errors.push(format!(
                "property '{}' must be a {}",
                spec.name,
                spec.ty.name()
            )),
            _ => {}
        }
    }

    if kind == ResourceKind::NodeGroup {
        let size = |k: &str| object.get(k).and_then(serde_json::Value::as_i64);
        if let (Some(min), Some(desired), Some(max)) =
            (size("min_size"), size("desired_size"), size("max_size"))
        {
            if !(min <= desired && desired <= max) {
                errors.push(format!(
                    "node group sizes must satisfy min <= desired <= max (got {} / {} / {})",
                    min, desired, max
                ));
            }
        }
    }

    errors
}

/// Check every descriptor of a graph; all findings are reported together.
pub fn validate_graph(graph: &DependencyGraph) -> Result<()> {
    let mut errors = Vec::new();
    for (_, descriptor) in graph.nodes() {
        for e in validate_descriptor(descriptor) {
            errors.push(format!("{}: {}", descriptor.id, e));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(errors))
    }
}

/// Like [`validate_resolved`], as an error for one resource.
pub fn check_resolved(
    resource_id: &str,
    kind: ResourceKind,
    properties: &serde_json::Value,
) -> Result<()> {
    let errors = validate_resolved(kind, properties);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(EngineError::InvalidProperties {
            resource: resource_id.to_string(),
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::GraphBuilder;
    use serde_json::json;

    #[test]
    fn test_every_kind_has_a_contract() {
        for kind in ResourceKind::ALL {
            let contract = fields(kind);
            assert!(!contract.is_empty(), "{} has no fields", kind);
            assert!(contract.iter().any(|f| f.required), "{} requires nothing", kind);
        }
    }

    #[test]
    fn test_manifest_contract() {
        let errors = validate_resolved(
            ResourceKind::Manifest,
            &json!({"name": "nodes", "yaml": "kind: NodePool\n", "provider": "k8s-1"}),
        );
        assert!(errors.is_empty());
        let errors = validate_resolved(ResourceKind::Manifest, &json!({"name": "nodes"}));
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_valid_vpc() {
        let d = ResourceDescriptor::new("vpc", ResourceKind::Vpc)
            .prop("cidr_block", "10.0.0.0/16")
            .prop("enable_dns_support", true)
            .prop("tags", Value::map([("Name", "demo-vpc")]));
        assert!(validate_descriptor(&d).is_empty());
    }

    #[test]
    fn test_missing_and_unknown_keys() {
        let d = ResourceDescriptor::new("vpc", ResourceKind::Vpc).prop("cidr", "10.0.0.0/16");
        let errors = validate_descriptor(&d);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("missing required property 'cidr_block'")));
        assert!(errors.iter().any(|e| e.contains("unknown property 'cidr'")));
    }

    #[test]
    fn test_literal_type_mismatch() {
        let d = ResourceDescriptor::new("vpc", ResourceKind::Vpc)
            .prop("cidr_block", "10.0.0.0/16")
            .prop("enable_dns_support", "yes");
        let errors = validate_descriptor(&d);
        assert_eq!(errors, vec!["property 'enable_dns_support' must be a bool"]);
    }

    #[test]
    fn test_outputs_deferred_until_resolution() {
        let d = ResourceDescriptor::new("igw", ResourceKind::InternetGateway)
            .prop("vpc_id", Value::output("vpc", "id"));
        assert!(validate_descriptor(&d).is_empty());
        let errors = validate_resolved(ResourceKind::InternetGateway, &json!({"vpc_id": 7}));
        assert_eq!(errors, vec!["property 'vpc_id' must be a string"]);
    }

    #[test]
    fn test_node_group_size_bounds() {
        let props = json!({
            "cluster_name": "c",
            "node_role_arn": "arn",
            "subnet_ids": ["s1"],
            "instance_types": ["t3.medium"],
            "desired_size": 6,
            "min_size": 1,
            "max_size": 5
        });
        let errors = validate_resolved(ResourceKind::NodeGroup, &props);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("min <= desired <= max"));
        let err = check_resolved("nodes", ResourceKind::NodeGroup, &props).unwrap_err();
        assert!(matches!(err, EngineError::InvalidProperties { ref resource, .. } if resource == "nodes"));
    }

    #[test]
    fn test_validate_graph_collects_all() {
        let mut b = GraphBuilder::new();
        b.register(ResourceDescriptor::new("vpc", ResourceKind::Vpc))
            .unwrap();
        b.register(ResourceDescriptor::new("role", ResourceKind::IamRole))
            .unwrap();
        let g = b.build().unwrap();
        match validate_graph(&g).unwrap_err() {
            EngineError::Validation(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].starts_with("vpc:"));
                assert!(errors[1].starts_with("role:"));
            }
            other => panic!("unexpected {other}"),
        }
    }
}
