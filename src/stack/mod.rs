//! The EKS + Karpenter topology, expressed as resource descriptors.
//!
//! `build_stack` expands a [`StackConfig`] into a dependency graph: a public
//! VPC, IAM roles, the cluster with its node group, the Karpenter controller
//! installed through Helm, and its default node pool. Every resource id is
//! prefixed with the cluster name, so two stacks with different cluster
//! names never collide.

pub mod cluster;
pub mod iam;
pub mod karpenter;
pub mod network;

use crate::core::error::{EngineError, Result};
use crate::core::graph::{DependencyGraph, GraphBuilder};
use crate::core::schema;
use crate::core::template::resolve_template;
use crate::core::types::{ResourceDescriptor, Settings, StackConfig, StackExport, Value};
use indexmap::IndexMap;

/// A built stack: the validated graph plus its named exports.
#[derive(Debug)]
pub struct Stack {
    pub graph: DependencyGraph,
    pub exports: Vec<StackExport>,
}

/// Accumulates descriptors and exports while the topology is assembled.
pub(crate) struct StackBuilder<'a> {
    pub settings: &'a Settings,
    tags: IndexMap<String, String>,
    graph: GraphBuilder,
    exports: Vec<StackExport>,
}

impl<'a> StackBuilder<'a> {
    fn new(settings: &'a Settings, tags: IndexMap<String, String>) -> Self {
        Self {
            settings,
            tags,
            graph: GraphBuilder::new(),
            exports: Vec::new(),
        }
    }

    /// `<cluster_name>-<suffix>`
    pub fn name(&self, suffix: &str) -> String {
        format!("{}-{}", self.settings.cluster_name, suffix)
    }

    /// Register a descriptor and return its id.
    pub fn add(&mut self, descriptor: ResourceDescriptor) -> Result<String> {
        let id = descriptor.id.clone();
        self.graph.register(descriptor)?;
        Ok(id)
    }

    /// Tag map with `Name`, `managed-by`, the configured stack tags, then `extra`.
    pub fn tags(&self, name: &str, extra: &[(&str, &str)]) -> Value {
        let mut tags: IndexMap<String, Value> = IndexMap::new();
        tags.insert("Name".to_string(), Value::from(name));
        tags.insert("managed-by".to_string(), Value::from("infragraph"));
        for (k, v) in &self.tags {
            tags.insert(k.clone(), Value::from(v.as_str()));
        }
        for (k, v) in extra {
            tags.insert((*k).to_string(), Value::from(*v));
        }
        Value::Map(tags)
    }

    pub fn export(&mut self, export: StackExport) {
        self.exports.push(export);
    }

    fn finish(self) -> Result<Stack> {
        let graph = self.graph.build()?;
        schema::validate_graph(&graph)?;
        Ok(Stack {
            graph,
            exports: self.exports,
        })
    }
}

/// Expand a stack configuration into its resource graph.
pub fn build_stack(config: &StackConfig) -> Result<Stack> {
    let mut tags = IndexMap::new();
    for (key, template) in &config.tags {
        let value = resolve_template(template, &config.settings, &config.params)
            .map_err(|e| EngineError::Config(format!("tag '{}': {}", key, e)))?;
        tags.insert(key.clone(), value);
    }

    let mut b = StackBuilder::new(&config.settings, tags);

    let net = network::build(&mut b)?;
    let roles = iam::build(&mut b)?;
    let eks = cluster::build(&mut b, &net, &roles)?;
    let controller_role = iam::karpenter_controller(&mut b, &eks)?;
    karpenter::build(&mut b, &eks, &controller_role, &roles.karpenter_node_role)?;

    b.export(StackExport::new("clusterArn", Value::output(&eks.cluster, "arn")));
    b.export(StackExport::new(
        "clusterEndpoint",
        Value::output(&eks.cluster, "endpoint"),
    ));
    b.export(StackExport::new("clusterName", Value::output(&eks.cluster, "name")));
    b.export(StackExport::new(
        "clusterVersion",
        Value::output(&eks.cluster, "version"),
    ));
    b.export(StackExport::new("kubeconfig", Value::output(&eks.cluster, "kubeconfig")).secret());
    b.export(StackExport::new("vpcId", Value::output(&net.vpc, "id")));
    b.export(StackExport::new(
        "karpenterNodeInstanceProfile",
        Value::output(&roles.karpenter_node_profile, "name"),
    ));

    let stack = b.finish()?;
    tracing::debug!(
        stack = %config.name,
        resources = stack.graph.len(),
        edges = stack.graph.edge_count(),
        "stack built"
    );
    Ok(stack)
}

/// Split `template` at each placeholder and splice in the matching value.
///
/// Used to build JSON documents (IAM policies) whose fields are only known
/// after apply; the placeholders must not need JSON escaping.
pub(crate) fn interpolate(template: &str, slots: &[(&str, Value)]) -> Value {
    let mut parts = Vec::new();
    let mut rest = template;
    loop {
        let next = slots
            .iter()
            .filter_map(|(placeholder, value)| {
                rest.find(placeholder).map(|at| (at, *placeholder, value))
            })
            .min_by_key(|(at, _, _)| *at);
        match next {
            Some((at, placeholder, value)) => {
                if at > 0 {
                    parts.push(Value::from(&rest[..at]));
                }
                parts.push(value.clone());
                rest = &rest[at + placeholder.len()..];
            }
            None => {
                if !rest.is_empty() {
                    parts.push(Value::from(rest));
                }
                break;
            }
        }
    }
    Value::Concat(parts)
}
