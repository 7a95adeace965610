//! Dependency graph construction.
//!
//! Descriptors are registered one at a time; `build` derives edges from
//! explicit `depends_on` sets and from every output reference found by a
//! recursive scan of the property bag, then rejects unknown references and
//! cycles before anything reaches a provider.

use super::error::{EngineError, Result};
use super::types::{NodeId, ResourceDescriptor};
use rustc_hash::FxHashMap;

/// Collects descriptors before they are frozen into a [`DependencyGraph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<ResourceDescriptor>,
    index: FxHashMap<String, NodeId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. A duplicate id leaves the builder untouched.
    pub fn register(&mut self, descriptor: ResourceDescriptor) -> Result<NodeId> {
        if self.index.contains_key(&descriptor.id) {
            return Err(EngineError::DuplicateId(descriptor.id));
        }
        let id = NodeId(self.nodes.len());
        self.index.insert(descriptor.id.clone(), id);
        self.nodes.push(descriptor);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&ResourceDescriptor> {
        self.index.get(id).map(|n| &self.nodes[n.0])
    }

    /// Freeze the registered descriptors into a validated DAG.
    pub fn build(self) -> Result<DependencyGraph> {
        let mut dependencies: Vec<Vec<NodeId>> = Vec::with_capacity(self.nodes.len());

        for descriptor in &self.nodes {
            let mut deps = Vec::new();
            let referenced = descriptor
                .depends_on
                .iter()
                .cloned()
                .chain(descriptor.implicit_dependencies());
            for dep in referenced {
                let node = self.index.get(&dep).ok_or_else(|| {
                    EngineError::UnknownDependency {
                        resource: descriptor.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                deps.push(*node);
            }
            deps.sort();
            deps.dedup();
            dependencies.push(deps);
        }

        let mut dependents: Vec<Vec<NodeId>> = vec![Vec::new(); self.nodes.len()];
        for (i, deps) in dependencies.iter().enumerate() {
            for dep in deps {
                dependents[dep.0].push(NodeId(i));
            }
        }

        let graph = DependencyGraph {
            nodes: self.nodes,
            index: self.index,
            dependencies,
            dependents,
        };

        if let Some(cycle) = graph.find_cycle() {
            return Err(EngineError::CycleDetected(cycle));
        }

        tracing::debug!(
            nodes = graph.len(),
            edges = graph.edge_count(),
            "dependency graph built"
        );
        Ok(graph)
    }
}

/// An acyclic graph of descriptors. Edge `a -> b` means `a` depends on `b`.
#[derive(Debug)]
pub struct DependencyGraph {
    nodes: Vec<ResourceDescriptor>,
    index: FxHashMap<String, NodeId>,
    dependencies: Vec<Vec<NodeId>>,
    dependents: Vec<Vec<NodeId>>,
}

impl DependencyGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &ResourceDescriptor {
        &self.nodes[id.0]
    }

    pub fn get(&self, id: &str) -> Option<&ResourceDescriptor> {
        self.index.get(id).map(|n| &self.nodes[n.0])
    }

    pub fn node_id(&self, id: &str) -> Option<NodeId> {
        self.index.get(id).copied()
    }

    /// Descriptors in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &ResourceDescriptor)> {
        self.nodes.iter().enumerate().map(|(i, d)| (NodeId(i), d))
    }

    /// Direct dependencies of a node, ascending by registration order.
    pub fn dependencies(&self, id: NodeId) -> &[NodeId] {
        &self.dependencies[id.0]
    }

    /// Direct dependents of a node, ascending by registration order.
    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        &self.dependents[id.0]
    }

    pub fn dependency_ids(&self, id: NodeId) -> Vec<String> {
        self.dependencies[id.0]
            .iter()
            .map(|d| self.nodes[d.0].id.clone())
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.dependencies.iter().map(Vec::len).sum()
    }

    /// Dependency lists indexed by registration order (planner input).
    pub(crate) fn adjacency(&self) -> Vec<Vec<usize>> {
        self.dependencies
            .iter()
            .map(|deps| deps.iter().map(|d| d.0).collect())
            .collect()
    }

    /// Every node reachable through dependent edges, excluding `id` itself.
    pub fn transitive_dependents(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![id];
        let mut out = Vec::new();
        while let Some(current) = stack.pop() {
            for next in &self.dependents[current.0] {
                if !seen[next.0] {
                    seen[next.0] = true;
                    out.push(*next);
                    stack.push(*next);
                }
            }
        }
        out.sort();
        out
    }

    /// Depth-first search in registration order; returns the first cycle
    /// found as `[a, b, ..., a]`.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        fn visit(
            graph: &DependencyGraph,
            node: usize,
            marks: &mut [Mark],
            path: &mut Vec<usize>,
        ) -> Option<Vec<String>> {
            marks[node] = Mark::OnStack;
            path.push(node);
            for dep in &graph.dependencies[node] {
                match marks[dep.0] {
                    Mark::OnStack => {
                        let start = path.iter().position(|n| *n == dep.0).unwrap_or(0);
                        let mut cycle: Vec<String> = path[start..]
                            .iter()
                            .map(|n| graph.nodes[*n].id.clone())
                            .collect();
                        cycle.push(graph.nodes[dep.0].id.clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(graph, dep.0, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            path.pop();
            marks[node] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut path = Vec::new();
        for node in 0..self.nodes.len() {
            if marks[node] == Mark::Unvisited {
                if let Some(cycle) = visit(self, node, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ResourceKind, Value};

    fn role(id: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(id, ResourceKind::IamRole)
    }

    #[test]
    fn test_register_assigns_sequential_ids() {
        let mut b = GraphBuilder::new();
        assert_eq!(b.register(role("a")).unwrap(), NodeId(0));
        assert_eq!(b.register(role("b")).unwrap(), NodeId(1));
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_duplicate_id_rejected_without_mutation() {
        let mut b = GraphBuilder::new();
        b.register(role("a").prop("name", "first")).unwrap();
        let err = b.register(role("a").prop("name", "second")).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateId(ref id) if id == "a"));
        assert_eq!(b.len(), 1);
        let kept = b.get("a").unwrap();
        assert!(matches!(
            kept.properties["name"],
            Value::Literal(serde_json::Value::String(ref s)) if s == "first"
        ));
    }

    #[test]
    fn test_explicit_and_implicit_edges() {
        let mut b = GraphBuilder::new();
        b.register(ResourceDescriptor::new("vpc", ResourceKind::Vpc)).unwrap();
        b.register(ResourceDescriptor::new("igw", ResourceKind::InternetGateway))
            .unwrap();
        b.register(
            ResourceDescriptor::new("rt", ResourceKind::RouteTable)
                .prop(
                    "routes",
                    Value::list([Value::map([("gateway_id", Value::output("igw", "id"))])]),
                )
                .depends_on("vpc"),
        )
        .unwrap();
        let g = b.build().unwrap();
        let rt = g.node_id("rt").unwrap();
        assert_eq!(g.dependency_ids(rt), vec!["vpc", "igw"]);
        assert_eq!(g.edge_count(), 2);
        assert_eq!(g.dependents(g.node_id("vpc").unwrap()), &[rt]);
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let mut b = GraphBuilder::new();
        b.register(role("a")).unwrap();
        b.register(
            role("b")
                .prop("x", Value::output("a", "arn"))
                .prop("y", Value::output("a", "name"))
                .depends_on("a"),
        )
        .unwrap();
        let g = b.build().unwrap();
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn test_unknown_dependency() {
        let mut b = GraphBuilder::new();
        b.register(role("a").prop("x", Value::output("ghost", "arn")))
            .unwrap();
        let err = b.build().unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnknownDependency { ref resource, ref dependency }
                if resource == "a" && dependency == "ghost"
        ));
    }

    #[test]
    fn test_two_node_cycle_names_both() {
        let mut b = GraphBuilder::new();
        b.register(role("a").depends_on("b")).unwrap();
        b.register(role("b").depends_on("a")).unwrap();
        match b.build().unwrap_err() {
            EngineError::CycleDetected(path) => {
                assert_eq!(path, vec!["a", "b", "a"]);
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_cycle_through_output_reference() {
        let mut b = GraphBuilder::new();
        b.register(role("a").prop("p", Value::output("c", "arn"))).unwrap();
        b.register(role("b").depends_on("a")).unwrap();
        b.register(role("c").prop("p", Value::output("b", "arn"))).unwrap();
        match b.build().unwrap_err() {
            EngineError::CycleDetected(path) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
                for id in ["a", "b", "c"] {
                    assert!(path.iter().any(|p| p == id));
                }
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let mut b = GraphBuilder::new();
        b.register(role("a").depends_on("a")).unwrap();
        assert!(matches!(
            b.build().unwrap_err(),
            EngineError::CycleDetected(ref p) if p == &vec!["a".to_string(), "a".to_string()]
        ));
    }

    #[test]
    fn test_transitive_dependents() {
        let mut b = GraphBuilder::new();
        b.register(role("x")).unwrap();
        b.register(role("y").depends_on("x")).unwrap();
        b.register(role("w").depends_on("y")).unwrap();
        b.register(role("z")).unwrap();
        let g = b.build().unwrap();
        let x = g.node_id("x").unwrap();
        let ids: Vec<_> = g
            .transitive_dependents(x)
            .into_iter()
            .map(|n| g.node(n).id.clone())
            .collect();
        assert_eq!(ids, vec!["y", "w"]);
    }
}
