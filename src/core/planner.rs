//! Batch planning and state diff.
//!
//! Batching is Kahn's algorithm run level by level: every round takes all
//! nodes whose dependencies are already placed, in registration order. The
//! same routine plans apply (dependencies first), destroy (reversed edges)
//! and orphan teardown (edges recorded in state).

use super::error::{EngineError, Result};
use super::graph::DependencyGraph;
use super::output::{OutputResolver, OutputSnapshot};
use super::state::StateMap;
use super::types::*;
use crate::tripwire::hasher;
use rustc_hash::FxHashMap;

/// Group nodes `0..deps.len()` into batches; `deps[n]` lists the nodes `n`
/// waits for. On a cycle, returns the nodes that could not be placed.
pub fn kahn_batches(deps: &[Vec<usize>]) -> std::result::Result<Vec<Vec<usize>>, Vec<usize>> {
    let n = deps.len();
    let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut waiting_on_me: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (node, node_deps) in deps.iter().enumerate() {
        for &dep in node_deps {
            waiting_on_me[dep].push(node);
        }
    }

    let mut ready: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut placed = 0usize;
    let mut batches = Vec::new();

    while !ready.is_empty() {
        ready.sort_unstable();
        let mut next = Vec::new();
        for &node in &ready {
            for &waiter in &waiting_on_me[node] {
                in_degree[waiter] -= 1;
                if in_degree[waiter] == 0 {
                    next.push(waiter);
                }
            }
        }
        placed += ready.len();
        batches.push(std::mem::replace(&mut ready, next));
    }

    if placed != n {
        let stuck = (0..n).filter(|&i| in_degree[i] > 0).collect();
        return Err(stuck);
    }
    Ok(batches)
}

/// One cycle among the nodes Kahn's algorithm could not place, as
/// `[a, b, ..., a]` following dependency edges.
///
/// Every stuck node waits on at least one other stuck node, so walking
/// stuck dependencies from any of them must revisit a node. Nodes that only
/// hang behind the cycle are left out.
pub fn cycle_among(deps: &[Vec<usize>], stuck: &[usize]) -> Vec<usize> {
    let mut is_stuck = vec![false; deps.len()];
    for &i in stuck {
        is_stuck[i] = true;
    }
    let Some(&start) = stuck.first() else {
        return Vec::new();
    };

    let mut position: FxHashMap<usize, usize> = FxHashMap::default();
    let mut path = Vec::new();
    let mut current = start;
    loop {
        if let Some(&at) = position.get(&current) {
            let mut cycle = path.split_off(at);
            cycle.push(current);
            return cycle;
        }
        position.insert(current, path.len());
        path.push(current);
        match deps[current].iter().copied().find(|&d| is_stuck[d]) {
            Some(next) => current = next,
            None => return path,
        }
    }
}

fn reversed(deps: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let mut rev = vec![Vec::new(); deps.len()];
    for (node, node_deps) in deps.iter().enumerate() {
        for &dep in node_deps {
            rev[dep].push(node);
        }
    }
    rev
}

fn to_plan(
    direction: PlanDirection,
    deps: &[Vec<usize>],
    name: impl Fn(usize) -> String,
) -> Result<ExecutionPlan> {
    let batches = kahn_batches(deps).map_err(|stuck| {
        let cycle = cycle_among(deps, &stuck);
        EngineError::CycleDetected(cycle.into_iter().map(&name).collect())
    })?;
    Ok(ExecutionPlan {
        direction,
        batches: batches
            .into_iter()
            .map(|batch| batch.into_iter().map(&name).collect())
            .collect(),
    })
}

/// Apply plan: every resource runs after all of its dependencies.
pub fn plan(graph: &DependencyGraph) -> Result<ExecutionPlan> {
    let plan = to_plan(PlanDirection::Apply, &graph.adjacency(), |i| {
        graph.node(NodeId(i)).id.clone()
    })?;
    tracing::debug!(batches = plan.len(), resources = plan.resource_count(), "apply plan");
    Ok(plan)
}

/// Destroy plan: every resource is torn down before its dependencies.
pub fn plan_destroy(graph: &DependencyGraph) -> Result<ExecutionPlan> {
    to_plan(PlanDirection::Destroy, &reversed(&graph.adjacency()), |i| {
        graph.node(NodeId(i)).id.clone()
    })
}

/// Provisioned resources recorded in state that the graph no longer declares.
pub fn orphans<'a>(states: &'a StateMap, graph: &DependencyGraph) -> Vec<&'a ResourceState> {
    states
        .values()
        .filter(|s| s.is_provisioned() && graph.get(&s.id).is_none())
        .collect()
}

/// Teardown plan for orphans, ordered by their recorded dependencies.
pub fn plan_orphans(states: &StateMap, graph: &DependencyGraph) -> Result<ExecutionPlan> {
    plan_teardown(&orphans(states, graph))
}

/// Teardown plan for recorded resources; edges to ids outside the set are ignored.
pub fn plan_teardown(resources: &[&ResourceState]) -> Result<ExecutionPlan> {
    let index: FxHashMap<&str, usize> = resources
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let deps: Vec<Vec<usize>> = resources
        .iter()
        .map(|s| {
            s.dependencies
                .iter()
                .filter_map(|d| index.get(d.as_str()).copied())
                .collect()
        })
        .collect();
    to_plan(PlanDirection::Destroy, &reversed(&deps), |i| {
        resources[i].id.clone()
    })
}

/// Seed a preview of resolved outputs from recorded state.
pub fn preview_outputs(states: &StateMap) -> OutputSnapshot {
    let mut resolver = OutputResolver::new();
    for state in states.values().filter(|s| s.is_provisioned()) {
        // ids are unique in an IndexMap, so no slot is resolved twice
        let _ = resolver.resolve(&state.id, state.outputs.clone());
    }
    resolver.snapshot()
}

/// Decide the action for one resource given its recorded state and the hash
/// of its desired properties (`None` when not computable before apply).
pub fn determine_action(state: Option<&ResourceState>, desired_hash: Option<&str>) -> PlanAction {
    let Some(state) = state.filter(|s| s.is_provisioned()) else {
        return PlanAction::Create;
    };
    match (state.status, desired_hash) {
        (ResourceStatus::Created, Some(hash)) if state.properties_hash == hash => PlanAction::NoOp,
        _ => PlanAction::Update,
    }
}

fn display_name(descriptor: &ResourceDescriptor) -> Option<&str> {
    match descriptor.properties.get("name") {
        Some(Value::Literal(serde_json::Value::String(s))) => Some(s),
        _ => None,
    }
}

fn describe_action(descriptor: &ResourceDescriptor, action: PlanAction, known_after: bool) -> String {
    let target = match display_name(descriptor) {
        Some(name) => format!("{} {}", descriptor.kind, name),
        None => descriptor.kind.to_string(),
    };
    let mut desc = match action {
        PlanAction::Create => format!("{}: create {}", descriptor.id, target),
        PlanAction::Update => format!("{}: update {}", descriptor.id, target),
        PlanAction::Delete => format!("{}: destroy {}", descriptor.id, target),
        PlanAction::NoOp => format!("{}: no changes", descriptor.id),
    };
    if known_after {
        desc.push_str(" (some values known after apply)");
    }
    desc
}

/// Diff every resource of `plan` against recorded state.
///
/// Properties are resolved against `outputs`; references that cannot be
/// resolved yet mark the change as known-after-apply.
pub fn diff(
    graph: &DependencyGraph,
    plan: &ExecutionPlan,
    states: &StateMap,
    outputs: &OutputSnapshot,
) -> Vec<PlannedChange> {
    let mut changes = Vec::with_capacity(plan.resource_count());
    for id in plan.order() {
        let Some(descriptor) = graph.get(&id) else {
            continue;
        };
        let desired_hash = outputs
            .resolve_properties(&descriptor.properties, &descriptor.id)
            .ok()
            .map(|props| hasher::hash_properties(descriptor.kind, &props));
        let known_after_apply = desired_hash.is_none();
        let action = determine_action(states.get(&id), desired_hash.as_deref());
        changes.push(PlannedChange {
            description: describe_action(descriptor, action, known_after_apply),
            resource_id: id,
            kind: descriptor.kind,
            action,
            known_after_apply,
        });
    }
    changes
}

/// Delete changes for orphans, in teardown order.
pub fn orphan_changes(states: &StateMap, graph: &DependencyGraph) -> Result<Vec<PlannedChange>> {
    let teardown = plan_orphans(states, graph)?;
    Ok(teardown
        .order()
        .into_iter()
        .filter_map(|id| states.get(&id))
        .map(|s| PlannedChange {
            resource_id: s.id.clone(),
            kind: s.kind,
            action: PlanAction::Delete,
            known_after_apply: false,
            description: format!("{}: destroy {} (no longer declared)", s.id, s.kind),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::GraphBuilder;
    use proptest::prelude::*;
    use serde_json::json;

    fn role(id: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(id, ResourceKind::IamRole)
            .prop("assume_role_policy", "{}")
            .prop("name", id)
    }

    fn build(descriptors: Vec<ResourceDescriptor>) -> DependencyGraph {
        let mut b = GraphBuilder::new();
        for d in descriptors {
            b.register(d).unwrap();
        }
        b.build().unwrap()
    }

    #[test]
    fn test_three_leaves_one_dependent() {
        let g = build(vec![
            role("a"),
            role("b"),
            role("c"),
            role("d").depends_on("a").depends_on("b").depends_on("c"),
        ]);
        let p = plan(&g).unwrap();
        assert_eq!(p.len(), 2);
        assert_eq!(p.batches[0], vec!["a", "b", "c"]);
        assert_eq!(p.batches[1], vec!["d"]);
    }

    #[test]
    fn test_destroy_reverses_apply() {
        let g = build(vec![role("b"), role("a").depends_on("b")]);
        let apply = plan(&g).unwrap();
        let destroy = plan_destroy(&g).unwrap();
        assert_eq!(apply.batches, vec![vec!["b"], vec!["a"]]);
        assert_eq!(destroy.batches, vec![vec!["a"], vec!["b"]]);
        assert_eq!(destroy.direction, PlanDirection::Destroy);
    }

    #[test]
    fn test_ties_follow_registration_order() {
        let g = build(vec![role("zeta"), role("alpha"), role("mid")]);
        assert_eq!(plan(&g).unwrap().batches, vec![vec!["zeta", "alpha", "mid"]]);
    }

    #[test]
    fn test_empty_graph_empty_plan() {
        let g = GraphBuilder::new().build().unwrap();
        assert!(plan(&g).unwrap().is_empty());
    }

    #[test]
    fn test_kahn_reports_cycle_members() {
        let deps = vec![vec![], vec![2], vec![1]];
        assert_eq!(kahn_batches(&deps).unwrap_err(), vec![1, 2]);
    }

    #[test]
    fn test_cycle_excludes_nodes_behind_it() {
        // 3 waits on the 1 <-> 2 loop, 4 closes a longer loop 4 -> 5 -> 6 -> 4
        let deps = vec![vec![], vec![2], vec![1], vec![1], vec![5], vec![6], vec![4]];
        let stuck = kahn_batches(&deps).unwrap_err();
        assert_eq!(stuck, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(cycle_among(&deps, &stuck), vec![1, 2, 1]);
        assert_eq!(cycle_among(&deps, &stuck[3..]), vec![4, 5, 6, 4]);
    }

    #[test]
    fn test_determine_action() {
        assert_eq!(determine_action(None, Some("blake3:x")), PlanAction::Create);

        let mut s = ResourceState::new("vpc", ResourceKind::Vpc);
        s.provider_id = Some("vpc-1".into());
        s.status = ResourceStatus::Created;
        s.properties_hash = "blake3:x".into();
        assert_eq!(determine_action(Some(&s), Some("blake3:x")), PlanAction::NoOp);
        assert_eq!(determine_action(Some(&s), Some("blake3:y")), PlanAction::Update);
        assert_eq!(determine_action(Some(&s), None), PlanAction::Update);

        s.status = ResourceStatus::Failed;
        assert_eq!(determine_action(Some(&s), Some("blake3:x")), PlanAction::Update);

        s.status = ResourceStatus::Deleted;
        assert_eq!(determine_action(Some(&s), Some("blake3:x")), PlanAction::Create);

        let never = ResourceState::new("vpc", ResourceKind::Vpc);
        assert_eq!(determine_action(Some(&never), Some("blake3:x")), PlanAction::Create);
    }

    fn recorded(g: &DependencyGraph, id: &str, outputs: serde_json::Value) -> ResourceState {
        let d = g.get(id).unwrap();
        let mut s = ResourceState::new(id, d.kind);
        s.provider_id = Some(format!("{}-1", id));
        s.status = ResourceStatus::Created;
        s.outputs = outputs;
        s
    }

    #[test]
    fn test_diff_fresh_stack_all_create_known_after_apply() {
        let g = build(vec![
            ResourceDescriptor::new("vpc", ResourceKind::Vpc).prop("cidr_block", "10.0.0.0/16"),
            ResourceDescriptor::new("igw", ResourceKind::InternetGateway)
                .prop("vpc_id", Value::output("vpc", "id")),
        ]);
        let p = plan(&g).unwrap();
        let states = StateMap::new();
        let changes = diff(&g, &p, &states, &preview_outputs(&states));
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.action == PlanAction::Create));
        assert!(!changes[0].known_after_apply);
        assert!(changes[1].known_after_apply);
        assert!(changes[1].description.contains("known after apply"));
    }

    #[test]
    fn test_diff_unchanged_and_updated() {
        let g = build(vec![
            ResourceDescriptor::new("vpc", ResourceKind::Vpc).prop("cidr_block", "10.0.0.0/16"),
            ResourceDescriptor::new("igw", ResourceKind::InternetGateway)
                .prop("vpc_id", Value::output("vpc", "id")),
        ]);
        let mut states = StateMap::new();
        let mut vpc = recorded(&g, "vpc", json!({"id": "vpc-1"}));
        vpc.properties_hash =
            hasher::hash_properties(ResourceKind::Vpc, &json!({"cidr_block": "10.0.0.0/16"}));
        let mut igw = recorded(&g, "igw", json!({"id": "igw-1"}));
        igw.properties_hash =
            hasher::hash_properties(ResourceKind::InternetGateway, &json!({"vpc_id": "vpc-OLD"}));
        states.insert("vpc".into(), vpc);
        states.insert("igw".into(), igw);

        let p = plan(&g).unwrap();
        let changes = diff(&g, &p, &states, &preview_outputs(&states));
        assert_eq!(changes[0].action, PlanAction::NoOp);
        assert_eq!(changes[1].action, PlanAction::Update);
        assert!(!changes[1].known_after_apply);
        let summary = PlanSummary::from_changes(&changes);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.to_update, 1);
    }

    #[test]
    fn test_orphans_planned_in_reverse_dependency_order() {
        let g = build(vec![role("kept")]);
        let mut states = StateMap::new();
        let mut kept = ResourceState::new("kept", ResourceKind::IamRole);
        kept.provider_id = Some("r-1".into());
        kept.status = ResourceStatus::Created;
        let mut policy = ResourceState::new("old-policy", ResourceKind::IamPolicy);
        policy.provider_id = Some("p-1".into());
        policy.status = ResourceStatus::Created;
        let mut attach = ResourceState::new("old-attach", ResourceKind::RolePolicyAttachment);
        attach.provider_id = Some("a-1".into());
        attach.status = ResourceStatus::Created;
        attach.dependencies = vec!["kept".into(), "old-policy".into()];
        states.insert("kept".into(), kept);
        states.insert("old-policy".into(), policy);
        states.insert("old-attach".into(), attach);

        let teardown = plan_orphans(&states, &g).unwrap();
        assert_eq!(teardown.batches, vec![vec!["old-attach"], vec!["old-policy"]]);
        let changes = orphan_changes(&states, &g).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.action == PlanAction::Delete));
    }

    #[test]
    fn test_teardown_cycle_in_state_is_reported() {
        let mut a = ResourceState::new("a", ResourceKind::IamRole);
        a.dependencies = vec!["b".into()];
        let mut b = ResourceState::new("b", ResourceKind::IamRole);
        b.dependencies = vec!["a".into()];
        assert!(matches!(
            plan_teardown(&[&a, &b]),
            Err(EngineError::CycleDetected(_))
        ));

        // c only hangs behind the loop and is not part of the reported path
        let mut a = ResourceState::new("a", ResourceKind::IamRole);
        a.dependencies = vec!["b".into(), "c".into()];
        let c = ResourceState::new("c", ResourceKind::IamRole);
        match plan_teardown(&[&a, &b, &c]) {
            Err(EngineError::CycleDetected(path)) => assert_eq!(path, vec!["a", "b", "a"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn arb_dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
        (1usize..24).prop_flat_map(|n| {
            proptest::collection::vec(proptest::collection::vec(any::<prop::sample::Index>(), 0..4), n)
                .prop_map(move |raw| {
                    raw.into_iter()
                        .enumerate()
                        .map(|(node, picks)| {
                            if node == 0 {
                                return Vec::new();
                            }
                            let mut deps: Vec<usize> =
                                picks.iter().map(|ix| ix.index(node)).collect();
                            deps.sort_unstable();
                            deps.dedup();
                            deps
                        })
                        .collect()
                })
        })
    }

    proptest! {
        #[test]
        fn prop_batches_respect_every_edge(deps in arb_dag()) {
            let batches = kahn_batches(&deps).unwrap();
            let mut batch_of = vec![usize::MAX; deps.len()];
            for (b, batch) in batches.iter().enumerate() {
                for &node in batch {
                    prop_assert_eq!(batch_of[node], usize::MAX);
                    batch_of[node] = b;
                }
            }
            prop_assert!(batch_of.iter().all(|&b| b != usize::MAX));
            for (node, node_deps) in deps.iter().enumerate() {
                for &dep in node_deps {
                    prop_assert!(batch_of[dep] < batch_of[node]);
                }
            }
        }

        #[test]
        fn prop_destroy_respects_reversed_edges(deps in arb_dag()) {
            let batches = kahn_batches(&reversed(&deps)).unwrap();
            let mut batch_of = vec![0usize; deps.len()];
            for (b, batch) in batches.iter().enumerate() {
                for &node in batch {
                    batch_of[node] = b;
                }
            }
            for (node, node_deps) in deps.iter().enumerate() {
                for &dep in node_deps {
                    prop_assert!(batch_of[node] < batch_of[dep]);
                }
            }
        }
    }
}
