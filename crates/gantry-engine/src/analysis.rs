//! Read-only graph analysis: progress counts, critical path, structural
//! parallelism, and unreachable-node reporting.
//!
//! `analyze` is a pure function over the instance, so two calls with no
//! intervening transitions return identical output.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use gantry_core::types::{GraphInstance, InstanceStatus, NodeStatus, StatusCounts};

use crate::model::{self, Adjacency};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphAnalysis {
    pub workflow_id: String,
    pub status: InstanceStatus,
    pub counts: StatusCounts,
    /// Longest cumulative-cost path from entry to a terminal node; ties
    /// broken by the lexicographically smallest node-id sequence.
    pub critical_path: Vec<String>,
    pub critical_path_cost: f64,
    /// Cost of critical-path nodes not yet done or skipped.
    pub remaining_cost: f64,
    /// Topological waves: nodes in one group have no path between them
    /// and could run simultaneously.
    pub parallel_groups: Vec<Vec<String>>,
    pub max_parallelism: usize,
    /// Pending nodes downstream of a terminal failure. Never silently
    /// dropped.
    pub unreachable: Vec<String>,
}

pub fn analyze(instance: &GraphInstance) -> GraphAnalysis {
    let adjacency = Adjacency::of(&instance.graph);

    let mut counts = StatusCounts::default();
    for node in &instance.graph.nodes {
        counts.record(instance.status_of(&node.id));
    }

    let reachable = reachable_from_entry(instance, &adjacency);
    let (critical_path, critical_path_cost) = critical_path(instance, &adjacency, &reachable);
    let remaining_cost = critical_path
        .iter()
        .filter(|id| !instance.status_of(id).is_settled())
        .map(|id| {
            instance
                .graph
                .node(id)
                .map(|n| model::node_cost(n, &instance.graph.defaults))
                .unwrap_or(0.0)
        })
        .sum();

    let parallel_groups = topological_waves(instance, &adjacency, &reachable);
    let max_parallelism = parallel_groups.iter().map(Vec::len).max().unwrap_or(0);

    GraphAnalysis {
        workflow_id: instance.id.to_string(),
        status: instance.status,
        counts,
        critical_path,
        critical_path_cost,
        remaining_cost,
        parallel_groups,
        max_parallelism,
        unreachable: unreachable_nodes(instance, &adjacency),
    }
}

fn reachable_from_entry(instance: &GraphInstance, adjacency: &Adjacency) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([instance.graph.entry.clone()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        for &i in adjacency.outgoing_of(&id) {
            queue.push_back(instance.graph.edges[i].to.clone());
        }
    }
    seen
}

/// Dynamic programming over topological order. Each reachable node keeps
/// the best (cost, path) from the entry; on a cost tie the
/// lexicographically smaller path wins.
fn critical_path(
    instance: &GraphInstance,
    adjacency: &Adjacency,
    reachable: &HashSet<String>,
) -> (Vec<String>, f64) {
    let graph = &instance.graph;
    let mut best: HashMap<String, (f64, Vec<String>)> = HashMap::new();
    best.insert(
        graph.entry.clone(),
        (
            graph
                .node(&graph.entry)
                .map(|n| model::node_cost(n, &graph.defaults))
                .unwrap_or(0.0),
            vec![graph.entry.clone()],
        ),
    );

    for id in topological_order(instance, adjacency) {
        if !reachable.contains(&id) {
            continue;
        }
        let Some((cost_here, path_here)) = best.get(&id).cloned() else {
            continue;
        };
        for &i in adjacency.outgoing_of(&id) {
            let to = &graph.edges[i].to;
            let Some(to_node) = graph.node(to) else {
                continue;
            };
            let candidate_cost = cost_here + model::node_cost(to_node, &graph.defaults);
            let mut candidate_path = path_here.clone();
            candidate_path.push(to.clone());

            let better = match best.get(to) {
                None => true,
                Some((existing_cost, existing_path)) => {
                    candidate_cost > existing_cost + 1e-9
                        || ((candidate_cost - existing_cost).abs() <= 1e-9
                            && candidate_path < *existing_path)
                }
            };
            if better {
                best.insert(to.clone(), (candidate_cost, candidate_path));
            }
        }
    }

    // Longest path ending at a terminal (no outgoing edges)
    let mut result: Option<(f64, Vec<String>)> = None;
    for node in &graph.nodes {
        if !adjacency.outgoing_of(&node.id).is_empty() {
            continue;
        }
        let Some((cost, path)) = best.get(&node.id) else {
            continue;
        };
        let replace = match &result {
            None => true,
            Some((best_cost, best_path)) => {
                *cost > best_cost + 1e-9
                    || ((cost - best_cost).abs() <= 1e-9 && path < best_path)
            }
        };
        if replace {
            result = Some((*cost, path.clone()));
        }
    }
    match result {
        Some((cost, path)) => (path, cost),
        None => (vec![], 0.0),
    }
}

/// Kahn's algorithm; ties resolved by node declaration order.
fn topological_order(instance: &GraphInstance, adjacency: &Adjacency) -> Vec<String> {
    let graph = &instance.graph;
    let mut in_degree: HashMap<&str, usize> = graph
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), adjacency.incoming_of(&n.id).len()))
        .collect();

    let mut order = Vec::with_capacity(graph.nodes.len());
    let mut frontier: VecDeque<String> = graph
        .nodes
        .iter()
        .filter(|n| in_degree[n.id.as_str()] == 0)
        .map(|n| n.id.clone())
        .collect();

    while let Some(id) = frontier.pop_front() {
        order.push(id.clone());
        for &i in adjacency.outgoing_of(&id) {
            let to = graph.edges[i].to.as_str();
            if let Some(degree) = in_degree.get_mut(to) {
                *degree -= 1;
                if *degree == 0 {
                    frontier.push_back(to.to_string());
                }
            }
        }
    }
    order
}

/// Structural waves over the reachable subgraph, ignoring runtime state
/// and conditions: wave N holds the nodes whose predecessors all sit in
/// earlier waves, so members of one wave have no path between them.
fn topological_waves(
    instance: &GraphInstance,
    adjacency: &Adjacency,
    reachable: &HashSet<String>,
) -> Vec<Vec<String>> {
    let graph = &instance.graph;
    let mut done: HashSet<&str> = HashSet::new();
    let mut waves = Vec::new();

    loop {
        let mut wave: Vec<String> = graph
            .nodes
            .iter()
            .filter(|n| reachable.contains(&n.id) && !done.contains(n.id.as_str()))
            .filter(|n| {
                adjacency
                    .incoming_of(&n.id)
                    .iter()
                    .all(|&i| done.contains(graph.edges[i].from.as_str()))
            })
            .map(|n| n.id.clone())
            .collect();
        if wave.is_empty() {
            break;
        }
        wave.sort();
        for id in &wave {
            if let Some(node) = graph.node(id) {
                done.insert(node.id.as_str());
            }
        }
        waves.push(wave);
    }
    waves
}

/// Pending descendants of terminally failed nodes.
fn unreachable_nodes(instance: &GraphInstance, adjacency: &Adjacency) -> Vec<String> {
    let mut queue: VecDeque<String> = instance
        .graph
        .nodes
        .iter()
        .filter(|n| instance.status_of(&n.id) == NodeStatus::Failed)
        .map(|n| n.id.clone())
        .collect();

    let mut visited: HashSet<String> = queue.iter().cloned().collect();
    let mut unreachable = Vec::new();
    while let Some(id) = queue.pop_front() {
        for &i in adjacency.outgoing_of(&id) {
            let to = instance.graph.edges[i].to.clone();
            if !visited.insert(to.clone()) {
                continue;
            }
            if instance.status_of(&to) == NodeStatus::Pending {
                unreachable.push(to.clone());
            }
            queue.push_back(to);
        }
    }
    unreachable.sort();
    unreachable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateEvaluator;
    use crate::scheduler::Scheduler;
    use gantry_core::event::NullSink;
    use gantry_core::types::{Edge, GraphDefaults, GraphDefinition, Node, Phase};
    use serde_json::json;

    fn diamond() -> GraphInstance {
        // a -> {b, c} -> d, with b the expensive side
        let graph = GraphDefinition {
            version: "1".into(),
            entry: "a".into(),
            nodes: vec![
                Node::task("a", "A", Phase::Analysis),
                Node::task("b", "B", Phase::Impl).with_payload("cost", json!(5)),
                Node::task("c", "C", Phase::Impl),
                Node::task("d", "D", Phase::Test),
            ],
            edges: vec![
                Edge::always("a", "b"),
                Edge::always("a", "c"),
                Edge::always("b", "d"),
                Edge::always("c", "d"),
            ],
            defaults: GraphDefaults::default(),
        };
        GraphInstance::new(graph, 3)
    }

    #[test]
    fn critical_path_follows_cost() {
        let analysis = analyze(&diamond());
        assert_eq!(analysis.critical_path, vec!["a", "b", "d"]);
        assert_eq!(analysis.critical_path_cost, 7.0);
        assert_eq!(analysis.remaining_cost, 7.0);
    }

    #[test]
    fn critical_path_tie_breaks_lexicographically() {
        let mut inst = diamond();
        // equal costs on both sides: a->b->d vs a->c->d tie, b < c wins
        inst.graph.nodes[1].payload.clear();
        let analysis = analyze(&inst);
        assert_eq!(analysis.critical_path, vec!["a", "b", "d"]);
        assert_eq!(analysis.critical_path_cost, 3.0);
    }

    #[test]
    fn remaining_cost_shrinks_as_work_settles() {
        let s = Scheduler::new(GateEvaluator::default());
        let mut inst = diamond();
        s.start_node(&mut inst, "a", &mut NullSink).unwrap();
        s.complete_node(&mut inst, "a", None, &mut NullSink).unwrap();

        let analysis = analyze(&inst);
        assert_eq!(analysis.critical_path_cost, 7.0);
        assert_eq!(analysis.remaining_cost, 6.0);
    }

    #[test]
    fn parallel_groups_are_waves() {
        let analysis = analyze(&diamond());
        assert_eq!(
            analysis.parallel_groups,
            vec![vec!["a".to_string()], vec!["b".into(), "c".into()], vec!["d".into()]]
        );
        assert_eq!(analysis.max_parallelism, 2);
    }

    #[test]
    fn counts_reflect_runtime_state() {
        let s = Scheduler::new(GateEvaluator::default());
        let mut inst = diamond();
        s.start_node(&mut inst, "a", &mut NullSink).unwrap();

        let analysis = analyze(&inst);
        assert_eq!(analysis.counts.running, 1);
        assert_eq!(analysis.counts.pending, 3);
        assert_eq!(analysis.counts.total(), 4);
    }

    #[test]
    fn analyze_is_idempotent() {
        let s = Scheduler::new(GateEvaluator::default());
        let mut inst = diamond();
        s.start_node(&mut inst, "a", &mut NullSink).unwrap();
        s.complete_node(&mut inst, "a", Some(json!({"ok": 1})), &mut NullSink)
            .unwrap();

        let first = serde_json::to_value(analyze(&inst)).unwrap();
        let second = serde_json::to_value(analyze(&inst)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unreachable_nodes_are_surfaced() {
        let s = Scheduler::new(GateEvaluator::default());
        let mut inst = diamond();
        inst.max_retries = 0;
        s.start_node(&mut inst, "a", &mut NullSink).unwrap();
        s.complete_node(&mut inst, "a", None, &mut NullSink).unwrap();
        s.start_node(&mut inst, "b", &mut NullSink).unwrap();
        s.fail_node(&mut inst, "b", "boom", &mut NullSink).unwrap();

        let analysis = analyze(&inst);
        assert_eq!(analysis.unreachable, vec!["d"]);
        assert_eq!(analysis.counts.failed, 1);
    }
}
