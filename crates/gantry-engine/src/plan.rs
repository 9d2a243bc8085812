//! Advisory batch planning: a pure dry run over the current instance
//! state that never mutates it.
//!
//! Execution of the underlying work happens entirely at the caller's
//! layer; batches only promise that their members have no dependency on
//! one another.

use std::collections::HashSet;

use gantry_core::types::{GraphInstance, NodeStatus};

use crate::condition;
use crate::model::Adjacency;

/// Produce an ordered execution plan from the instance's current state,
/// assuming each prior batch completes before the next begins. Each
/// batch holds at most `max_parallel` nodes, sorted by id.
///
/// Running and blocked nodes are treated as completing before the plan
/// begins; terminally failed nodes and their dependents are never
/// planned. Conditions on branches that have not executed yet are
/// unknowable and assumed traversable, so a future decision contributes
/// all of its children to the plan.
pub fn plan_batches(instance: &GraphInstance, max_parallel: usize) -> Vec<Vec<String>> {
    let max_parallel = max_parallel.max(1);
    let adjacency = Adjacency::of(&instance.graph);
    let graph = &instance.graph;

    let mut settled: HashSet<String> = graph
        .nodes
        .iter()
        .filter(|n| {
            matches!(
                instance.status_of(&n.id),
                NodeStatus::Done | NodeStatus::Skipped | NodeStatus::Running | NodeStatus::Blocked
            )
        })
        .map(|n| n.id.clone())
        .collect();
    let failed: HashSet<&str> = graph
        .nodes
        .iter()
        .filter(|n| instance.status_of(&n.id) == NodeStatus::Failed)
        .map(|n| n.id.as_str())
        .collect();

    let mut batches = Vec::new();
    loop {
        let mut ready: Vec<String> = graph
            .nodes
            .iter()
            .filter(|n| !settled.contains(&n.id) && !failed.contains(n.id.as_str()))
            .filter(|n| hypothetically_ready(instance, &adjacency, &settled, &failed, &n.id))
            .map(|n| n.id.clone())
            .collect();
        if ready.is_empty() {
            break;
        }
        ready.sort();
        ready.truncate(max_parallel);
        settled.extend(ready.iter().cloned());
        batches.push(ready);
    }
    batches
}

fn hypothetically_ready(
    instance: &GraphInstance,
    adjacency: &Adjacency,
    settled: &HashSet<String>,
    failed: &HashSet<&str>,
    node_id: &str,
) -> bool {
    let incoming = adjacency.incoming_of(node_id);
    if incoming.is_empty() {
        return node_id == instance.graph.entry;
    }
    incoming.iter().all(|&i| {
        let edge = &instance.graph.edges[i];
        if failed.contains(edge.from.as_str()) || !settled.contains(&edge.from) {
            return false;
        }
        match &edge.condition {
            None => true,
            Some(cond) => {
                // Evaluate only against results that actually exist; a
                // branch that has not run yet could still go either way.
                let root = condition_root(cond);
                if instance.results.contains_key(root) {
                    condition::evaluate(cond, &instance.results)
                } else {
                    true
                }
            }
        }
    })
}

fn condition_root(condition: &gantry_core::types::EdgeCondition) -> &str {
    let path = match condition {
        gantry_core::types::EdgeCondition::Equals { path, .. }
        | gantry_core::types::EdgeCondition::Exists { path }
        | gantry_core::types::EdgeCondition::Truthy { path } => path,
    };
    path.split('.').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateEvaluator;
    use crate::scheduler::Scheduler;
    use gantry_core::event::NullSink;
    use gantry_core::types::{
        Edge, EdgeCondition, GraphDefaults, GraphDefinition, Node, Phase,
    };
    use serde_json::json;

    fn wide_graph() -> GraphInstance {
        // a fans out to b/c/d, all joining at e
        let graph = GraphDefinition {
            version: "1".into(),
            entry: "a".into(),
            nodes: vec![
                Node::task("a", "A", Phase::Analysis),
                Node::task("b", "B", Phase::Impl),
                Node::task("c", "C", Phase::Impl),
                Node::task("d", "D", Phase::Impl),
                Node::join("e", "E", Phase::Test),
            ],
            edges: vec![
                Edge::always("a", "b"),
                Edge::always("a", "c"),
                Edge::always("a", "d"),
                Edge::always("b", "e"),
                Edge::always("c", "e"),
                Edge::always("d", "e"),
            ],
            defaults: GraphDefaults::default(),
        };
        GraphInstance::new(graph, 3)
    }

    #[test]
    fn unbounded_plan_is_waves() {
        let plan = plan_batches(&wide_graph(), usize::MAX);
        assert_eq!(
            plan,
            vec![
                vec!["a".to_string()],
                vec!["b".into(), "c".into(), "d".into()],
                vec!["e".into()],
            ]
        );
    }

    #[test]
    fn max_parallel_caps_batches() {
        let plan = plan_batches(&wide_graph(), 2);
        assert_eq!(
            plan,
            vec![
                vec!["a".to_string()],
                vec!["b".into(), "c".into()],
                vec!["d".into()],
                vec!["e".into()],
            ]
        );
    }

    #[test]
    fn plan_never_mutates() {
        let inst = wide_graph();
        let before = serde_json::to_value(&inst).unwrap();
        let _ = plan_batches(&inst, 2);
        let after = serde_json::to_value(&inst).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn plan_resumes_from_current_state() {
        let s = Scheduler::new(GateEvaluator::default());
        let mut inst = wide_graph();
        s.start_node(&mut inst, "a", &mut NullSink).unwrap();
        s.complete_node(&mut inst, "a", None, &mut NullSink).unwrap();
        s.start_node(&mut inst, "b", &mut NullSink).unwrap();

        // b is in flight, so the first batch is the remaining fan-out
        let plan = plan_batches(&inst, usize::MAX);
        assert_eq!(
            plan,
            vec![vec!["c".to_string(), "d".into()], vec!["e".into()]]
        );
    }

    #[test]
    fn failed_branches_are_excluded() {
        let s = Scheduler::new(GateEvaluator::default());
        let mut inst = wide_graph();
        inst.max_retries = 0;
        s.start_node(&mut inst, "a", &mut NullSink).unwrap();
        s.complete_node(&mut inst, "a", None, &mut NullSink).unwrap();
        s.start_node(&mut inst, "b", &mut NullSink).unwrap();
        s.fail_node(&mut inst, "b", "boom", &mut NullSink).unwrap();

        let plan = plan_batches(&inst, usize::MAX);
        // e depends on the failed b and is never planned
        assert_eq!(plan, vec![vec!["c".to_string(), "d".into()]]);
    }

    #[test]
    fn future_decision_includes_both_branches() {
        let graph = GraphDefinition {
            version: "1".into(),
            entry: "a".into(),
            nodes: vec![
                Node::decision("a", "Branch", Phase::Plan),
                Node::task("b", "B", Phase::Impl),
                Node::task("c", "C", Phase::Impl),
            ],
            edges: vec![
                Edge::when(
                    "a",
                    "b",
                    EdgeCondition::Truthy {
                        path: "a.fast".into(),
                    },
                ),
                Edge::always("a", "c"),
            ],
            defaults: GraphDefaults::default(),
        };
        let inst = GraphInstance::new(graph, 3);
        let plan = plan_batches(&inst, usize::MAX);
        assert_eq!(
            plan,
            vec![vec!["a".to_string()], vec!["b".into(), "c".into()]]
        );
    }

    #[test]
    fn executed_decision_respects_actual_results() {
        let graph = GraphDefinition {
            version: "1".into(),
            entry: "a".into(),
            nodes: vec![
                Node::decision("a", "Branch", Phase::Plan),
                Node::task("b", "B", Phase::Impl),
                Node::task("c", "C", Phase::Impl),
            ],
            edges: vec![
                Edge::when(
                    "a",
                    "b",
                    EdgeCondition::Truthy {
                        path: "a.fast".into(),
                    },
                ),
                Edge::always("a", "c"),
            ],
            defaults: GraphDefaults::default(),
        };
        let s = Scheduler::new(GateEvaluator::default());
        let mut inst = GraphInstance::new(graph, 3);
        s.start_node(&mut inst, "a", &mut NullSink).unwrap();
        s.complete_node(&mut inst, "a", Some(json!({"fast": false})), &mut NullSink)
            .unwrap();

        // b was skipped at completion; only c remains
        let plan = plan_batches(&inst, usize::MAX);
        assert_eq!(plan, vec![vec!["c".to_string()]]);
    }
}
