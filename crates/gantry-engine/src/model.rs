use std::collections::{HashMap, HashSet, VecDeque};

use gantry_core::error::{GantryError, Result};
use gantry_core::types::{GraphDefaults, GraphDefinition, Node};

/// Id-based adjacency over a graph definition. Values are indexes into
/// `definition.edges`, in declared order.
pub struct Adjacency {
    pub incoming: HashMap<String, Vec<usize>>,
    pub outgoing: HashMap<String, Vec<usize>>,
}

impl Adjacency {
    pub fn of(definition: &GraphDefinition) -> Self {
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in definition.edges.iter().enumerate() {
            outgoing.entry(edge.from.clone()).or_default().push(i);
            incoming.entry(edge.to.clone()).or_default().push(i);
        }
        Self { incoming, outgoing }
    }

    pub fn incoming_of(&self, node_id: &str) -> &[usize] {
        self.incoming.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn outgoing_of(&self, node_id: &str) -> &[usize] {
        self.outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Structural validation. Total and side-effect free; an invalid graph
/// is never instantiated.
///
/// Rejects: duplicate node ids, an entry id absent from the nodes, edges
/// referencing undefined nodes, edges into the entry, cycles (the error
/// names the offending cycle), and nodes with no path from the entry.
/// A node unreachable from the entry could never join the ready frontier
/// and would leave the workflow permanently uncompletable.
pub fn validate(definition: &GraphDefinition) -> Result<()> {
    let mut ids = HashSet::new();
    for node in &definition.nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(GantryError::Validation(format!(
                "duplicate node id '{}'",
                node.id
            )));
        }
    }

    if !ids.contains(definition.entry.as_str()) {
        return Err(GantryError::Validation(format!(
            "entry node '{}' is not defined",
            definition.entry
        )));
    }

    for edge in &definition.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !ids.contains(endpoint.as_str()) {
                return Err(GantryError::Validation(format!(
                    "edge {} -> {} references undefined node '{}'",
                    edge.from, edge.to, endpoint
                )));
            }
        }
        if edge.to == definition.entry {
            return Err(GantryError::Validation(format!(
                "entry node '{}' has an incoming edge from '{}'",
                definition.entry, edge.from
            )));
        }
    }

    if let Some(cycle) = find_cycle(definition) {
        return Err(GantryError::Validation(format!(
            "cycle detected: {}",
            cycle.join(" -> ")
        )));
    }

    let adjacency = Adjacency::of(definition);
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue = VecDeque::from([definition.entry.as_str()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        for &i in adjacency.outgoing_of(id) {
            queue.push_back(definition.edges[i].to.as_str());
        }
    }
    let mut orphans: Vec<&str> = definition
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| !seen.contains(id))
        .collect();
    if !orphans.is_empty() {
        orphans.sort_unstable();
        return Err(GantryError::Validation(format!(
            "nodes unreachable from entry '{}': {}",
            definition.entry,
            orphans.join(", ")
        )));
    }

    Ok(())
}

/// Iterative three-color DFS. Returns the cycle path (closed: first id
/// repeated at the end) when one exists.
fn find_cycle(definition: &GraphDefinition) -> Option<Vec<String>> {
    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;

    let adjacency = Adjacency::of(definition);
    let mut color: HashMap<&str, u8> = definition
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), WHITE))
        .collect();

    for start in &definition.nodes {
        if color[start.id.as_str()] != WHITE {
            continue;
        }
        // (node, next outgoing index to visit)
        let mut stack: Vec<(&str, usize)> = vec![(start.id.as_str(), 0)];
        color.insert(start.id.as_str(), GRAY);

        while let Some((node_id, edge_pos)) = stack.last().copied() {
            let outgoing = adjacency.outgoing_of(node_id);
            if edge_pos < outgoing.len() {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let target = definition.edges[outgoing[edge_pos]].to.as_str();
                match color[target] {
                    WHITE => {
                        color.insert(target, GRAY);
                        stack.push((target, 0));
                    }
                    GRAY => {
                        // Back edge: the cycle is the stack from `target` down.
                        let from = stack.iter().position(|(id, _)| *id == target).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            stack[from..].iter().map(|(id, _)| id.to_string()).collect();
                        cycle.push(target.to_string());
                        return Some(cycle);
                    }
                    _ => {}
                }
            } else {
                color.insert(node_id, BLACK);
                stack.pop();
            }
        }
    }
    None
}

/// Resolve whether a node's completion is gated: explicit node flag,
/// else the phase default, else false.
pub fn effective_gate_required(node: &Node, defaults: &GraphDefaults) -> bool {
    node.gate_required
        .or_else(|| defaults.gate_by_phase.get(&node.phase).copied())
        .unwrap_or(false)
}

/// Evidence kinds a node's gate demands: the node's own list, else the
/// phase default, else none.
pub fn effective_evidence_kinds(node: &Node, defaults: &GraphDefaults) -> Vec<String> {
    if !node.required_evidence.is_empty() {
        return node.required_evidence.clone();
    }
    defaults
        .evidence_by_phase
        .get(&node.phase)
        .cloned()
        .unwrap_or_default()
}

/// Cost of a node for critical-path analysis: the `cost` payload entry
/// when numeric, else the graph default.
pub fn node_cost(node: &Node, defaults: &GraphDefaults) -> f64 {
    node.payload
        .get("cost")
        .and_then(|v| v.as_f64())
        .unwrap_or_else(|| defaults.default_cost.unwrap_or(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::types::{Edge, GraphDefaults, Node, Phase};

    fn linear_graph() -> GraphDefinition {
        GraphDefinition {
            version: "1".into(),
            entry: "a".into(),
            nodes: vec![
                Node::task("a", "A", Phase::Analysis),
                Node::task("b", "B", Phase::Impl),
                Node::task("c", "C", Phase::Test),
            ],
            edges: vec![Edge::always("a", "b"), Edge::always("b", "c")],
            defaults: GraphDefaults::default(),
        }
    }

    #[test]
    fn valid_graph_passes() {
        assert!(validate(&linear_graph()).is_ok());
    }

    #[test]
    fn rejects_missing_entry() {
        let mut graph = linear_graph();
        graph.entry = "nope".into();
        let err = validate(&graph).unwrap_err();
        assert!(err.to_string().contains("entry node 'nope'"));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut graph = linear_graph();
        graph.nodes.push(Node::task("b", "B again", Phase::Impl));
        let err = validate(&graph).unwrap_err();
        assert!(err.to_string().contains("duplicate node id 'b'"));
    }

    #[test]
    fn rejects_dangling_edge() {
        let mut graph = linear_graph();
        graph.edges.push(Edge::always("c", "ghost"));
        let err = validate(&graph).unwrap_err();
        assert!(err.to_string().contains("undefined node 'ghost'"));
    }

    #[test]
    fn rejects_edge_into_entry() {
        let mut graph = linear_graph();
        graph.edges.push(Edge::always("c", "a"));
        let err = validate(&graph).unwrap_err();
        // c -> a also closes a cycle; the entry check fires first
        assert!(err.to_string().contains("incoming edge"));
    }

    #[test]
    fn reports_cycle_path() {
        let graph = GraphDefinition {
            version: "1".into(),
            entry: "a".into(),
            nodes: vec![
                Node::task("a", "A", Phase::Analysis),
                Node::task("b", "B", Phase::Impl),
                Node::task("c", "C", Phase::Impl),
            ],
            edges: vec![
                Edge::always("a", "b"),
                Edge::always("b", "c"),
                Edge::always("c", "b"),
            ],
            defaults: GraphDefaults::default(),
        };
        let err = validate(&graph).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cycle detected"), "{}", message);
        assert!(message.contains("b -> c -> b"), "{}", message);
    }

    #[test]
    fn rejects_nodes_unreachable_from_entry() {
        let mut graph = linear_graph();
        graph.nodes.push(Node::task("ghost", "Orphan", Phase::Impl));
        let err = validate(&graph).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("unreachable from entry 'a'"), "{}", message);
        assert!(message.contains("ghost"), "{}", message);
    }

    #[test]
    fn rejects_disconnected_subgraph() {
        let mut graph = linear_graph();
        graph.nodes.push(Node::task("x", "X", Phase::Impl));
        graph.nodes.push(Node::task("y", "Y", Phase::Impl));
        graph.edges.push(Edge::always("x", "y"));
        let err = validate(&graph).unwrap_err();
        assert!(err.to_string().contains("x, y"), "{}", err);
    }

    #[test]
    fn gate_resolution_precedence() {
        let mut defaults = GraphDefaults::default();
        defaults.gate_by_phase.insert(Phase::Test, true);

        let plain = Node::task("t1", "T1", Phase::Impl);
        let by_phase = Node::task("t2", "T2", Phase::Test);
        let mut opted_out = Node::task("t3", "T3", Phase::Test);
        opted_out.gate_required = Some(false);

        assert!(!effective_gate_required(&plain, &defaults));
        assert!(effective_gate_required(&by_phase, &defaults));
        assert!(!effective_gate_required(&opted_out, &defaults));
    }

    #[test]
    fn evidence_kind_resolution() {
        let mut defaults = GraphDefaults::default();
        defaults
            .evidence_by_phase
            .insert(Phase::Test, vec!["test".into()]);

        let by_phase = Node::task("t", "T", Phase::Test);
        let explicit = Node::task("r", "R", Phase::Review).gated(vec!["guard".into()]);

        assert_eq!(effective_evidence_kinds(&by_phase, &defaults), vec!["test"]);
        assert_eq!(effective_evidence_kinds(&explicit, &defaults), vec!["guard"]);
    }

    #[test]
    fn cost_from_payload() {
        let defaults = GraphDefaults {
            default_cost: Some(2.0),
            ..Default::default()
        };
        let plain = Node::task("a", "A", Phase::Impl);
        let priced = Node::task("b", "B", Phase::Impl).with_payload("cost", serde_json::json!(7));

        assert_eq!(node_cost(&plain, &defaults), 2.0);
        assert_eq!(node_cost(&priced, &defaults), 7.0);
    }
}
