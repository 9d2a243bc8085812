use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique workflow instance identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a node represents in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A unit of work performed by the external driver.
    Task,
    /// Selects exactly one outgoing edge by condition; the rest are skipped.
    Decision,
    /// Waits for every incoming branch to finish before becoming ready.
    Join,
}

/// Engineering phase a node belongs to. Phase defaults (gates, required
/// evidence) are resolved against this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Analysis,
    Plan,
    Impl,
    Test,
    Review,
}

/// A node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: String,
    #[serde(default = "default_node_kind")]
    pub kind: NodeKind,
    /// Human-readable label.
    pub label: String,
    pub phase: Phase,
    /// Explicit gate override. Unset means the phase default applies.
    #[serde(default)]
    pub gate_required: Option<bool>,
    /// Evidence kinds this node's gate demands. Empty means the phase
    /// default applies.
    #[serde(default)]
    pub required_evidence: Vec<String>,
    /// Opaque metadata for the driver: tool hints, cost estimate,
    /// advisory timeout_ms. The engine only reads `cost`.
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

fn default_node_kind() -> NodeKind {
    NodeKind::Task
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind, label: impl Into<String>, phase: Phase) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            phase,
            gate_required: None,
            required_evidence: vec![],
            payload: serde_json::Map::new(),
        }
    }

    pub fn task(id: impl Into<String>, label: impl Into<String>, phase: Phase) -> Self {
        Self::new(id, NodeKind::Task, label, phase)
    }

    pub fn decision(id: impl Into<String>, label: impl Into<String>, phase: Phase) -> Self {
        Self::new(id, NodeKind::Decision, label, phase)
    }

    pub fn join(id: impl Into<String>, label: impl Into<String>, phase: Phase) -> Self {
        Self::new(id, NodeKind::Join, label, phase)
    }

    /// Require a gate with the given evidence kinds.
    pub fn gated(mut self, kinds: Vec<String>) -> Self {
        self.gate_required = Some(true);
        self.required_evidence = kinds;
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}

/// Condition guarding an edge, evaluated against the accumulated results
/// store. `path` is a dot-separated path rooted at a node id, e.g.
/// `"build.report.ok"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Deep equality of the resolved value against `value`.
    Equals {
        path: String,
        value: serde_json::Value,
    },
    /// The resolved value is present.
    Exists { path: String },
    /// The resolved value is truthy (non-null, non-false, non-zero,
    /// non-empty).
    Truthy { path: String },
}

/// An edge connecting two nodes in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Condition that must hold to traverse this edge. Unconditional
    /// when unset.
    #[serde(default)]
    pub condition: Option<EdgeCondition>,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    /// Create a conditional edge.
    pub fn when(from: impl Into<String>, to: impl Into<String>, condition: EdgeCondition) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: Some(condition),
        }
    }
}

/// Per-graph defaults applied when a node does not override them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDefaults {
    /// Whether nodes of a phase are gated by default.
    #[serde(default)]
    pub gate_by_phase: HashMap<Phase, bool>,
    /// Evidence kinds gates of a phase demand by default.
    #[serde(default)]
    pub evidence_by_phase: HashMap<Phase, Vec<String>>,
    /// Cost assumed for nodes whose payload carries no `cost`.
    #[serde(default)]
    pub default_cost: Option<f64>,
    /// Per-graph retry budget override.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Advisory timeout the driver enforces; never acted on by the engine.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// A workflow graph definition. Validated structurally before any
/// instance is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default = "default_version")]
    pub version: String,
    /// Entry node id; must have in-degree 0.
    pub entry: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub defaults: GraphDefaults,
}

fn default_version() -> String {
    "1".to_string()
}

impl GraphDefinition {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Status of a single node within a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Done,
    /// Gate unsatisfied on a completion attempt. Recoverable, never
    /// terminal.
    Blocked,
    /// Retries exhausted. Terminal.
    Failed,
    Skipped,
}

impl NodeStatus {
    /// Done or skipped, the statuses that satisfy a dependent's
    /// prerequisite.
    pub fn is_settled(self) -> bool {
        matches!(self, NodeStatus::Done | NodeStatus::Skipped)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Done => "done",
            NodeStatus::Blocked => "blocked",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Overall status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Runtime state of one node. Created lazily the first time the node
/// enters the ready frontier; mutated only by scheduler transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRuntimeState {
    pub status: NodeStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Set when an administrative bypass forced this node past its gate.
    #[serde(default)]
    pub gate_bypassed: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for NodeRuntimeState {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            retry_count: 0,
            last_error: None,
            gate_bypassed: false,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Externally reported success record attached to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub kind: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub source: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl Evidence {
    pub fn new(kind: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            value,
            source: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Per-instance collection of evidence, keyed by node id then kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceSet {
    entries: HashMap<String, HashMap<String, Evidence>>,
}

impl EvidenceSet {
    /// Attach evidence to a node. A later record of the same kind
    /// replaces the earlier one.
    pub fn attach(&mut self, node_id: impl Into<String>, evidence: Evidence) {
        self.entries
            .entry(node_id.into())
            .or_default()
            .insert(evidence.kind.clone(), evidence);
    }

    pub fn has(&self, node_id: &str, kind: &str) -> bool {
        self.entries
            .get(node_id)
            .is_some_and(|kinds| kinds.contains_key(kind))
    }

    pub fn for_node(&self, node_id: &str) -> Option<&HashMap<String, Evidence>> {
        self.entries.get(node_id)
    }
}

/// A live workflow: graph definition plus per-node runtime state, the
/// accumulated results store, and attached evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphInstance {
    pub id: WorkflowId,
    pub graph: GraphDefinition,
    pub status: InstanceStatus,
    #[serde(default)]
    pub node_states: HashMap<String, NodeRuntimeState>,
    /// Results store: node id → the result the driver reported on
    /// completion. Edge conditions resolve paths into this map.
    #[serde(default)]
    pub results: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub evidence: EvidenceSet,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GraphInstance {
    pub fn new(graph: GraphDefinition, max_retries: u32) -> Self {
        let max_retries = graph.defaults.max_retries.unwrap_or(max_retries);
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            graph,
            status: InstanceStatus::Pending,
            node_states: HashMap::new(),
            results: serde_json::Map::new(),
            evidence: EvidenceSet::default(),
            max_retries,
            created_at: now,
            updated_at: now,
        }
    }

    /// Status of a node; nodes without materialized state are pending.
    pub fn status_of(&self, node_id: &str) -> NodeStatus {
        self.node_states
            .get(node_id)
            .map(|s| s.status)
            .unwrap_or(NodeStatus::Pending)
    }

    /// Materialize runtime state for a node entering the frontier.
    pub fn ensure_state(&mut self, node_id: &str) -> &mut NodeRuntimeState {
        self.node_states.entry(node_id.to_string()).or_default()
    }

    /// Fraction of nodes that are done or skipped.
    pub fn progress(&self) -> f64 {
        if self.graph.nodes.is_empty() {
            return 0.0;
        }
        let settled = self
            .graph
            .nodes
            .iter()
            .filter(|n| self.status_of(&n.id).is_settled())
            .count();
        settled as f64 / self.graph.nodes.len() as f64
    }
}

/// Counts of nodes by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub blocked: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: NodeStatus) {
        match status {
            NodeStatus::Pending => self.pending += 1,
            NodeStatus::Running => self.running += 1,
            NodeStatus::Done => self.done += 1,
            NodeStatus::Blocked => self.blocked += 1,
            NodeStatus::Failed => self.failed += 1,
            NodeStatus::Skipped => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.done + self.blocked + self.failed + self.skipped
    }
}

/// Per-node entry in a progress snapshot. Metadata only, no result
/// payloads, so the snapshot stays cheap to persist on every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeProgress {
    pub status: NodeStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub gate_bypassed: bool,
}

/// The most recent gate block, kept for resumption diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedRecord {
    pub node_id: String,
    pub reason: String,
    pub missing_evidence: Vec<String>,
    pub next_tool_calls: Vec<String>,
    pub blocked_at: DateTime<Utc>,
}

/// Lightweight persistable view of a workflow, maintained by the
/// progress tracker and written on every transition. This is what a
/// resumed session reads instead of replaying the whole graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub workflow_id: String,
    pub graph_version: String,
    pub node_states: BTreeMap<String, NodeProgress>,
    pub summary: StatusCounts,
    #[serde(default)]
    pub last_blocked: Option<BlockedRecord>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Summary row returned by workflow listing; full instance bodies are
/// never materialized for a list call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub status: InstanceStatus,
    pub progress: f64,
    pub node_count: usize,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_builders() {
        let node = Node::task("build", "Build the crate", Phase::Impl)
            .gated(vec!["test".into()])
            .with_payload("cost", serde_json::json!(3.5));

        assert_eq!(node.id, "build");
        assert_eq!(node.kind, NodeKind::Task);
        assert_eq!(node.gate_required, Some(true));
        assert_eq!(node.required_evidence, vec!["test"]);
        assert_eq!(node.payload.get("cost"), Some(&serde_json::json!(3.5)));
    }

    #[test]
    fn edge_condition_serde_roundtrip() {
        let edge = Edge::when(
            "b",
            "c",
            EdgeCondition::Equals {
                path: "b.ok".into(),
                value: serde_json::json!(true),
            },
        );
        let json = serde_json::to_string(&edge).unwrap();
        assert!(json.contains(r#""type":"equals""#));
        let parsed: Edge = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.condition, edge.condition);
    }

    #[test]
    fn status_of_defaults_to_pending() {
        let graph = GraphDefinition {
            version: "1".into(),
            entry: "a".into(),
            nodes: vec![Node::task("a", "A", Phase::Analysis)],
            edges: vec![],
            defaults: GraphDefaults::default(),
        };
        let instance = GraphInstance::new(graph, 3);
        assert_eq!(instance.status_of("a"), NodeStatus::Pending);
        assert!(instance.node_states.is_empty());
    }

    #[test]
    fn evidence_set_replaces_same_kind() {
        let mut set = EvidenceSet::default();
        set.attach("f", Evidence::new("test", serde_json::json!({"passed": false})));
        set.attach("f", Evidence::new("test", serde_json::json!({"passed": true})));

        assert!(set.has("f", "test"));
        let kinds = set.for_node("f").unwrap();
        assert_eq!(kinds.len(), 1);
        assert_eq!(kinds["test"].value["passed"], serde_json::json!(true));
    }

    #[test]
    fn progress_fraction() {
        let graph = GraphDefinition {
            version: "1".into(),
            entry: "a".into(),
            nodes: vec![
                Node::task("a", "A", Phase::Analysis),
                Node::task("b", "B", Phase::Impl),
            ],
            edges: vec![Edge::always("a", "b")],
            defaults: GraphDefaults::default(),
        };
        let mut instance = GraphInstance::new(graph, 3);
        assert_eq!(instance.progress(), 0.0);
        instance.ensure_state("a").status = NodeStatus::Done;
        assert_eq!(instance.progress(), 0.5);
    }
}
