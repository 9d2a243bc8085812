//! The node state machine.
//!
//! Every operation is synchronous and total over explicit instance
//! state: transitions happen only through these calls, never from a
//! timer or a background task. Illegal calls return a transition error
//! with nothing mutated.

use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use gantry_core::error::{GantryError, Result};
use gantry_core::event::{EventSink, WorkflowEvent};
use gantry_core::types::{GraphInstance, InstanceStatus, NodeKind, NodeStatus};

use crate::condition;
use crate::gate::{GateEvaluator, GateOutcome};
use crate::model::{self, Adjacency};

/// Result of a completion attempt: either the node is done (with the
/// nodes it unlocked) or its gate left it blocked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteOutcome {
    pub status: NodeStatus,
    /// Nodes whose prerequisites this completion satisfied.
    pub unlocked: Vec<String>,
    /// Gate diagnostics, present when the node is blocked.
    pub gate: Option<GateOutcome>,
}

/// Result of a failure report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailOutcome {
    pub status: NodeStatus,
    pub retry_count: u32,
    pub will_retry: bool,
}

/// Drives node transitions on a graph instance.
///
/// The scheduler holds no instance state of its own; callers serialize
/// access per instance (the registry takes one lock per workflow id).
pub struct Scheduler {
    gate: GateEvaluator,
}

impl Scheduler {
    pub fn new(gate: GateEvaluator) -> Self {
        Self { gate }
    }

    pub fn gate(&self) -> &GateEvaluator {
        &self.gate
    }

    /// Pending nodes whose prerequisites are satisfied. Materializes
    /// runtime state for nodes entering the frontier.
    pub fn ready_nodes(&self, instance: &mut GraphInstance) -> Vec<String> {
        if instance.status == InstanceStatus::Paused {
            return vec![];
        }
        let ids = ready_ids(instance);
        for id in &ids {
            instance.ensure_state(id);
        }
        ids
    }

    /// `pending -> running`. Errors if the node is not pending or its
    /// prerequisites are unmet.
    pub fn start_node(
        &self,
        instance: &mut GraphInstance,
        node_id: &str,
        sink: &mut dyn EventSink,
    ) -> Result<()> {
        if instance.status == InstanceStatus::Paused {
            return Err(GantryError::Paused(instance.id.to_string()));
        }
        instance
            .graph
            .node(node_id)
            .ok_or_else(|| GantryError::NodeNotFound(node_id.to_string()))?;

        let status = instance.status_of(node_id);
        if status != NodeStatus::Pending {
            return Err(GantryError::Transition {
                node: node_id.to_string(),
                reason: format!("cannot start from status '{}'", status),
            });
        }
        let adjacency = Adjacency::of(&instance.graph);
        if !is_ready(instance, &adjacency, node_id) {
            return Err(GantryError::Transition {
                node: node_id.to_string(),
                reason: "prerequisites unmet".to_string(),
            });
        }

        let state = instance.ensure_state(node_id);
        state.status = NodeStatus::Running;
        state.started_at = Some(Utc::now());
        if instance.status == InstanceStatus::Pending {
            instance.status = InstanceStatus::Running;
        }
        instance.updated_at = Utc::now();

        info!(node_id = %node_id, "node started");
        sink.on_event(&WorkflowEvent::NodeStarted {
            node_id: node_id.to_string(),
        });
        Ok(())
    }

    /// `running -> done | blocked`, or `blocked -> done` on a re-attempt
    /// once evidence satisfies the gate.
    ///
    /// On success the result is merged into the results store under the
    /// node id, decision branches are pruned, and the newly ready
    /// frontier is returned.
    pub fn complete_node(
        &self,
        instance: &mut GraphInstance,
        node_id: &str,
        result: Option<serde_json::Value>,
        sink: &mut dyn EventSink,
    ) -> Result<CompleteOutcome> {
        let node = instance
            .graph
            .node(node_id)
            .cloned()
            .ok_or_else(|| GantryError::NodeNotFound(node_id.to_string()))?;

        let status = instance.status_of(node_id);
        if !matches!(status, NodeStatus::Running | NodeStatus::Blocked) {
            return Err(GantryError::Transition {
                node: node_id.to_string(),
                reason: format!("cannot complete from status '{}'", status),
            });
        }

        // Admission control applies to task nodes only.
        let gated = node.kind == NodeKind::Task
            && model::effective_gate_required(&node, &instance.graph.defaults);
        if gated {
            let outcome = self
                .gate
                .evaluate(&node, &instance.graph.defaults, &instance.evidence);
            if !outcome.satisfied {
                let re_attempt = status == NodeStatus::Blocked;
                instance.ensure_state(node_id).status = NodeStatus::Blocked;
                instance.updated_at = Utc::now();

                warn!(
                    node_id = %node_id,
                    missing = %outcome.missing_evidence.join(","),
                    "gate unsatisfied, node blocked"
                );
                let event = if re_attempt {
                    WorkflowEvent::GateBlocked {
                        node_id: node_id.to_string(),
                        missing_evidence: outcome.missing_evidence.clone(),
                        next_tool_calls: outcome.next_tool_calls.clone(),
                    }
                } else {
                    WorkflowEvent::NodeBlocked {
                        node_id: node_id.to_string(),
                        missing_evidence: outcome.missing_evidence.clone(),
                        next_tool_calls: outcome.next_tool_calls.clone(),
                    }
                };
                sink.on_event(&event);
                return Ok(CompleteOutcome {
                    status: NodeStatus::Blocked,
                    unlocked: vec![],
                    gate: Some(outcome),
                });
            }
            if status == NodeStatus::Blocked {
                sink.on_event(&WorkflowEvent::GatePassed {
                    node_id: node_id.to_string(),
                });
            }
        }

        let before: HashSet<String> = ready_ids(instance).into_iter().collect();
        {
            let state = instance.ensure_state(node_id);
            state.status = NodeStatus::Done;
            state.finished_at = Some(Utc::now());
            state.last_error = None;
        }
        if let Some(result) = result {
            instance.results.insert(node_id.to_string(), result);
        }

        let skipped = if node.kind == NodeKind::Decision {
            self.prune_decision(instance, node_id)
        } else {
            vec![]
        };

        let unlocked: Vec<String> = ready_ids(instance)
            .into_iter()
            .filter(|id| !before.contains(id))
            .collect();
        for id in &unlocked {
            instance.ensure_state(id);
        }
        instance.updated_at = Utc::now();

        debug!(node_id = %node_id, unlocked = ?unlocked, "node completed");
        sink.on_event(&WorkflowEvent::NodeCompleted {
            node_id: node_id.to_string(),
            unlocked: unlocked.clone(),
        });
        for id in &skipped {
            sink.on_event(&WorkflowEvent::NodeSkipped {
                node_id: id.clone(),
            });
        }
        self.refresh_status(instance, sink);

        Ok(CompleteOutcome {
            status: NodeStatus::Done,
            unlocked,
            gate: None,
        })
    }

    /// `running -> pending` while retries remain, else terminal
    /// `failed`. Failures never cascade: dependents stay pending and
    /// surface as unreachable in analysis.
    pub fn fail_node(
        &self,
        instance: &mut GraphInstance,
        node_id: &str,
        error: &str,
        sink: &mut dyn EventSink,
    ) -> Result<FailOutcome> {
        instance
            .graph
            .node(node_id)
            .ok_or_else(|| GantryError::NodeNotFound(node_id.to_string()))?;

        let status = instance.status_of(node_id);
        if status != NodeStatus::Running {
            return Err(GantryError::Transition {
                node: node_id.to_string(),
                reason: format!("cannot fail from status '{}'", status),
            });
        }

        let max_retries = instance.max_retries;
        let outcome = {
            let state = instance.ensure_state(node_id);
            state.last_error = Some(error.to_string());
            if state.retry_count < max_retries {
                state.retry_count += 1;
                state.status = NodeStatus::Pending;
                state.started_at = None;
                FailOutcome {
                    status: NodeStatus::Pending,
                    retry_count: state.retry_count,
                    will_retry: true,
                }
            } else {
                state.status = NodeStatus::Failed;
                state.finished_at = Some(Utc::now());
                FailOutcome {
                    status: NodeStatus::Failed,
                    retry_count: state.retry_count,
                    will_retry: false,
                }
            }
        };
        instance.updated_at = Utc::now();

        if outcome.will_retry {
            warn!(
                node_id = %node_id,
                retry = outcome.retry_count,
                max_retries,
                error = %error,
                "node failed, queued for retry"
            );
        } else {
            warn!(node_id = %node_id, error = %error, "node failed terminally");
        }
        sink.on_event(&WorkflowEvent::NodeFailed {
            node_id: node_id.to_string(),
            error: error.to_string(),
            retry_count: outcome.retry_count,
            will_retry: outcome.will_retry,
        });
        if !outcome.will_retry {
            self.refresh_status(instance, sink);
        }
        Ok(outcome)
    }

    /// Explicit caller skip of a pending node. Cascades to descendants
    /// left with only skipped predecessors.
    pub fn skip_node(
        &self,
        instance: &mut GraphInstance,
        node_id: &str,
        sink: &mut dyn EventSink,
    ) -> Result<Vec<String>> {
        instance
            .graph
            .node(node_id)
            .ok_or_else(|| GantryError::NodeNotFound(node_id.to_string()))?;

        let status = instance.status_of(node_id);
        if status != NodeStatus::Pending {
            return Err(GantryError::Transition {
                node: node_id.to_string(),
                reason: format!("cannot skip from status '{}'", status),
            });
        }

        let adjacency = Adjacency::of(&instance.graph);
        let mut skipped = Vec::new();
        mark_skipped_cascade(instance, &adjacency, node_id, &mut skipped);
        instance.updated_at = Utc::now();

        for id in &skipped {
            sink.on_event(&WorkflowEvent::NodeSkipped {
                node_id: id.clone(),
            });
        }
        self.refresh_status(instance, sink);
        Ok(skipped)
    }

    /// Administrative `blocked -> done` without evidence. Recorded as a
    /// bypass on the node's runtime state, distinct from genuine gate
    /// satisfaction.
    pub fn bypass_gate(
        &self,
        instance: &mut GraphInstance,
        node_id: &str,
        reason: &str,
        sink: &mut dyn EventSink,
    ) -> Result<Vec<String>> {
        instance
            .graph
            .node(node_id)
            .ok_or_else(|| GantryError::NodeNotFound(node_id.to_string()))?;

        let status = instance.status_of(node_id);
        if status != NodeStatus::Blocked {
            return Err(GantryError::Transition {
                node: node_id.to_string(),
                reason: format!("bypass requires a blocked node, found '{}'", status),
            });
        }

        let before: HashSet<String> = ready_ids(instance).into_iter().collect();
        {
            let state = instance.ensure_state(node_id);
            state.status = NodeStatus::Done;
            state.gate_bypassed = true;
            state.finished_at = Some(Utc::now());
        }
        let unlocked: Vec<String> = ready_ids(instance)
            .into_iter()
            .filter(|id| !before.contains(id))
            .collect();
        for id in &unlocked {
            instance.ensure_state(id);
        }
        instance.updated_at = Utc::now();

        warn!(node_id = %node_id, reason = %reason, "gate bypassed");
        sink.on_event(&WorkflowEvent::GateBypassed {
            node_id: node_id.to_string(),
            reason: reason.to_string(),
        });
        sink.on_event(&WorkflowEvent::NodeCompleted {
            node_id: node_id.to_string(),
            unlocked: unlocked.clone(),
        });
        self.refresh_status(instance, sink);
        Ok(unlocked)
    }

    /// Decision semantics: the first outgoing edge (declared order)
    /// whose condition holds selects the single live child; every other
    /// child is skipped, cascading through branches with no remaining
    /// live predecessor.
    fn prune_decision(&self, instance: &mut GraphInstance, node_id: &str) -> Vec<String> {
        let adjacency = Adjacency::of(&instance.graph);
        let outgoing: Vec<usize> = adjacency.outgoing_of(node_id).to_vec();

        let mut selected: Option<String> = None;
        for &i in &outgoing {
            let edge = &instance.graph.edges[i];
            let holds = edge
                .condition
                .as_ref()
                .map_or(true, |c| condition::evaluate(c, &instance.results));
            if holds {
                selected = Some(edge.to.clone());
                break;
            }
        }
        if selected.is_none() {
            warn!(node_id = %node_id, "no decision branch matched; all children skipped");
        }

        let mut skipped = Vec::new();
        for &i in &outgoing {
            let to = instance.graph.edges[i].to.clone();
            if selected.as_deref() != Some(to.as_str()) {
                mark_skipped_cascade(instance, &adjacency, &to, &mut skipped);
            }
        }
        skipped
    }

    /// Derive the overall instance status after a transition. The
    /// completed and failed events fire exactly once per workflow.
    fn refresh_status(&self, instance: &mut GraphInstance, sink: &mut dyn EventSink) {
        if matches!(
            instance.status,
            InstanceStatus::Paused | InstanceStatus::Completed | InstanceStatus::Failed
        ) {
            return;
        }

        let all_settled = instance
            .graph
            .nodes
            .iter()
            .all(|n| instance.status_of(&n.id).is_settled());
        if all_settled {
            instance.status = InstanceStatus::Completed;
            info!(workflow_id = %instance.id, "workflow completed");
            sink.on_event(&WorkflowEvent::WorkflowCompleted {
                workflow_id: instance.id.clone(),
            });
            return;
        }

        let any_failed = instance
            .graph
            .nodes
            .iter()
            .any(|n| instance.status_of(&n.id) == NodeStatus::Failed);
        let any_active = instance.graph.nodes.iter().any(|n| {
            matches!(
                instance.status_of(&n.id),
                NodeStatus::Running | NodeStatus::Blocked
            )
        });
        if any_failed && !any_active && ready_ids(instance).is_empty() {
            instance.status = InstanceStatus::Failed;
            warn!(workflow_id = %instance.id, "workflow failed, no further progress possible");
            sink.on_event(&WorkflowEvent::WorkflowFailed {
                workflow_id: instance.id.clone(),
            });
        }
    }
}

/// Prerequisite check for one node: every predecessor done or skipped,
/// and each edge from a done predecessor has a true condition. Edges
/// from skipped predecessors count as satisfied (the branch was pruned,
/// there is no result to test).
pub(crate) fn is_ready(instance: &GraphInstance, adjacency: &Adjacency, node_id: &str) -> bool {
    let incoming = adjacency.incoming_of(node_id);
    if incoming.is_empty() {
        return node_id == instance.graph.entry;
    }
    incoming.iter().all(|&i| {
        let edge = &instance.graph.edges[i];
        match instance.status_of(&edge.from) {
            NodeStatus::Skipped => true,
            NodeStatus::Done => edge
                .condition
                .as_ref()
                .map_or(true, |c| condition::evaluate(c, &instance.results)),
            _ => false,
        }
    })
}

/// Pending nodes currently ready, in node declaration order. Pure.
pub(crate) fn ready_ids(instance: &GraphInstance) -> Vec<String> {
    let adjacency = Adjacency::of(&instance.graph);
    instance
        .graph
        .nodes
        .iter()
        .filter(|n| {
            instance.status_of(&n.id) == NodeStatus::Pending
                && is_ready(instance, &adjacency, &n.id)
        })
        .map(|n| n.id.clone())
        .collect()
}

fn mark_skipped_cascade(
    instance: &mut GraphInstance,
    adjacency: &Adjacency,
    node_id: &str,
    skipped: &mut Vec<String>,
) {
    if instance.status_of(node_id) != NodeStatus::Pending {
        return;
    }
    {
        let state = instance.ensure_state(node_id);
        state.status = NodeStatus::Skipped;
        state.finished_at = Some(Utc::now());
    }
    skipped.push(node_id.to_string());

    let successors: Vec<String> = adjacency
        .outgoing_of(node_id)
        .iter()
        .map(|&i| instance.graph.edges[i].to.clone())
        .collect();
    for successor in successors {
        let only_skipped_preds = adjacency.incoming_of(&successor).iter().all(|&i| {
            instance.status_of(&instance.graph.edges[i].from) == NodeStatus::Skipped
        });
        if only_skipped_preds {
            mark_skipped_cascade(instance, adjacency, &successor, skipped);
        }
    }
}
