//! Passive observer over scheduler events.
//!
//! The tracker mirrors transitions into a metadata-only snapshot that is
//! persisted on every transition, which is what lets a long-running task
//! resume after an interruption without replaying the whole graph.

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;

use gantry_core::event::{EventSink, WorkflowEvent};
use gantry_core::types::{
    BlockedRecord, GraphDefinition, NodeProgress, NodeStatus, ProgressSnapshot, StatusCounts,
    WorkflowId,
};

/// A currently blocked node. Priority 1 is the most recently blocked —
/// the primary suggested next action.
#[derive(Debug, Clone, Serialize)]
pub struct Blocker {
    pub priority: usize,
    pub node_id: String,
    pub reason: String,
    pub missing_evidence: Vec<String>,
    pub next_tool_calls: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    snapshot: ProgressSnapshot,
    blocked: HashMap<String, BlockedRecord>,
    /// Block recency, oldest first.
    blocked_order: Vec<String>,
}

impl ProgressTracker {
    /// Start tracking a new workflow; every node begins pending.
    pub fn begin(workflow_id: &WorkflowId, graph: &GraphDefinition) -> Self {
        let mut tracker = Self::default();
        tracker.snapshot.workflow_id = workflow_id.to_string();
        tracker.snapshot.graph_version = graph.version.clone();
        for node in &graph.nodes {
            tracker.snapshot.node_states.insert(
                node.id.clone(),
                NodeProgress {
                    status: NodeStatus::Pending,
                    retry_count: 0,
                    gate_bypassed: false,
                },
            );
        }
        tracker.recount();
        tracker
    }

    /// Rebuild a tracker from a persisted snapshot after a restart.
    /// Block recency beyond the latest record is not persisted; older
    /// blocked nodes resume in id order behind it.
    pub fn resume(snapshot: ProgressSnapshot) -> Self {
        let mut blocked_order: Vec<String> = snapshot
            .node_states
            .iter()
            .filter(|(_, p)| p.status == NodeStatus::Blocked)
            .map(|(id, _)| id.clone())
            .collect();
        blocked_order.sort();

        let mut blocked = HashMap::new();
        for id in &blocked_order {
            blocked.insert(
                id.clone(),
                BlockedRecord {
                    node_id: id.clone(),
                    reason: "gate unsatisfied".to_string(),
                    missing_evidence: vec![],
                    next_tool_calls: vec![],
                    blocked_at: snapshot.updated_at.unwrap_or_else(Utc::now),
                },
            );
        }
        if let Some(record) = &snapshot.last_blocked {
            blocked_order.retain(|id| id != &record.node_id);
            blocked_order.push(record.node_id.clone());
            blocked.insert(record.node_id.clone(), record.clone());
        }

        Self {
            snapshot,
            blocked,
            blocked_order,
        }
    }

    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }

    /// Reset tracking when a new graph starts.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Currently blocked nodes ordered by recency.
    pub fn blockers(&self) -> Vec<Blocker> {
        self.blocked_order
            .iter()
            .rev()
            .enumerate()
            .filter_map(|(i, id)| {
                self.blocked.get(id).map(|record| Blocker {
                    priority: i + 1,
                    node_id: record.node_id.clone(),
                    reason: record.reason.clone(),
                    missing_evidence: record.missing_evidence.clone(),
                    next_tool_calls: record.next_tool_calls.clone(),
                })
            })
            .collect()
    }

    fn update<F: FnOnce(&mut NodeProgress)>(&mut self, node_id: &str, f: F) {
        let entry = self
            .snapshot
            .node_states
            .entry(node_id.to_string())
            .or_insert(NodeProgress {
                status: NodeStatus::Pending,
                retry_count: 0,
                gate_bypassed: false,
            });
        f(entry);
        self.recount();
    }

    fn record_block(&mut self, node_id: &str, missing: &[String], tools: &[String]) {
        let record = BlockedRecord {
            node_id: node_id.to_string(),
            reason: format!("missing evidence: {}", missing.join(", ")),
            missing_evidence: missing.to_vec(),
            next_tool_calls: tools.to_vec(),
            blocked_at: Utc::now(),
        };
        self.blocked_order.retain(|id| id != node_id);
        self.blocked_order.push(node_id.to_string());
        self.blocked.insert(node_id.to_string(), record.clone());
        self.snapshot.last_blocked = Some(record);
    }

    fn clear_block(&mut self, node_id: &str) {
        self.blocked.remove(node_id);
        self.blocked_order.retain(|id| id != node_id);
        if self
            .snapshot
            .last_blocked
            .as_ref()
            .is_some_and(|r| r.node_id == node_id)
        {
            // fall back to the most recent remaining block, if any
            self.snapshot.last_blocked = self
                .blocked_order
                .last()
                .and_then(|id| self.blocked.get(id).cloned());
        }
    }

    fn recount(&mut self) {
        let mut counts = StatusCounts::default();
        for progress in self.snapshot.node_states.values() {
            counts.record(progress.status);
        }
        self.snapshot.summary = counts;
    }
}

impl EventSink for ProgressTracker {
    fn on_event(&mut self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::NodeStarted { node_id } => {
                self.update(node_id, |p| p.status = NodeStatus::Running);
            }
            WorkflowEvent::NodeCompleted { node_id, .. } => {
                self.update(node_id, |p| p.status = NodeStatus::Done);
                self.clear_block(node_id);
            }
            WorkflowEvent::NodeFailed {
                node_id,
                retry_count,
                will_retry,
                ..
            } => {
                let (count, status) = (*retry_count, *will_retry);
                self.update(node_id, |p| {
                    p.retry_count = count;
                    p.status = if status {
                        NodeStatus::Pending
                    } else {
                        NodeStatus::Failed
                    };
                });
            }
            WorkflowEvent::NodeSkipped { node_id } => {
                self.update(node_id, |p| p.status = NodeStatus::Skipped);
            }
            WorkflowEvent::NodeBlocked {
                node_id,
                missing_evidence,
                next_tool_calls,
            }
            | WorkflowEvent::GateBlocked {
                node_id,
                missing_evidence,
                next_tool_calls,
            } => {
                self.update(node_id, |p| p.status = NodeStatus::Blocked);
                self.record_block(node_id, missing_evidence, next_tool_calls);
            }
            WorkflowEvent::GatePassed { .. } => {
                // the matching NodeCompleted carries the status change
            }
            WorkflowEvent::GateBypassed { node_id, .. } => {
                self.update(node_id, |p| p.gate_bypassed = true);
            }
            WorkflowEvent::WorkflowCompleted { .. } | WorkflowEvent::WorkflowFailed { .. } => {}
        }
        self.snapshot.updated_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::types::{Edge, GraphDefaults, Node, Phase};

    fn graph() -> GraphDefinition {
        GraphDefinition {
            version: "1".into(),
            entry: "a".into(),
            nodes: vec![
                Node::task("a", "A", Phase::Analysis),
                Node::task("b", "B", Phase::Test),
            ],
            edges: vec![Edge::always("a", "b")],
            defaults: GraphDefaults::default(),
        }
    }

    fn tracker() -> ProgressTracker {
        ProgressTracker::begin(&WorkflowId::from_string("wf-1"), &graph())
    }

    #[test]
    fn begin_seeds_all_pending() {
        let t = tracker();
        assert_eq!(t.snapshot().summary.pending, 2);
        assert_eq!(t.snapshot().workflow_id, "wf-1");
    }

    #[test]
    fn mirrors_transitions() {
        let mut t = tracker();
        t.on_event(&WorkflowEvent::NodeStarted { node_id: "a".into() });
        assert_eq!(t.snapshot().summary.running, 1);

        t.on_event(&WorkflowEvent::NodeCompleted {
            node_id: "a".into(),
            unlocked: vec!["b".into()],
        });
        assert_eq!(t.snapshot().summary.done, 1);
        assert_eq!(t.snapshot().summary.pending, 1);
        assert!(t.snapshot().updated_at.is_some());
    }

    #[test]
    fn retry_keeps_node_pending() {
        let mut t = tracker();
        t.on_event(&WorkflowEvent::NodeStarted { node_id: "a".into() });
        t.on_event(&WorkflowEvent::NodeFailed {
            node_id: "a".into(),
            error: "boom".into(),
            retry_count: 1,
            will_retry: true,
        });
        let progress = &t.snapshot().node_states["a"];
        assert_eq!(progress.status, NodeStatus::Pending);
        assert_eq!(progress.retry_count, 1);
    }

    #[test]
    fn block_and_unblock_maintain_last_blocked() {
        let mut t = tracker();
        t.on_event(&WorkflowEvent::NodeBlocked {
            node_id: "b".into(),
            missing_evidence: vec!["test".into()],
            next_tool_calls: vec!["testing_run".into()],
        });

        let last = t.snapshot().last_blocked.as_ref().unwrap();
        assert_eq!(last.node_id, "b");
        assert_eq!(last.next_tool_calls, vec!["testing_run"]);

        t.on_event(&WorkflowEvent::NodeCompleted {
            node_id: "b".into(),
            unlocked: vec![],
        });
        assert!(t.snapshot().last_blocked.is_none());
        assert!(t.blockers().is_empty());
    }

    #[test]
    fn blockers_order_by_recency() {
        let mut t = tracker();
        t.on_event(&WorkflowEvent::NodeBlocked {
            node_id: "a".into(),
            missing_evidence: vec!["guard".into()],
            next_tool_calls: vec!["guard_validate".into()],
        });
        t.on_event(&WorkflowEvent::NodeBlocked {
            node_id: "b".into(),
            missing_evidence: vec!["test".into()],
            next_tool_calls: vec!["testing_run".into()],
        });

        let blockers = t.blockers();
        assert_eq!(blockers.len(), 2);
        assert_eq!(blockers[0].priority, 1);
        assert_eq!(blockers[0].node_id, "b");
        assert_eq!(blockers[1].node_id, "a");
    }

    #[test]
    fn bypass_is_flagged() {
        let mut t = tracker();
        t.on_event(&WorkflowEvent::GateBypassed {
            node_id: "b".into(),
            reason: "manual".into(),
        });
        assert!(t.snapshot().node_states["b"].gate_bypassed);
    }

    #[test]
    fn clear_resets() {
        let mut t = tracker();
        t.on_event(&WorkflowEvent::NodeStarted { node_id: "a".into() });
        t.clear();
        assert!(t.snapshot().node_states.is_empty());
        assert_eq!(t.snapshot().summary.total(), 0);
    }

    #[test]
    fn resume_restores_blocked_state() {
        let mut t = tracker();
        t.on_event(&WorkflowEvent::NodeBlocked {
            node_id: "b".into(),
            missing_evidence: vec!["test".into()],
            next_tool_calls: vec!["testing_run".into()],
        });

        let resumed = ProgressTracker::resume(t.snapshot().clone());
        let blockers = resumed.blockers();
        assert_eq!(blockers.len(), 1);
        assert_eq!(blockers[0].node_id, "b");
        assert_eq!(blockers[0].next_tool_calls, vec!["testing_run"]);
    }
}
