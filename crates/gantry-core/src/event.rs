use serde::{Deserialize, Serialize};

use crate::types::WorkflowId;

/// Lifecycle event emitted by the scheduler.
///
/// Events are delivered synchronously and in emission order to a single
/// sink, so an observer (the progress tracker) is never out of order or
/// stale relative to engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    NodeStarted {
        node_id: String,
    },
    NodeCompleted {
        node_id: String,
        /// Nodes whose prerequisites this completion satisfied.
        unlocked: Vec<String>,
    },
    NodeFailed {
        node_id: String,
        error: String,
        retry_count: u32,
        will_retry: bool,
    },
    NodeSkipped {
        node_id: String,
    },
    /// First gate miss: the completion attempt left the node blocked.
    NodeBlocked {
        node_id: String,
        missing_evidence: Vec<String>,
        next_tool_calls: Vec<String>,
    },
    /// A blocked node passed its gate on re-attempt.
    GatePassed {
        node_id: String,
    },
    /// A re-attempt on a blocked node is still unsatisfied; diagnostics
    /// refreshed.
    GateBlocked {
        node_id: String,
        missing_evidence: Vec<String>,
        next_tool_calls: Vec<String>,
    },
    /// Administrative bypass forced a blocked node to done. Audit trail,
    /// not evidence.
    GateBypassed {
        node_id: String,
        reason: String,
    },
    WorkflowCompleted {
        workflow_id: WorkflowId,
    },
    WorkflowFailed {
        workflow_id: WorkflowId,
    },
}

impl WorkflowEvent {
    /// The node this event concerns, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::NodeStarted { node_id }
            | WorkflowEvent::NodeCompleted { node_id, .. }
            | WorkflowEvent::NodeFailed { node_id, .. }
            | WorkflowEvent::NodeSkipped { node_id }
            | WorkflowEvent::NodeBlocked { node_id, .. }
            | WorkflowEvent::GatePassed { node_id }
            | WorkflowEvent::GateBlocked { node_id, .. }
            | WorkflowEvent::GateBypassed { node_id, .. } => Some(node_id),
            WorkflowEvent::WorkflowCompleted { .. } | WorkflowEvent::WorkflowFailed { .. } => None,
        }
    }
}

/// Ordered, synchronous consumer of scheduler events.
pub trait EventSink {
    fn on_event(&mut self, event: &WorkflowEvent);
}

/// Collects events; handy in tests.
impl EventSink for Vec<WorkflowEvent> {
    fn on_event(&mut self, event: &WorkflowEvent) {
        self.push(event.clone());
    }
}

/// Discards events.
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&mut self, _event: &WorkflowEvent) {}
}
