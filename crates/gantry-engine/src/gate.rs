//! Admission control for node completion.
//!
//! The gate decouples the scheduler from how evidence is produced: any
//! external subsystem may report a `(node, kind)` success record, and the
//! gate only checks presence of the required kinds. An unsatisfied gate
//! is not an error — the node becomes blocked with actionable
//! diagnostics.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use gantry_core::types::{EvidenceSet, GraphDefaults, Node};

use crate::model;

/// Decision produced by a gate check on a completion attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOutcome {
    pub satisfied: bool,
    /// Evidence kinds still absent, in required-kind order.
    pub missing_evidence: Vec<String>,
    /// Ordered tool suggestions the driver should invoke next, one per
    /// missing kind.
    pub next_tool_calls: Vec<String>,
}

impl GateOutcome {
    pub fn reason(&self) -> String {
        if self.satisfied {
            "gate satisfied; re-attempt completion".to_string()
        } else {
            format!("missing evidence: {}", self.missing_evidence.join(", "))
        }
    }
}

/// Evaluates whether a node may transition to done given the evidence
/// attached so far.
#[derive(Debug, Clone)]
pub struct GateEvaluator {
    evidence_tools: HashMap<String, String>,
}

impl Default for GateEvaluator {
    fn default() -> Self {
        Self::new(HashMap::from([
            ("guard".to_string(), "guard_validate".to_string()),
            ("test".to_string(), "testing_run".to_string()),
        ]))
    }
}

impl GateEvaluator {
    pub fn new(evidence_tools: HashMap<String, String>) -> Self {
        Self { evidence_tools }
    }

    /// Check a node against the instance's evidence set. Pure; never
    /// mutates evidence.
    pub fn evaluate(
        &self,
        node: &Node,
        defaults: &GraphDefaults,
        evidence: &EvidenceSet,
    ) -> GateOutcome {
        let required = model::effective_evidence_kinds(node, defaults);
        let missing_evidence: Vec<String> = required
            .iter()
            .filter(|kind| !evidence.has(&node.id, kind))
            .cloned()
            .collect();
        let next_tool_calls = missing_evidence
            .iter()
            .map(|kind| self.tool_for(kind))
            .collect();

        GateOutcome {
            satisfied: missing_evidence.is_empty(),
            missing_evidence,
            next_tool_calls,
        }
    }

    /// Tool that produces an evidence kind. Unmapped kinds fall back to
    /// `<kind>_run`.
    pub fn tool_for(&self, kind: &str) -> String {
        self.evidence_tools
            .get(kind)
            .cloned()
            .unwrap_or_else(|| format!("{}_run", kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::types::{Evidence, Phase};
    use serde_json::json;

    #[test]
    fn missing_evidence_blocks_with_tool_suggestions() {
        let gate = GateEvaluator::default();
        let node = Node::task("f", "Final checks", Phase::Test)
            .gated(vec!["test".into(), "guard".into()]);
        let evidence = EvidenceSet::default();

        let outcome = gate.evaluate(&node, &GraphDefaults::default(), &evidence);
        assert!(!outcome.satisfied);
        assert_eq!(outcome.missing_evidence, vec!["test", "guard"]);
        assert_eq!(outcome.next_tool_calls, vec!["testing_run", "guard_validate"]);
    }

    #[test]
    fn partial_evidence_refreshes_diagnostics() {
        let gate = GateEvaluator::default();
        let node = Node::task("f", "Final checks", Phase::Test)
            .gated(vec!["test".into(), "guard".into()]);
        let mut evidence = EvidenceSet::default();
        evidence.attach("f", Evidence::new("test", json!({"passed": true})));

        let outcome = gate.evaluate(&node, &GraphDefaults::default(), &evidence);
        assert!(!outcome.satisfied);
        assert_eq!(outcome.missing_evidence, vec!["guard"]);
        assert_eq!(outcome.next_tool_calls, vec!["guard_validate"]);
    }

    #[test]
    fn full_evidence_satisfies() {
        let gate = GateEvaluator::default();
        let node = Node::task("f", "Final checks", Phase::Test).gated(vec!["test".into()]);
        let mut evidence = EvidenceSet::default();
        evidence.attach("f", Evidence::new("test", json!(true)));

        let outcome = gate.evaluate(&node, &GraphDefaults::default(), &evidence);
        assert!(outcome.satisfied);
        assert!(outcome.missing_evidence.is_empty());
        assert!(outcome.next_tool_calls.is_empty());
        assert_eq!(outcome.reason(), "gate satisfied; re-attempt completion");
    }

    #[test]
    fn evidence_is_per_node() {
        let gate = GateEvaluator::default();
        let node = Node::task("f", "F", Phase::Test).gated(vec!["test".into()]);
        let mut evidence = EvidenceSet::default();
        evidence.attach("other", Evidence::new("test", json!(true)));

        let outcome = gate.evaluate(&node, &GraphDefaults::default(), &evidence);
        assert!(!outcome.satisfied);
    }

    #[test]
    fn unmapped_kind_falls_back() {
        let gate = GateEvaluator::default();
        assert_eq!(gate.tool_for("bench"), "bench_run");
    }

    #[test]
    fn phase_default_kinds_apply() {
        let gate = GateEvaluator::default();
        let mut defaults = GraphDefaults::default();
        defaults.gate_by_phase.insert(Phase::Review, true);
        defaults
            .evidence_by_phase
            .insert(Phase::Review, vec!["guard".into()]);

        let node = Node::task("r", "Review", Phase::Review);
        let outcome = gate.evaluate(&node, &defaults, &EvidenceSet::default());
        assert_eq!(outcome.missing_evidence, vec!["guard"]);
    }
}
