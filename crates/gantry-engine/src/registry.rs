//! CRUD and composition root: ties workflow instances to ids, wires the
//! scheduler's events into per-instance progress trackers, and persists
//! every committed transition.
//!
//! Transitions on one instance are serialized behind that instance's
//! lock; distinct instances operate concurrently. A transition commits
//! only after the store write succeeds, so in-memory state never runs
//! ahead of what a crash would recover.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use gantry_core::config::EngineConfig;
use gantry_core::error::{GantryError, Result};
use gantry_core::types::{
    Evidence, GraphDefinition, GraphInstance, InstanceStatus, NodeKind, Phase, ProgressSnapshot,
    WorkflowId, WorkflowSummary,
};
use gantry_core::traits::SnapshotStore;

use crate::analysis::{self, GraphAnalysis};
use crate::gate::GateEvaluator;
use crate::model;
use crate::plan;
use crate::progress::{Blocker, ProgressTracker};
use crate::scheduler::{CompleteOutcome, FailOutcome, Scheduler};

/// A ready node as reported to the driver, including the payload so tool
/// hints travel with it.
#[derive(Debug, Clone, Serialize)]
pub struct ReadyNode {
    pub id: String,
    pub label: String,
    pub kind: NodeKind,
    pub phase: Phase,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

struct WorkflowCell {
    instance: GraphInstance,
    tracker: ProgressTracker,
}

pub struct GraphRegistry {
    cells: RwLock<HashMap<String, Arc<Mutex<WorkflowCell>>>>,
    scheduler: Scheduler,
    store: Arc<dyn SnapshotStore>,
    config: EngineConfig,
}

impl GraphRegistry {
    /// Open a registry over a store, reloading every persisted instance.
    pub fn open(store: Arc<dyn SnapshotStore>, config: EngineConfig) -> Result<Self> {
        let scheduler = Scheduler::new(GateEvaluator::new(config.evidence_tools.clone()));
        let mut cells = HashMap::new();
        for (instance, snapshot) in store.load_all()? {
            let tracker = ProgressTracker::resume(snapshot);
            cells.insert(
                instance.id.to_string(),
                Arc::new(Mutex::new(WorkflowCell { instance, tracker })),
            );
        }
        if !cells.is_empty() {
            info!(count = cells.len(), "workflows restored from store");
        }
        Ok(Self {
            cells: RwLock::new(cells),
            scheduler,
            store,
            config,
        })
    }

    /// Validate a definition and create a new instance for it.
    pub fn create(&self, mut definition: GraphDefinition) -> Result<WorkflowId> {
        model::validate(&definition)?;
        if definition.defaults.default_cost.is_none() {
            definition.defaults.default_cost = Some(self.config.default_cost);
        }

        let instance = GraphInstance::new(definition, self.config.max_retries);
        let tracker = ProgressTracker::begin(&instance.id, &instance.graph);
        self.store.save(&instance, tracker.snapshot())?;

        let id = instance.id.clone();
        info!(workflow_id = %id, nodes = instance.graph.nodes.len(), "workflow created");
        self.cells
            .write()
            .map_err(|_| poisoned())?
            .insert(id.to_string(), Arc::new(Mutex::new(WorkflowCell { instance, tracker })));
        Ok(id)
    }

    pub fn get(&self, workflow_id: &str) -> Result<GraphInstance> {
        self.read_cell(workflow_id, |cell| cell.instance.clone())
    }

    pub fn snapshot(&self, workflow_id: &str) -> Result<ProgressSnapshot> {
        self.read_cell(workflow_id, |cell| cell.tracker.snapshot().clone())
    }

    /// Summary rows only; full instance bodies are never cloned here.
    pub fn list(&self) -> Result<Vec<WorkflowSummary>> {
        let cells = self.cells.read().map_err(|_| poisoned())?;
        let mut summaries = Vec::with_capacity(cells.len());
        for cell in cells.values() {
            let guard = cell.lock().map_err(|_| poisoned())?;
            summaries.push(WorkflowSummary {
                id: guard.instance.id.to_string(),
                status: guard.instance.status,
                progress: guard.instance.progress(),
                node_count: guard.instance.graph.nodes.len(),
                updated_at: guard.instance.updated_at,
            });
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    pub fn delete(&self, workflow_id: &str) -> Result<()> {
        let removed = self
            .cells
            .write()
            .map_err(|_| poisoned())?
            .remove(workflow_id);
        if removed.is_none() {
            return Err(GantryError::WorkflowNotFound(workflow_id.to_string()));
        }
        self.store.delete(workflow_id)?;
        info!(workflow_id = %workflow_id, "workflow deleted");
        Ok(())
    }

    pub fn pause(&self, workflow_id: &str) -> Result<()> {
        self.with_cell(workflow_id, |instance, _, _| {
            match instance.status {
                InstanceStatus::Pending | InstanceStatus::Running => {
                    instance.status = InstanceStatus::Paused;
                    Ok(())
                }
                status => Err(GantryError::Transition {
                    node: workflow_id.to_string(),
                    reason: format!("cannot pause a {} workflow", status),
                }),
            }
        })
    }

    pub fn resume(&self, workflow_id: &str) -> Result<()> {
        self.with_cell(workflow_id, |instance, _, _| {
            if instance.status != InstanceStatus::Paused {
                return Err(GantryError::Transition {
                    node: workflow_id.to_string(),
                    reason: format!("cannot resume a {} workflow", instance.status),
                });
            }
            instance.status = if instance.node_states.is_empty() {
                InstanceStatus::Pending
            } else {
                InstanceStatus::Running
            };
            Ok(())
        })
    }

    /// Ready frontier with tool hints for the driver.
    pub fn ready_nodes(&self, workflow_id: &str) -> Result<Vec<ReadyNode>> {
        self.with_cell(workflow_id, |instance, _, scheduler| {
            let ids = scheduler.ready_nodes(instance);
            Ok(ids
                .iter()
                .filter_map(|id| instance.graph.node(id))
                .map(|node| ReadyNode {
                    id: node.id.clone(),
                    label: node.label.clone(),
                    kind: node.kind,
                    phase: node.phase,
                    payload: node.payload.clone(),
                })
                .collect())
        })
    }

    pub fn start_node(&self, workflow_id: &str, node_id: &str) -> Result<()> {
        self.with_cell(workflow_id, |instance, tracker, scheduler| {
            scheduler.start_node(instance, node_id, tracker)
        })
    }

    pub fn complete_node(
        &self,
        workflow_id: &str,
        node_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<CompleteOutcome> {
        self.with_cell(workflow_id, |instance, tracker, scheduler| {
            scheduler.complete_node(instance, node_id, result, tracker)
        })
    }

    pub fn fail_node(&self, workflow_id: &str, node_id: &str, error: &str) -> Result<FailOutcome> {
        self.with_cell(workflow_id, |instance, tracker, scheduler| {
            scheduler.fail_node(instance, node_id, error, tracker)
        })
    }

    pub fn skip_node(&self, workflow_id: &str, node_id: &str) -> Result<Vec<String>> {
        self.with_cell(workflow_id, |instance, tracker, scheduler| {
            scheduler.skip_node(instance, node_id, tracker)
        })
    }

    pub fn bypass_gate(
        &self,
        workflow_id: &str,
        node_id: &str,
        reason: &str,
    ) -> Result<Vec<String>> {
        self.with_cell(workflow_id, |instance, tracker, scheduler| {
            scheduler.bypass_gate(instance, node_id, reason, tracker)
        })
    }

    /// Record an externally produced success record for a node.
    pub fn attach_evidence(
        &self,
        workflow_id: &str,
        node_id: &str,
        kind: &str,
        value: serde_json::Value,
        source: Option<String>,
    ) -> Result<()> {
        self.with_cell(workflow_id, |instance, _, _| {
            instance
                .graph
                .node(node_id)
                .ok_or_else(|| GantryError::NodeNotFound(node_id.to_string()))?;
            let mut evidence = Evidence::new(kind, value);
            evidence.source = source;
            instance.evidence.attach(node_id, evidence);
            instance.updated_at = Utc::now();
            info!(workflow_id = %workflow_id, node_id = %node_id, kind = %kind, "evidence attached");
            Ok(())
        })
    }

    pub fn analyze(&self, workflow_id: &str) -> Result<GraphAnalysis> {
        self.read_cell(workflow_id, |cell| analysis::analyze(&cell.instance))
    }

    /// Advisory batched execution plan; never mutates the instance.
    pub fn plan(&self, workflow_id: &str, max_parallel: usize) -> Result<Vec<Vec<String>>> {
        self.read_cell(workflow_id, |cell| {
            plan::plan_batches(&cell.instance, max_parallel)
        })
    }

    /// Currently blocked nodes by recency, with diagnostics refreshed
    /// against the live evidence set.
    pub fn blockers(&self, workflow_id: &str) -> Result<Vec<Blocker>> {
        self.read_cell(workflow_id, |cell| {
            let gate = self.scheduler.gate();
            cell.tracker
                .blockers()
                .into_iter()
                .map(|mut blocker| {
                    if let Some(node) = cell.instance.graph.node(&blocker.node_id) {
                        let outcome = gate.evaluate(
                            node,
                            &cell.instance.graph.defaults,
                            &cell.instance.evidence,
                        );
                        blocker.reason = outcome.reason();
                        blocker.missing_evidence = outcome.missing_evidence;
                        blocker.next_tool_calls = outcome.next_tool_calls;
                    }
                    blocker
                })
                .collect()
        })
    }

    fn cell(&self, workflow_id: &str) -> Result<Arc<Mutex<WorkflowCell>>> {
        self.cells
            .read()
            .map_err(|_| poisoned())?
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| GantryError::WorkflowNotFound(workflow_id.to_string()))
    }

    fn read_cell<T>(&self, workflow_id: &str, f: impl FnOnce(&WorkflowCell) -> T) -> Result<T> {
        let cell = self.cell(workflow_id)?;
        let guard = cell.lock().map_err(|_| poisoned())?;
        Ok(f(&guard))
    }

    /// Run a mutation against a copy of the cell and commit it only
    /// after the store write succeeds.
    fn with_cell<T>(
        &self,
        workflow_id: &str,
        f: impl FnOnce(&mut GraphInstance, &mut ProgressTracker, &Scheduler) -> Result<T>,
    ) -> Result<T> {
        let cell = self.cell(workflow_id)?;
        let mut guard = cell.lock().map_err(|_| poisoned())?;

        let mut instance = guard.instance.clone();
        let mut tracker = guard.tracker.clone();
        let out = f(&mut instance, &mut tracker, &self.scheduler)?;

        self.store.save(&instance, tracker.snapshot())?;
        guard.instance = instance;
        guard.tracker = tracker;
        Ok(out)
    }
}

fn poisoned() -> GantryError {
    GantryError::Internal("workflow lock poisoned".to_string())
}
