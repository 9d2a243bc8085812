use crate::error::Result;
use crate::types::{GraphInstance, ProgressSnapshot};

/// Durable storage for workflow instances and their progress snapshots.
///
/// A transition is committed only after `save` returns, so the stored
/// record and the in-memory state survive a crash consistently. Backends
/// must write each record atomically.
pub trait SnapshotStore: Send + Sync {
    /// Persist an instance and its snapshot under the instance id,
    /// replacing any previous record.
    fn save(&self, instance: &GraphInstance, snapshot: &ProgressSnapshot) -> Result<()>;

    /// Load every stored instance, e.g. on registry open after a restart.
    fn load_all(&self) -> Result<Vec<(GraphInstance, ProgressSnapshot)>>;

    /// Remove a stored instance. Missing ids are not an error.
    fn delete(&self, workflow_id: &str) -> Result<()>;
}
