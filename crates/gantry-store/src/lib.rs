//! SQLite persistence for workflow instances.
//!
//! One row per workflow, written atomically on every committed
//! transition. The instance body and its progress snapshot are stored as
//! JSON columns; recovery is a single table scan at startup.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use gantry_core::error::{GantryError, Result};
use gantry_core::traits::SnapshotStore;
use gantry_core::types::{GraphInstance, ProgressSnapshot};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS workflows (
    id            TEXT PRIMARY KEY,
    status        TEXT NOT NULL,
    instance_json TEXT NOT NULL,
    snapshot_json TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);";

pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    /// Open or create the database at `path`, creating parent
    /// directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        info!(path = %path.display(), "snapshot store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, for tests and throwaway runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn save(&self, instance: &GraphInstance, snapshot: &ProgressSnapshot) -> Result<()> {
        let instance_json = serde_json::to_string(instance)?;
        let snapshot_json = serde_json::to_string(snapshot)?;
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        conn.execute(
            "INSERT OR REPLACE INTO workflows (id, status, instance_json, snapshot_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                instance.id.to_string(),
                instance.status.to_string(),
                instance_json,
                snapshot_json,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        debug!(workflow_id = %instance.id, status = %instance.status, "workflow saved");
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<(GraphInstance, ProgressSnapshot)>> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        let mut stmt = conn
            .prepare("SELECT instance_json, snapshot_json FROM workflows ORDER BY updated_at")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (instance_json, snapshot_json) = row.map_err(db_err)?;
            let instance: GraphInstance = serde_json::from_str(&instance_json)?;
            let snapshot: ProgressSnapshot = serde_json::from_str(&snapshot_json)?;
            out.push((instance, snapshot));
        }
        Ok(out)
    }

    fn delete(&self, workflow_id: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        conn.execute("DELETE FROM workflows WHERE id = ?1", params![workflow_id])
            .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(err: rusqlite::Error) -> GantryError {
    GantryError::Database(err.to_string())
}

fn poisoned() -> GantryError {
    GantryError::Internal("store lock poisoned".to_string())
}
