use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GantryError, Result};

/// Top-level Gantry configuration, loaded from `gantry.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Engine-wide defaults; a graph's own `defaults` block can override
/// `max_retries` and `default_cost` per graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Automatic retries before a node failure becomes terminal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Cost assumed for nodes without a `cost` payload entry.
    #[serde(default = "default_cost")]
    pub default_cost: f64,
    /// Evidence kind → tool the driver should invoke to produce it.
    /// Drives the `next_tool_calls` suggestions on a gate block.
    #[serde(default = "default_evidence_tools")]
    pub evidence_tools: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            default_cost: default_cost(),
            evidence_tools: default_evidence_tools(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_cost() -> f64 {
    1.0
}

fn default_evidence_tools() -> HashMap<String, String> {
    HashMap::from([
        ("guard".to_string(), "guard_validate".to_string()),
        ("test".to_string(), "testing_run".to_string()),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the workflow database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".gantry")
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("workflows.db")
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(GantryError::ConfigNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| GantryError::Config(e.to_string()))
    }

    /// Load configuration, falling back to defaults when the file is
    /// absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(GantryError::ConfigNotFound(_)) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }
}
