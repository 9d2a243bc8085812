use thiserror::Error;

#[derive(Debug, Error)]
pub enum GantryError {
    // Graph construction errors, fatal at creation. The graph is never
    // instantiated.
    #[error("Invalid graph: {0}")]
    Validation(String),

    // State machine errors, returned to the caller with no state mutated.
    #[error("Illegal transition for node '{node}': {reason}")]
    Transition { node: String, reason: String },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Workflow '{0}' is paused")]
    Paused(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GantryError>;
