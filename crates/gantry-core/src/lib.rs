pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{GantryError, Result};
pub use event::{EventSink, NullSink, WorkflowEvent};
pub use types::*;
