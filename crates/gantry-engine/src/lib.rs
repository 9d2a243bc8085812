pub mod analysis;
pub mod condition;
pub mod gate;
pub mod model;
pub mod plan;
pub mod progress;
pub mod registry;
pub mod scheduler;

pub use analysis::{analyze, GraphAnalysis};
pub use gate::{GateEvaluator, GateOutcome};
pub use plan::plan_batches;
pub use progress::{Blocker, ProgressTracker};
pub use registry::{GraphRegistry, ReadyNode};
pub use scheduler::{CompleteOutcome, FailOutcome, Scheduler};
