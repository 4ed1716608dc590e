//! Single-feature execution: the pass loop, prompt builders, and the
//! collaborator bundle the engine runs against.

pub mod engine;
pub mod prompts;

pub use engine::{Collaborators, ExecutionOutcome, ExecutionRequest, FeatureExecutor};
