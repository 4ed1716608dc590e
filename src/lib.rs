//! Autodev Orchestration Core
//!
//! This library provides:
//! - Lease-tracked execution so each feature runs at most once at a time
//! - A pass-driven state machine that takes a feature from backlog to done
//! - Autonomous per-worktree scheduling loops with failure-aware pausing
//! - Crash recovery from persisted execution snapshots and saved agent output
//! - A typed event bus surfacing lifecycle events to embedding applications
//!
//! # Components
//!
//! ## Leases
//! - [`LeaseTracker`]: ref-counted acquire/release registry keyed by feature id
//! - [`RunningFeature`]: live metadata snapshot for one leased execution
//!
//! ## Execution
//! - [`FeatureExecutor`]: runs one feature end to end, including the
//!   approved-plan continuation pass and the pipeline handoff
//! - [`Collaborators`]: the trait objects an embedding application supplies
//!   ([`FeatureStore`], [`AgentRunner`], [`WorktreeResolver`], [`PipelineDriver`])
//!
//! ## Scheduling
//! - [`AutoLoopManager`]: one polling loop per project worktree, launching
//!   pending features up to a worktree-scoped concurrency cap
//! - [`LoopRegistry`]: shared registry of live and paused loops with
//!   consecutive-failure tracking
//!
//! ## Recovery
//! - [`RecoveryManager`]: resumes interrupted features after a restart
//! - [`ExecutionStateStore`] / [`ContextStore`]: persisted snapshots and
//!   saved agent transcripts under the project data directory
//!
//! ## Events
//! - [`EventBus`]: broadcast channel of [`OrchestratorEvent`] values with
//!   optional per-project and per-feature filtering
//!
//! [`Orchestrator::new`] wires all of the above together from an
//! [`OrchestratorConfig`] and a [`Collaborators`] bundle.

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod feature;
pub mod leases;
pub mod orchestrator;
pub mod pipeline;
pub mod recovery;
pub mod scheduler;
pub mod workspace;

// Re-export the wiring entry points
pub use config::OrchestratorConfig;
pub use orchestrator::Orchestrator;

// Re-export key lease types
pub use leases::{
    AcquireRequest, LeaseTracker, RunningFeature, RunningFeatureUpdate, SharedLeaseTracker,
};

// Re-export key execution types
pub use error::{AutodevError, AutodevResult, FailureInfo, FailureKind};
pub use executor::{Collaborators, ExecutionOutcome, ExecutionRequest, FeatureExecutor};
pub use feature::{Feature, FeatureStatus, FeatureStore, PlanSpec, PlanStatus};

// Re-export collaborator seam types
pub use agent::{AgentInvocation, AgentRunner};
pub use pipeline::{PipelineContext, PipelineDriver, PipelineStatus, PipelineStep};
pub use workspace::{GitWorktrees, WorktreeResolver};

// Re-export key scheduling types
pub use scheduler::{AutoLoopManager, FailureTracker, LoopKey, LoopRegistry, LoopStatus};

// Re-export key recovery types
pub use recovery::{
    ContextStore, ExecutionState, ExecutionStateStore, RecoveryManager, RecoveryReport,
    ResumeAction,
};

// Re-export key event types
pub use events::{
    EventBus, EventBusExt, EventFilter, FilteredReceiver, OrchestratorEvent, SharedEventBus,
};
