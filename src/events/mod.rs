//! Typed event surface for the orchestration core.

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusExt, EventFilter, FilteredReceiver, SharedEventBus};
pub use types::OrchestratorEvent;
