//! Flow execution runtime
//!
//! Builds the execution graph for a flow, validates it, and walks it one
//! block at a time under the process-wide [`SystemStateManager`].

mod config;
mod graph;
mod interpreter;
mod runtime;
mod state;
mod validation;

pub use config::RuntimeConfig;
pub use graph::ExecutionGraph;
pub use interpreter::{FlowInterpreter, RunEnd};
pub use runtime::{FlowRuntime, RunControl, RunOutcome};
pub use state::{
    HandlerId, LockKind, MonitoringQueueState, PendingFlow, ResourceLock, StateContext,
    StateStatus, StateTransition, SystemStateManager,
};
pub use validation::{validate, validate_graph, ValidationReport};
