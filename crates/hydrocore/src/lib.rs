//! Core abstractions for the hydro flow engine
//!
//! Flow definitions, block kinds and their parameters, the per-run
//! execution context, errors, events and the collaborator traits the
//! runtime talks to devices and persistence through.

mod block;
mod cancel;
mod collaborators;
mod context;
mod error;
pub mod events;
mod flow;
mod logic;
pub mod params;
mod state;
mod value;

pub use block::{ports, BlockKind, BlockNode, ExecutionResult};
pub use cancel::CancellationToken;
pub use collaborators::{
    BlockRecord, CommandKind, CommandReply, CustomNotification, DeviceCommand, DeviceGateway,
    DeviceInfo, ErrorNotification, MonitoringSample, MonitoringSink, Notifier, NullSink,
    ProgramStatus, RunRecorder, RunSummary, Services, SinkError,
};
pub use context::{
    ContextStatus, ExecutionContext, ExecutionLog, ExecutionSnapshot, RunFlags, VariableHint,
    VariableMetadata, DEFAULT_MAX_LOGS, DEFAULT_MAX_VARIABLES,
};
pub use error::{
    BlockError, ConditionError, ContextError, DeviceError, ErrorKind, ExecutionError, FlowError,
    GraphError, Severity,
};
pub use events::{EventBus, EventSink, ExecutionEvent, LogLevel, RunId};
pub use flow::{BlockDefinition, BlockId, Connection, FlowDefinition, Parameters, PortSlots};
pub use logic::{BlockState, ConditionConfig, LoopKind, LoopState, Operator};
pub use params::{ActionType, ActuatorParams};
pub use state::SystemState;
pub use value::{DataType, Value};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
