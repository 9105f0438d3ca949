use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Flow validation failed: {0}")]
    Validation(String),

    #[error("Cannot start execution: system is {0}")]
    NotIdle(String),

    #[error("Block {block_id} failed: {message}")]
    BlockFailed { block_id: String, message: String },

    #[error("GOTO target block not found: {0}")]
    GotoTargetMissing(String),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Duplicate block id: {0}")]
    DuplicateBlock(String),

    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("Connection {source_block}:{source_port} -> {target_block} references an unknown block")]
    DanglingConnection {
        source_block: String,
        source_port: String,
        target_block: String,
    },

    #[error("No start block found in flow")]
    NoStartBlock,

    #[error("Circular dependency detected in flow")]
    CircularDependency,

    #[error("Block {0} has no incoming connections and is not a start block")]
    UnreachableBlock(String),
}

/// Failure reported by a block handler, classified by the executor
#[derive(Error, Debug, Clone)]
pub enum BlockError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Variable not found: {0}")]
    VariableNotFound(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Condition(#[from] ConditionError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("{0}")]
    Failed(String),
}

/// Device-layer failures surfaced by a [`crate::DeviceGateway`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Device {0} not found")]
    NotFound(String),

    #[error("Device {0} is inactive")]
    Inactive(String),

    #[error("Device {device_id} is not connected (controller {controller_id} offline)")]
    NotConnected {
        device_id: String,
        controller_id: String,
    },

    #[error("Device {device_id} did not answer within {timeout_ms}ms")]
    Timeout { device_id: String, timeout_ms: u64 },

    #[error("Device {device_id} rejected command: {message}")]
    CommandRejected { device_id: String, message: String },

    #[error("No fallback path available for device {0}")]
    NoFallback(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl DeviceError {
    /// Error category and severity a device failure is reported with.
    pub fn classify(&self) -> (ErrorKind, Severity) {
        match self {
            DeviceError::NotFound(_) => (ErrorKind::MissingParameter, Severity::High),
            DeviceError::Inactive(_) => (ErrorKind::DeviceNotResponding, Severity::High),
            DeviceError::NotConnected { .. } => (ErrorKind::DeviceNotResponding, Severity::High),
            DeviceError::Timeout { .. } => (ErrorKind::SensorTimeout, Severity::Medium),
            DeviceError::CommandRejected { .. } => (ErrorKind::HardwareFailure, Severity::High),
            DeviceError::NoFallback(_) => (ErrorKind::DeviceNotResponding, Severity::High),
            DeviceError::Transport(_) => (ErrorKind::DeviceNotResponding, Severity::High),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContextError {
    #[error("Maximum variables limit ({limit}) reached")]
    CapacityExceeded { limit: usize },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("Cannot convert {value:?} to {target}")]
    Coercion { value: String, target: String },

    #[error("Variable {0} is not set")]
    UnknownVariable(String),

    #[error("No condition configured")]
    NoCondition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SensorTimeout,
    DeviceNotResponding,
    HardwareFailure,
    InvalidBlockType,
    MissingParameter,
    ConditionError,
    MemoryLimit,
    ExecutionTimeout,
    FlowValidationError,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SensorTimeout => "sensor_timeout",
            ErrorKind::DeviceNotResponding => "device_not_responding",
            ErrorKind::HardwareFailure => "hardware_failure",
            ErrorKind::InvalidBlockType => "invalid_block_type",
            ErrorKind::MissingParameter => "missing_parameter",
            ErrorKind::ConditionError => "condition_error",
            ErrorKind::MemoryLimit => "memory_limit",
            ErrorKind::ExecutionTimeout => "execution_timeout",
            ErrorKind::FlowValidationError => "flow_validation_error",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and critical failures abort a run unless an error handler intervenes.
    pub fn is_fatal(&self) -> bool {
        *self >= Severity::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Error record attached to a failed block result and kept in the run context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    pub block_id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub recoverable: bool,
}

impl ExecutionError {
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        block_id: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            block_id: block_id.into(),
            timestamp: Utc::now(),
            severity,
            recoverable: !severity.is_fatal(),
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.kind, self.severity, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_map_to_categories() {
        let cases = [
            (DeviceError::NotFound("d".into()), ErrorKind::MissingParameter, Severity::High),
            (DeviceError::Inactive("d".into()), ErrorKind::DeviceNotResponding, Severity::High),
            (
                DeviceError::Timeout { device_id: "d".into(), timeout_ms: 10 },
                ErrorKind::SensorTimeout,
                Severity::Medium,
            ),
            (
                DeviceError::CommandRejected { device_id: "d".into(), message: "x".into() },
                ErrorKind::HardwareFailure,
                Severity::High,
            ),
        ];
        for (err, kind, severity) in cases {
            assert_eq!(err.classify(), (kind, severity), "{err}");
        }
    }

    #[test]
    fn recoverable_follows_severity() {
        let soft = ExecutionError::new(ErrorKind::SensorTimeout, "slow", "b1", Severity::Medium);
        let hard = ExecutionError::new(ErrorKind::HardwareFailure, "dead", "b1", Severity::Critical);
        assert!(soft.recoverable);
        assert!(!hard.recoverable);
        assert!(Severity::High.is_fatal());
        assert!(!Severity::Low.is_fatal());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DeviceNotResponding).unwrap();
        assert_eq!(json, "\"device_not_responding\"");
    }
}
