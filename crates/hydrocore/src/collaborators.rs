//! Seams to the outside world: devices, run records, monitoring and notifications.

use crate::events::BlockStatus;
use crate::{ActionType, ActuatorParams, DeviceError, RunId, Value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Device registry entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub device_type: String,
    pub controller_id: String,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default = "DeviceInfo::active_default")]
    pub is_active: bool,
}

impl DeviceInfo {
    fn active_default() -> bool {
        true
    }

    /// Sensor type derived from the device type, e.g. `ph_sensor` -> `ph`.
    pub fn sensor_type(&self) -> &str {
        self.device_type
            .strip_suffix("_sensor")
            .unwrap_or(&self.device_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    ReadSensor,
    ControlActuator,
}

/// Command sent to a controller over its live connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCommand {
    pub kind: CommandKind,
    pub device_id: String,
    pub ports: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionType>,
    #[serde(default)]
    pub duration_secs: f64,
    #[serde(default)]
    pub power_level: f64,
    #[serde(default)]
    pub power_from: f64,
    #[serde(default)]
    pub power_to: f64,
    #[serde(default)]
    pub stop_on_disconnect: bool,
    pub issued_at: DateTime<Utc>,
}

impl DeviceCommand {
    pub fn read(device: &DeviceInfo) -> Self {
        Self {
            kind: CommandKind::ReadSensor,
            device_id: device.id.clone(),
            ports: device.ports.clone(),
            action: None,
            duration_secs: 0.0,
            power_level: 0.0,
            power_from: 0.0,
            power_to: 0.0,
            stop_on_disconnect: false,
            issued_at: Utc::now(),
        }
    }

    pub fn control(device: &DeviceInfo, action: ActionType, duration_secs: f64, params: &ActuatorParams) -> Self {
        Self {
            kind: CommandKind::ControlActuator,
            device_id: device.id.clone(),
            ports: device.ports.clone(),
            action: Some(action),
            duration_secs,
            power_level: params.power_level,
            power_from: params.power_from,
            power_to: params.power_to,
            stop_on_disconnect: params.stop_on_disconnect,
            issued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub ok: bool,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl CommandReply {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn reading(value: Value) -> Self {
        Self {
            ok: true,
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Access to physical devices
#[async_trait]
pub trait DeviceGateway: Send + Sync {
    async fn resolve_device(&self, device_id: &str) -> Result<DeviceInfo, DeviceError>;

    fn has_live_connection(&self, controller_id: &str) -> bool;

    async fn send_command(&self, controller_id: &str, command: DeviceCommand) -> Result<CommandReply, DeviceError>;

    /// Whether the slower fallback path is available when no live connection exists.
    fn has_fallback(&self) -> bool {
        false
    }

    async fn read_sensor(&self, device_id: &str) -> Result<Value, DeviceError> {
        Err(DeviceError::NoFallback(device_id.to_string()))
    }

    async fn control_device(&self, device_id: &str, _action: ActionType, _duration_secs: f64) -> Result<(), DeviceError> {
        Err(DeviceError::NoFallback(device_id.to_string()))
    }
}

/// One persisted block execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRecord {
    pub run_id: RunId,
    pub flow_id: String,
    pub block_id: String,
    pub block_kind: String,
    pub block_name: String,
    pub status: BlockStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: RunId,
    pub flow_id: String,
    pub success: bool,
    pub executed_blocks: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramStatus {
    Loaded,
    Running,
    Paused,
    Stopped,
}

/// Persistence of run history
#[async_trait]
pub trait RunRecorder: Send + Sync {
    async fn record_block(&self, record: BlockRecord) -> Result<(), SinkError>;

    async fn complete_run(&self, summary: RunSummary) -> Result<(), SinkError>;

    /// Mirrors a halt or pause decided by an error handler onto the program record.
    async fn sync_program_status(&self, _program_id: &str, _status: ProgramStatus) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSample {
    pub tag_id: String,
    pub value: Value,
    pub flow_id: String,
    pub block_id: String,
    pub program_id: Option<String>,
    pub cycle_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait MonitoringSink: Send + Sync {
    async fn record_sample(&self, sample: MonitoringSample) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotification {
    pub block_id: String,
    pub block_kind: String,
    pub message: String,
    pub template: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomNotification {
    pub source_block_id: String,
    pub source_block_kind: String,
    pub message: String,
    pub context: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_error(&self, notification: ErrorNotification) -> Result<(), SinkError>;

    async fn send_custom(&self, notification: CustomNotification) -> Result<(), SinkError>;
}

/// Accepts and discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl RunRecorder for NullSink {
    async fn record_block(&self, _record: BlockRecord) -> Result<(), SinkError> {
        Ok(())
    }

    async fn complete_run(&self, _summary: RunSummary) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
impl MonitoringSink for NullSink {
    async fn record_sample(&self, _sample: MonitoringSample) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
impl Notifier for NullSink {
    async fn send_error(&self, _notification: ErrorNotification) -> Result<(), SinkError> {
        Ok(())
    }

    async fn send_custom(&self, _notification: CustomNotification) -> Result<(), SinkError> {
        Ok(())
    }
}

/// The collaborators a runtime is wired with
#[derive(Clone)]
pub struct Services {
    pub gateway: Arc<dyn DeviceGateway>,
    pub recorder: Arc<dyn RunRecorder>,
    pub monitoring: Arc<dyn MonitoringSink>,
    pub notifier: Arc<dyn Notifier>,
}

impl Services {
    pub fn new(gateway: Arc<dyn DeviceGateway>) -> Self {
        Self {
            gateway,
            recorder: Arc::new(NullSink),
            monitoring: Arc::new(NullSink),
            notifier: Arc::new(NullSink),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn RunRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_monitoring(mut self, monitoring: Arc<dyn MonitoringSink>) -> Self {
        self.monitoring = monitoring;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}
