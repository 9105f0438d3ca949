//! In-memory collaborators for tests and the CLI's dry runs.

use async_trait::async_trait;
use hydrocore::{
    ActionType, BlockRecord, CommandKind, CommandReply, CustomNotification, DeviceCommand,
    DeviceError, DeviceGateway, DeviceInfo, ErrorNotification, MonitoringSample, MonitoringSink,
    Notifier, ProgramStatus, RunRecorder, RunSummary, SinkError, Value,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::time::{Duration, Instant};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A command the simulated gateway received
#[derive(Debug, Clone)]
pub struct SentCommand {
    pub controller_id: String,
    pub command: DeviceCommand,
    pub at: Instant,
}

/// A fallback-path control call
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackControl {
    pub device_id: String,
    pub action: ActionType,
    pub duration_secs: f64,
}

#[derive(Default)]
struct GatewayState {
    devices: HashMap<String, DeviceInfo>,
    live: HashSet<String>,
    readings: HashMap<String, Value>,
    scripted: HashMap<String, VecDeque<Value>>,
    failures: HashMap<String, (u32, String)>,
    latency: HashMap<String, Duration>,
    sent: Vec<SentCommand>,
    fallback_calls: Vec<FallbackControl>,
}

/// Scriptable device gateway. Devices, live controllers, readings and
/// injected failures are configured up front; every command is logged
/// with the (virtual) time it arrived.
#[derive(Default)]
pub struct SimulatedGateway {
    state: Mutex<GatewayState>,
    fallback: bool,
    auto_provision: bool,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device whose controller is live.
    pub fn with_device(self, id: &str, device_type: &str) -> Self {
        let controller = format!("ctrl-{}", id);
        self.with_device_info(DeviceInfo {
            id: id.to_string(),
            name: id.to_string(),
            device_type: device_type.to_string(),
            controller_id: controller.clone(),
            ports: vec!["D1".to_string()],
            unit: None,
            is_active: true,
        })
        .with_live_controller(&controller)
    }

    pub fn with_device_info(self, device: DeviceInfo) -> Self {
        lock(&self.state).devices.insert(device.id.clone(), device);
        self
    }

    pub fn with_live_controller(self, controller_id: &str) -> Self {
        lock(&self.state).live.insert(controller_id.to_string());
        self
    }

    /// Drops the live connection of every controller.
    pub fn offline(self) -> Self {
        lock(&self.state).live.clear();
        self
    }

    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback = enabled;
        self
    }

    /// Unknown device ids resolve to a generated device on a live controller.
    pub fn auto_provision(mut self, enabled: bool) -> Self {
        self.auto_provision = enabled;
        self
    }

    /// Value returned by every read of `device_id` once scripted values run out.
    pub fn with_reading(self, device_id: &str, value: impl Into<Value>) -> Self {
        lock(&self.state)
            .readings
            .insert(device_id.to_string(), value.into());
        self
    }

    /// Values returned by successive reads of `device_id`.
    pub fn script_readings(self, device_id: &str, values: Vec<Value>) -> Self {
        lock(&self.state)
            .scripted
            .insert(device_id.to_string(), values.into());
        self
    }

    /// Rejects the next `times` commands addressed to `device_id`.
    pub fn fail_commands(self, device_id: &str, times: u32, message: &str) -> Self {
        lock(&self.state)
            .failures
            .insert(device_id.to_string(), (times, message.to_string()));
        self
    }

    /// Delays every reply for `device_id`.
    pub fn with_latency(self, device_id: &str, latency: Duration) -> Self {
        lock(&self.state).latency.insert(device_id.to_string(), latency);
        self
    }

    pub fn sent_commands(&self) -> Vec<SentCommand> {
        lock(&self.state).sent.clone()
    }

    pub fn commands_for(&self, device_id: &str) -> Vec<SentCommand> {
        lock(&self.state)
            .sent
            .iter()
            .filter(|c| c.command.device_id == device_id)
            .cloned()
            .collect()
    }

    pub fn fallback_calls(&self) -> Vec<FallbackControl> {
        lock(&self.state).fallback_calls.clone()
    }

    fn next_reading(state: &mut GatewayState, device_id: &str) -> Value {
        state
            .scripted
            .get_mut(device_id)
            .and_then(VecDeque::pop_front)
            .or_else(|| state.readings.get(device_id).cloned())
            .unwrap_or(Value::Number(0.0))
    }

    fn take_failure(state: &mut GatewayState, device_id: &str) -> Option<String> {
        let entry = state.failures.get_mut(device_id)?;
        if entry.0 == 0 {
            return None;
        }
        entry.0 -= 1;
        Some(entry.1.clone())
    }
}

#[async_trait]
impl DeviceGateway for SimulatedGateway {
    async fn resolve_device(&self, device_id: &str) -> Result<DeviceInfo, DeviceError> {
        let mut state = lock(&self.state);
        if let Some(device) = state.devices.get(device_id) {
            return Ok(device.clone());
        }
        if !self.auto_provision {
            return Err(DeviceError::NotFound(device_id.to_string()));
        }

        let device_type = if device_id.contains("sensor") {
            "generic_sensor"
        } else {
            "relay"
        };
        let device = DeviceInfo {
            id: device_id.to_string(),
            name: device_id.to_string(),
            device_type: device_type.to_string(),
            controller_id: "sim".to_string(),
            ports: vec!["D1".to_string()],
            unit: None,
            is_active: true,
        };
        tracing::debug!(device = %device_id, "provisioned simulated device");
        state.live.insert("sim".to_string());
        state.devices.insert(device_id.to_string(), device.clone());
        Ok(device)
    }

    fn has_live_connection(&self, controller_id: &str) -> bool {
        lock(&self.state).live.contains(controller_id)
    }

    async fn send_command(
        &self,
        controller_id: &str,
        command: DeviceCommand,
    ) -> Result<CommandReply, DeviceError> {
        let latency = lock(&self.state).latency.get(&command.device_id).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = lock(&self.state);
        state.sent.push(SentCommand {
            controller_id: controller_id.to_string(),
            command: command.clone(),
            at: Instant::now(),
        });

        if let Some(message) = Self::take_failure(&mut state, &command.device_id) {
            return Ok(CommandReply::failed(message));
        }

        Ok(match command.kind {
            CommandKind::ReadSensor => {
                CommandReply::reading(Self::next_reading(&mut state, &command.device_id))
            }
            CommandKind::ControlActuator => CommandReply {
                data: command
                    .action
                    .map(|a| serde_json::json!({ "hardwareState": a.as_str() })),
                ..CommandReply::ok()
            },
        })
    }

    fn has_fallback(&self) -> bool {
        self.fallback
    }

    async fn read_sensor(&self, device_id: &str) -> Result<Value, DeviceError> {
        if !self.fallback {
            return Err(DeviceError::NoFallback(device_id.to_string()));
        }
        Ok(Self::next_reading(&mut lock(&self.state), device_id))
    }

    async fn control_device(
        &self,
        device_id: &str,
        action: ActionType,
        duration_secs: f64,
    ) -> Result<(), DeviceError> {
        if !self.fallback {
            return Err(DeviceError::NoFallback(device_id.to_string()));
        }
        lock(&self.state).fallback_calls.push(FallbackControl {
            device_id: device_id.to_string(),
            action,
            duration_secs,
        });
        Ok(())
    }
}

/// Keeps every block record and run summary in memory
#[derive(Default)]
pub struct RecordingRecorder {
    blocks: Mutex<Vec<BlockRecord>>,
    runs: Mutex<Vec<RunSummary>>,
    statuses: Mutex<Vec<(String, ProgramStatus)>>,
}

impl RecordingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> Vec<BlockRecord> {
        lock(&self.blocks).clone()
    }

    pub fn runs(&self) -> Vec<RunSummary> {
        lock(&self.runs).clone()
    }

    pub fn program_statuses(&self) -> Vec<(String, ProgramStatus)> {
        lock(&self.statuses).clone()
    }
}

#[async_trait]
impl RunRecorder for RecordingRecorder {
    async fn record_block(&self, record: BlockRecord) -> Result<(), SinkError> {
        lock(&self.blocks).push(record);
        Ok(())
    }

    async fn complete_run(&self, summary: RunSummary) -> Result<(), SinkError> {
        lock(&self.runs).push(summary);
        Ok(())
    }

    async fn sync_program_status(&self, program_id: &str, status: ProgramStatus) -> Result<(), SinkError> {
        lock(&self.statuses).push((program_id.to_string(), status));
        Ok(())
    }
}

/// Keeps every notification in memory
#[derive(Default)]
pub struct RecordingNotifier {
    errors: Mutex<Vec<ErrorNotification>>,
    custom: Mutex<Vec<CustomNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> Vec<ErrorNotification> {
        lock(&self.errors).clone()
    }

    pub fn custom(&self) -> Vec<CustomNotification> {
        lock(&self.custom).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_error(&self, notification: ErrorNotification) -> Result<(), SinkError> {
        lock(&self.errors).push(notification);
        Ok(())
    }

    async fn send_custom(&self, notification: CustomNotification) -> Result<(), SinkError> {
        lock(&self.custom).push(notification);
        Ok(())
    }
}

/// Keeps monitoring samples in memory, optionally failing every write
#[derive(Default)]
pub struct RecordingMonitor {
    samples: Mutex<Vec<MonitoringSample>>,
    unavailable: bool,
}

impl RecordingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn samples(&self) -> Vec<MonitoringSample> {
        lock(&self.samples).clone()
    }
}

#[async_trait]
impl MonitoringSink for RecordingMonitor {
    async fn record_sample(&self, sample: MonitoringSample) -> Result<(), SinkError> {
        if self.unavailable {
            return Err(SinkError::Unavailable("monitoring store offline".to_string()));
        }
        lock(&self.samples).push(sample);
        Ok(())
    }
}
