//! Per-run memory: variables, logs, errors, loop bookkeeping and run flags.

use crate::events::{EventSink, ExecutionEvent, LogLevel, NullEvents, RunId, RunIdentifiers};
use crate::{BlockState, ContextError, DataType, ExecutionError, LoopState, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub const DEFAULT_MAX_LOGS: usize = 1000;
pub const DEFAULT_MAX_VARIABLES: usize = 100;

/// Run flags shared between a running context and external control handles
#[derive(Debug, Default)]
pub struct RunFlags {
    running: AtomicBool,
    paused: AtomicBool,
    stopped: AtomicBool,
}

impl RunFlags {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLog {
    pub id: Uuid,
    pub block_id: String,
    pub message: String,
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableMetadata {
    pub name: String,
    pub display_name: String,
    pub data_type: DataType,
    pub source: String,
    pub unit: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Optional metadata supplied when a variable is written
#[derive(Debug, Clone, Default)]
pub struct VariableHint {
    pub display_name: Option<String>,
    pub data_type: Option<DataType>,
    pub source: Option<String>,
    pub unit: Option<String>,
}

impl VariableHint {
    pub fn from_block(block_id: &str) -> Self {
        Self {
            source: Some(block_id.to_string()),
            ..Default::default()
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    pub fn unit(mut self, unit: Option<String>) -> Self {
        self.unit = unit;
        self
    }
}

/// Serializable image of a context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub flow_id: String,
    pub run_id: RunId,
    pub current_block_id: Option<String>,
    pub variables: BTreeMap<String, Value>,
    pub executed_blocks: Vec<String>,
    pub active_loops: Vec<LoopState>,
    #[serde(default)]
    pub loop_context_stack: Vec<String>,
    #[serde(default)]
    pub block_states: HashMap<String, BlockState>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStatus {
    pub is_running: bool,
    pub is_paused: bool,
    pub is_stopped: bool,
    pub current_block: Option<String>,
    pub variable_count: usize,
    pub log_count: usize,
    pub error_count: usize,
    pub active_loops: usize,
    pub execution_time_ms: u64,
}

pub struct ExecutionContext {
    flow_id: String,
    run_id: RunId,
    current_block_id: Option<String>,
    executed_blocks: Vec<String>,
    variables: BTreeMap<String, Option<Value>>,
    metadata: HashMap<String, VariableMetadata>,
    logs: VecDeque<ExecutionLog>,
    errors: Vec<ExecutionError>,
    active_loops: Vec<LoopState>,
    loop_stack: Vec<String>,
    block_states: HashMap<String, BlockState>,
    flags: Arc<RunFlags>,
    started: Instant,
    max_logs: usize,
    max_variables: usize,
    events: Arc<dyn EventSink>,
}

impl ExecutionContext {
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self::with_limits(flow_id, DEFAULT_MAX_LOGS, DEFAULT_MAX_VARIABLES)
    }

    pub fn with_limits(flow_id: impl Into<String>, max_logs: usize, max_variables: usize) -> Self {
        Self {
            flow_id: flow_id.into(),
            run_id: Uuid::new_v4(),
            current_block_id: None,
            executed_blocks: Vec::new(),
            variables: BTreeMap::new(),
            metadata: HashMap::new(),
            logs: VecDeque::new(),
            errors: Vec::new(),
            active_loops: Vec::new(),
            loop_stack: Vec::new(),
            block_states: HashMap::new(),
            flags: Arc::new(RunFlags::default()),
            started: Instant::now(),
            max_logs,
            max_variables,
            events: Arc::new(NullEvents),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Shares run flags with an external control handle.
    pub fn with_flags(mut self, flags: Arc<RunFlags>) -> Self {
        self.flags = flags;
        self
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn flags(&self) -> &Arc<RunFlags> {
        &self.flags
    }

    // Variables

    /// Writes a variable. New names beyond the capacity limit are rejected;
    /// overwriting an existing name always succeeds.
    pub fn set_variable(
        &mut self,
        name: &str,
        value: Value,
        hint: Option<VariableHint>,
    ) -> Result<(), ContextError> {
        self.store(name, Some(value), hint)
    }

    /// Declares a variable without a value.
    pub fn declare_variable(&mut self, name: &str, hint: Option<VariableHint>) -> Result<(), ContextError> {
        self.store(name, None, hint)
    }

    fn store(
        &mut self,
        name: &str,
        value: Option<Value>,
        hint: Option<VariableHint>,
    ) -> Result<(), ContextError> {
        if !self.variables.contains_key(name) && self.variables.len() >= self.max_variables {
            return Err(ContextError::CapacityExceeded {
                limit: self.max_variables,
            });
        }

        let data_type = hint
            .as_ref()
            .and_then(|h| h.data_type)
            .or_else(|| value.as_ref().map(Value::inferred_type))
            .unwrap_or_default();
        let hint = hint.unwrap_or_default();
        self.metadata.insert(
            name.to_string(),
            VariableMetadata {
                name: name.to_string(),
                display_name: hint.display_name.unwrap_or_else(|| name.to_string()),
                data_type,
                source: hint.source.unwrap_or_else(|| "unknown".to_string()),
                unit: hint.unit,
                last_updated: Utc::now(),
            },
        );

        self.events.publish(ExecutionEvent::VariableUpdated {
            name: name.to_string(),
            value: value.clone(),
            timestamp: Utc::now(),
        });
        self.variables.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name).and_then(|v| v.as_ref())
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// All variables that currently hold a value.
    pub fn variables(&self) -> BTreeMap<String, Value> {
        self.variables
            .iter()
            .filter_map(|(k, v)| v.clone().map(|v| (k.clone(), v)))
            .collect()
    }

    /// Every declared name, including ones that have no value yet.
    pub fn variable_names(&self) -> Vec<String> {
        self.variables.keys().cloned().collect()
    }

    pub fn variable_metadata(&self, name: &str) -> Option<&VariableMetadata> {
        self.metadata.get(name)
    }

    pub fn clear_variable(&mut self, name: &str) {
        self.variables.remove(name);
        self.metadata.remove(name);
    }

    pub fn clear_variables(&mut self) {
        self.variables.clear();
        self.metadata.clear();
    }

    /// Program and cycle identifiers seeded by whoever launched the run.
    pub fn run_identifiers(&self) -> RunIdentifiers {
        let text = |key: &str| self.get_variable(key).map(|v| v.to_string());
        RunIdentifiers {
            execution_session_id: text("executionSessionId").or_else(|| text("executionId")),
            program_id: text("programId"),
            program_name: text("programName"),
            cycle_id: text("cycleId"),
            cycle_name: text("cycleName"),
        }
    }

    // Navigation

    pub fn current_block_id(&self) -> Option<&str> {
        self.current_block_id.as_deref()
    }

    pub fn set_current_block(&mut self, block_id: &str) {
        self.current_block_id = Some(block_id.to_string());
    }

    pub fn add_executed_block(&mut self, block_id: &str) {
        if !self.is_block_executed(block_id) {
            self.executed_blocks.push(block_id.to_string());
        }
    }

    pub fn is_block_executed(&self, block_id: &str) -> bool {
        self.executed_blocks.iter().any(|b| b == block_id)
    }

    pub fn executed_blocks(&self) -> &[String] {
        &self.executed_blocks
    }

    // Logs and errors

    pub fn add_log(&mut self, message: impl Into<String>, level: LogLevel, block_id: Option<&str>) {
        let message = message.into();
        let block_id = block_id
            .or(self.current_block_id.as_deref())
            .unwrap_or("unknown")
            .to_string();

        match level {
            LogLevel::Debug => tracing::debug!(flow = %self.flow_id, block = %block_id, "{}", message),
            LogLevel::Info => tracing::info!(flow = %self.flow_id, block = %block_id, "{}", message),
            LogLevel::Warn => tracing::warn!(flow = %self.flow_id, block = %block_id, "{}", message),
            LogLevel::Error => tracing::error!(flow = %self.flow_id, block = %block_id, "{}", message),
        }

        let log = ExecutionLog {
            id: Uuid::new_v4(),
            block_id,
            message,
            level,
            timestamp: Utc::now(),
        };
        self.events.publish(ExecutionEvent::Log {
            level,
            message: log.message.clone(),
            block_id: log.block_id.clone(),
            timestamp: log.timestamp,
        });

        self.logs.push_back(log);
        while self.logs.len() > self.max_logs {
            self.logs.pop_front();
        }
    }

    pub fn log(&mut self, message: impl Into<String>, block_id: &str) {
        self.add_log(message, LogLevel::Info, Some(block_id));
    }

    pub fn add_error(&mut self, error: ExecutionError) {
        let message = format!("Error: {}", error.message);
        let block_id = error.block_id.clone();
        self.errors.push(error);
        self.add_log(message, LogLevel::Error, Some(&block_id));
    }

    pub fn last_error(&self) -> Option<&ExecutionError> {
        self.errors.last()
    }

    pub fn errors(&self) -> &[ExecutionError] {
        &self.errors
    }

    pub fn logs(&self) -> impl Iterator<Item = &ExecutionLog> {
        self.logs.iter()
    }

    pub fn recent_logs(&self, count: usize) -> Vec<&ExecutionLog> {
        let skip = self.logs.len().saturating_sub(count);
        self.logs.iter().skip(skip).collect()
    }

    pub fn logs_by_level(&self, level: LogLevel) -> Vec<&ExecutionLog> {
        self.logs.iter().filter(|l| l.level == level).collect()
    }

    // Run flags

    pub fn start(&mut self) {
        self.flags.start();
        self.started = Instant::now();
        self.add_log("Execution started", LogLevel::Info, None);
    }

    pub fn pause(&mut self) {
        self.flags.pause();
        self.add_log("Execution paused", LogLevel::Info, None);
    }

    pub fn resume(&mut self) {
        self.flags.resume();
        self.add_log("Execution resumed", LogLevel::Info, None);
    }

    pub fn stop(&mut self) {
        self.flags.stop();
        self.add_log("Execution stopped", LogLevel::Info, None);
    }

    pub fn is_running(&self) -> bool {
        self.flags.is_running()
    }

    pub fn is_paused(&self) -> bool {
        self.flags.is_paused()
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.is_stopped()
    }

    // Loops

    pub fn add_active_loop(&mut self, state: LoopState) {
        self.active_loops.push(state);
    }

    pub fn remove_active_loop(&mut self, block_id: &str) {
        self.active_loops.retain(|l| l.block_id != block_id);
    }

    pub fn active_loop(&self, block_id: &str) -> Option<&LoopState> {
        self.active_loops.iter().find(|l| l.block_id == block_id)
    }

    pub fn active_loops(&self) -> &[LoopState] {
        &self.active_loops
    }

    pub fn update_loop_iteration(&mut self, block_id: &str, iteration: u32) {
        if let Some(state) = self.active_loops.iter_mut().find(|l| l.block_id == block_id) {
            state.current_iteration = iteration;
        }
    }

    pub fn enter_loop_context(&mut self, block_id: &str) {
        self.loop_stack.push(block_id.to_string());
        self.add_log(format!("Entered loop context: {}", block_id), LogLevel::Debug, None);
    }

    pub fn exit_loop_context(&mut self, block_id: &str) {
        match self.loop_stack.pop() {
            Some(last) if last == block_id => {
                self.add_log(format!("Exited loop context: {}", block_id), LogLevel::Debug, None);
            }
            other => {
                self.add_log(
                    format!(
                        "Loop context mismatch. Expected: {}, got: {}",
                        block_id,
                        other.as_deref().unwrap_or("none")
                    ),
                    LogLevel::Warn,
                    None,
                );
            }
        }
    }

    pub fn current_loop_context(&self) -> Option<&str> {
        self.loop_stack.last().map(String::as_str)
    }

    pub fn has_active_loop_context(&self) -> bool {
        !self.loop_stack.is_empty()
    }

    pub fn loop_context_stack(&self) -> &[String] {
        &self.loop_stack
    }

    /// Per-block state that persists across visits within this run.
    pub fn block_state(&self, block_id: &str) -> BlockState {
        self.block_states.get(block_id).copied().unwrap_or_default()
    }

    pub fn block_state_mut(&mut self, block_id: &str) -> &mut BlockState {
        self.block_states.entry(block_id.to_string()).or_default()
    }

    // Snapshots

    pub fn to_snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            flow_id: self.flow_id.clone(),
            run_id: self.run_id,
            current_block_id: self.current_block_id.clone(),
            variables: self.variables(),
            executed_blocks: self.executed_blocks.clone(),
            active_loops: self.active_loops.clone(),
            loop_context_stack: self.loop_stack.clone(),
            block_states: self.block_states.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn restore(&mut self, snapshot: ExecutionSnapshot) {
        self.flow_id = snapshot.flow_id;
        self.run_id = snapshot.run_id;
        self.current_block_id = snapshot.current_block_id;
        self.executed_blocks = snapshot.executed_blocks;
        self.active_loops = snapshot.active_loops;
        self.loop_stack = snapshot.loop_context_stack;
        self.block_states = snapshot.block_states;
        // Older snapshots only carry the active loops.
        for state in &self.active_loops {
            self.block_states
                .entry(state.block_id.clone())
                .or_insert(BlockState {
                    iterations: state.current_iteration,
                    completed: false,
                });
        }
        self.variables = snapshot
            .variables
            .into_iter()
            .map(|(k, v)| (k, Some(v)))
            .collect();
        self.add_log("Context restored from snapshot", LogLevel::Info, None);
    }

    pub fn cleanup(&mut self) {
        self.logs.clear();
        self.errors.clear();
        self.clear_variables();
        self.active_loops.clear();
        self.executed_blocks.clear();
        self.loop_stack.clear();
        self.block_states.clear();
        self.add_log("Context cleaned up", LogLevel::Info, None);
    }

    pub fn status(&self) -> ContextStatus {
        ContextStatus {
            is_running: self.is_running(),
            is_paused: self.is_paused(),
            is_stopped: self.is_stopped(),
            current_block: self.current_block_id.clone(),
            variable_count: self.variables.len(),
            log_count: self.logs.len(),
            error_count: self.errors.len(),
            active_loops: self.active_loops.len(),
            execution_time_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("flow_id", &self.flow_id)
            .field("run_id", &self.run_id)
            .field("current_block_id", &self.current_block_id)
            .field("variables", &self.variables)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, LoopKind, Severity};

    #[test]
    fn capacity_blocks_new_names_only() {
        let mut ctx = ExecutionContext::with_limits("f", 10, 2);
        ctx.set_variable("a", Value::Number(1.0), None).unwrap();
        ctx.set_variable("b", Value::Number(2.0), None).unwrap();

        let err = ctx.set_variable("c", Value::Number(3.0), None).unwrap_err();
        assert_eq!(err, ContextError::CapacityExceeded { limit: 2 });
        assert!(!ctx.has_variable("c"));

        ctx.set_variable("a", Value::Number(9.0), None).unwrap();
        assert_eq!(ctx.get_variable("a"), Some(&Value::Number(9.0)));
    }

    #[test]
    fn log_buffer_keeps_newest() {
        let mut ctx = ExecutionContext::with_limits("f", 3, 10);
        for i in 0..5 {
            ctx.add_log(format!("line {i}"), LogLevel::Info, Some("b"));
        }
        let messages: Vec<_> = ctx.logs().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, ["line 2", "line 3", "line 4"]);
        assert_eq!(ctx.recent_logs(2).len(), 2);
    }

    #[test]
    fn metadata_type_explicit_wins() {
        let mut ctx = ExecutionContext::new("f");
        ctx.set_variable("ph", Value::Text("6.1".into()), Some(VariableHint::from_block("s1").data_type(DataType::Number)))
            .unwrap();
        ctx.set_variable("label", Value::Text("x".into()), None).unwrap();

        assert_eq!(ctx.variable_metadata("ph").unwrap().data_type, DataType::Number);
        assert_eq!(ctx.variable_metadata("ph").unwrap().source, "s1");
        assert_eq!(ctx.variable_metadata("label").unwrap().data_type, DataType::String);
    }

    #[test]
    fn declared_variables_hold_no_value() {
        let mut ctx = ExecutionContext::new("f");
        ctx.declare_variable("temp", Some(VariableHint::default().display_name("Temperature"))).unwrap();
        assert!(ctx.has_variable("temp"));
        assert!(ctx.get_variable("temp").is_none());
        assert!(ctx.variables().is_empty());
        assert_eq!(ctx.variable_metadata("temp").unwrap().display_name, "Temperature");
    }

    #[test]
    fn errors_are_logged() {
        let mut ctx = ExecutionContext::new("f");
        ctx.add_error(ExecutionError::new(ErrorKind::SensorTimeout, "slow", "s1", Severity::Medium));
        assert_eq!(ctx.last_error().unwrap().block_id, "s1");
        assert_eq!(ctx.logs_by_level(LogLevel::Error).len(), 1);
    }

    #[test]
    fn snapshot_restores_variables_and_loops() {
        let mut ctx = ExecutionContext::new("f");
        ctx.set_variable("var1", Value::Number(4.0), None).unwrap();
        ctx.add_executed_block("b1");
        ctx.add_active_loop(LoopState {
            block_id: "loop".into(),
            kind: LoopKind::Repeat,
            current_iteration: 2,
            max_iterations: Some(5),
            condition: None,
            delay_secs: 0.0,
        });

        let snapshot = ctx.to_snapshot();
        let mut restored = ExecutionContext::new("other");
        restored.restore(snapshot);

        assert_eq!(restored.flow_id(), "f");
        assert_eq!(restored.get_variable("var1"), Some(&Value::Number(4.0)));
        assert!(restored.is_block_executed("b1"));
        assert_eq!(restored.active_loop("loop").unwrap().current_iteration, 2);
        assert_eq!(restored.block_state("loop").iterations, 2);
    }

    #[test]
    fn snapshot_carries_block_state_and_loop_stack() {
        let mut ctx = ExecutionContext::new("f");
        ctx.block_state_mut("outer").iterations = 3;
        ctx.enter_loop_context("outer");

        let json = serde_json::to_string(&ctx.to_snapshot()).unwrap();
        let mut restored = ExecutionContext::new("f");
        restored.restore(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.block_state("outer").iterations, 3);
        assert_eq!(restored.current_loop_context(), Some("outer"));
    }

    #[test]
    fn loop_context_stack_tracks_nesting() {
        let mut ctx = ExecutionContext::new("f");
        ctx.enter_loop_context("outer");
        ctx.enter_loop_context("inner");
        assert_eq!(ctx.current_loop_context(), Some("inner"));
        ctx.exit_loop_context("inner");
        ctx.exit_loop_context("outer");
        assert!(!ctx.has_active_loop_context());
    }

    #[test]
    fn run_identifiers_read_variables() {
        let mut ctx = ExecutionContext::new("f");
        ctx.set_variable("executionId", Value::Text("sess-1".into()), None).unwrap();
        ctx.set_variable("programName", Value::Text("Tomatoes".into()), None).unwrap();
        let ids = ctx.run_identifiers();
        assert_eq!(ids.execution_session_id.as_deref(), Some("sess-1"));
        assert_eq!(ids.program_name.as_deref(), Some("Tomatoes"));
        assert_eq!(ids.cycle_id, None);
    }
}
