use crate::{SystemState, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::progress::BlockEvent;

pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Events published while flows execute
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    FlowStarted {
        run_id: Option<RunId>,
        flow_id: String,
        resumed: bool,
        timestamp: DateTime<Utc>,
    },
    FlowPaused {
        flow_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    FlowStopped {
        flow_id: Option<String>,
        emergency: bool,
        timestamp: DateTime<Utc>,
    },
    FlowCompleted {
        run_id: RunId,
        flow_id: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    FlowStatusChanged {
        status: String,
        block_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    StateChanged {
        from: SystemState,
        to: SystemState,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    ErrorOccurred {
        flow_id: Option<String>,
        error: String,
        timestamp: DateTime<Utc>,
    },
    BlockStarted(BlockEvent),
    BlockCompleted(BlockEvent),
    VariableUpdated {
        name: String,
        value: Option<Value>,
        timestamp: DateTime<Utc>,
    },
    Log {
        level: LogLevel,
        message: String,
        block_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn status(status: impl Into<String>, block_id: Option<String>) -> Self {
        ExecutionEvent::FlowStatusChanged {
            status: status.into(),
            block_id,
            timestamp: Utc::now(),
        }
    }
}

/// Anything that accepts execution events. Publishing never fails the caller.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: ExecutionEvent);
}

/// In-process broadcast bus
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: ExecutionEvent) {
        self.emit(event);
    }
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEvents;

impl EventSink for NullEvents {
    fn publish(&self, _event: ExecutionEvent) {}
}
