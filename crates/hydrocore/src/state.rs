use serde::{Deserialize, Serialize};
use std::fmt;

/// Global execution state of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Idle,
    Running,
    Paused,
    Stopped,
    Error,
}

impl SystemState {
    pub const ALL: [SystemState; 5] = [
        SystemState::Idle,
        SystemState::Running,
        SystemState::Paused,
        SystemState::Stopped,
        SystemState::Error,
    ];

    /// Whether the state machine permits moving from `self` to `to`.
    pub fn can_transition_to(&self, to: SystemState) -> bool {
        use SystemState::*;
        matches!(
            (self, to),
            (Idle, Running)
                | (Running, Paused)
                | (Running, Stopped)
                | (Running, Error)
                | (Running, Idle)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Stopped, Idle)
                | (Error, Idle)
                | (Error, Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Idle => "idle",
            SystemState::Running => "running",
            SystemState::Paused => "paused",
            SystemState::Stopped => "stopped",
            SystemState::Error => "error",
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
