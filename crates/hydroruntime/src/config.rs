use hydroblocks::{ExecutorConfig, NotificationPolicy};
use hydrocore::{FlowError, DEFAULT_MAX_LOGS, DEFAULT_MAX_VARIABLES};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub block_timeout_secs: u64,
    pub event_buffer_size: usize,
    pub max_logs: usize,
    pub max_variables: usize,
    pub pause_poll_ms: u64,
    pub wait_slice_ms: u64,
    /// Pause inserted after every block before moving on.
    pub post_block_delay_ms: u64,
    pub state_history_limit: usize,
    pub notification: NotificationPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            block_timeout_secs: 600,
            event_buffer_size: 1000,
            max_logs: DEFAULT_MAX_LOGS,
            max_variables: DEFAULT_MAX_VARIABLES,
            pause_poll_ms: 100,
            wait_slice_ms: 1000,
            post_block_delay_ms: 0,
            state_history_limit: 100,
            notification: NotificationPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            block_timeout: Duration::from_secs(self.block_timeout_secs),
            wait_slice: Duration::from_millis(self.wait_slice_ms),
            notification: self.notification.clone(),
        }
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms.max(1))
    }

    pub fn post_block_delay(&self) -> Duration {
        Duration::from_millis(self.post_block_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrocore::BlockKind;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{
                "block_timeout_secs": 30,
                "notification": {"per_kind": {"actuator": {"cooldown_secs": 60}}}
            }"#,
        )
        .unwrap();

        assert_eq!(config.block_timeout_secs, 30);
        assert_eq!(config.pause_poll_ms, 100);
        assert_eq!(config.max_variables, DEFAULT_MAX_VARIABLES);
        assert_eq!(config.notification.default_cooldown_secs, 900);

        let rule = config.notification.rule_for("a1", Some(BlockKind::Actuator)).unwrap();
        assert_eq!(rule.cooldown_secs, Some(60));
        assert!(rule.enabled);
        assert_eq!(config.executor_config().block_timeout, Duration::from_secs(30));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = RuntimeConfig::from_json_file("/nonexistent/hydro.json").unwrap_err();
        assert!(matches!(err, FlowError::Io(_)));
    }
}
