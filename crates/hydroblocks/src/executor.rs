use crate::handlers;
use crate::notify::{NotificationPolicy, NotificationThrottle};
use crate::wait::{self, cancellable_wait, WaitOutcome};
use chrono::{DateTime, Utc};
use hydrocore::events::BlockStatus;
use hydrocore::{
    BlockError, BlockKind, BlockNode, BlockRecord, CancellationToken, ErrorKind, ErrorNotification,
    ExecutionContext, ExecutionError, ExecutionResult, LogLevel, Services, Severity,
};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

/// Executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Upper bound for a single handler run.
    pub block_timeout: Duration,
    /// Polling slice of cancellable waits.
    pub wait_slice: Duration,
    pub notification: NotificationPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            block_timeout: Duration::from_secs(600),
            wait_slice: Duration::from_millis(1000),
            notification: NotificationPolicy::default(),
        }
    }
}

/// Time budget handed to a handler
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

/// Runs single blocks: dispatch by kind, deadline, error classification,
/// run records and automatic error notifications.
pub struct BlockExecutor {
    services: Services,
    cancellation: CancellationToken,
    config: ExecutorConfig,
    throttle: NotificationThrottle,
}

impl BlockExecutor {
    pub fn new(services: Services, cancellation: CancellationToken, config: ExecutorConfig) -> Self {
        let throttle = NotificationThrottle::new(config.notification.clone());
        Self {
            services,
            cancellation,
            config,
            throttle,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn supported_kinds() -> &'static [BlockKind] {
        &BlockKind::ALL
    }

    /// Executes `block` against `ctx`. Never fails: errors come back as a
    /// failed [`ExecutionResult`] on the `onErrorOut` port.
    ///
    /// `custom_notification` suppresses the automatic error notification
    /// when a linked error handler sends its own.
    pub async fn execute(
        &self,
        block: &BlockNode,
        ctx: &mut ExecutionContext,
        custom_notification: bool,
    ) -> ExecutionResult {
        let Some(kind) = block.kind else {
            let error = ExecutionError::new(
                ErrorKind::InvalidBlockType,
                format!("Unknown block type: {}", block.definition_id),
                &block.id,
                Severity::High,
            );
            ctx.add_error(error.clone());
            return ExecutionResult::failure(error);
        };

        ctx.add_log(format!("Executing block: {}", kind), LogLevel::Debug, Some(&block.id));

        let deadline = Deadline::after(self.config.block_timeout);
        let started_at = Utc::now();
        let start = Instant::now();
        let outcome = tokio::time::timeout_at(
            deadline.instant(),
            self.dispatch(kind, block, ctx, &deadline),
        )
        .await;
        let elapsed = start.elapsed();

        let result = match outcome {
            Ok(Ok(result)) => {
                ctx.add_log(
                    format!("Block executed in {}ms: SUCCESS", elapsed.as_millis()),
                    LogLevel::Info,
                    Some(&block.id),
                );
                result
            }
            Ok(Err(err)) => {
                let (error_kind, severity) = classify(kind, &err);
                let error = ExecutionError::new(error_kind, err.to_string(), &block.id, severity);
                self.fail(block, kind, ctx, error, custom_notification).await
            }
            Err(_) => {
                ctx.add_log(
                    format!(
                        "{} handler abandoned after {}s; commands already sent to devices are not undone",
                        kind,
                        deadline.budget().as_secs()
                    ),
                    LogLevel::Warn,
                    Some(&block.id),
                );
                let error = ExecutionError::new(
                    ErrorKind::ExecutionTimeout,
                    format!("Block execution timeout after {}ms", deadline.budget().as_millis()),
                    &block.id,
                    Severity::High,
                );
                self.fail(block, kind, ctx, error, custom_notification).await
            }
        };

        if kind.is_trackable() {
            self.record(block, kind, ctx, &result, started_at, elapsed).await;
        }

        result
    }

    async fn dispatch(
        &self,
        kind: BlockKind,
        block: &BlockNode,
        ctx: &mut ExecutionContext,
        deadline: &Deadline,
    ) -> Result<ExecutionResult, BlockError> {
        match kind {
            BlockKind::Sensor => handlers::sensor::execute(self, block, ctx).await,
            BlockKind::Actuator => handlers::actuator::execute(self, block, ctx, deadline).await,
            BlockKind::Wait => handlers::control::wait(self, block, ctx).await,
            BlockKind::If => handlers::logic::branch(block, ctx),
            BlockKind::Loop => handlers::logic::repeat(self, block, ctx).await,
            BlockKind::Goto => handlers::control::goto(block, ctx),
            BlockKind::Merge => Ok(handlers::control::merge(block, ctx)),
            BlockKind::ErrorHandler => handlers::error_handler::execute(block, ctx),
            BlockKind::SystemStart => Ok(handlers::control::start(block, ctx)),
            BlockKind::SystemEnd => Ok(handlers::control::end(block, ctx)),
            BlockKind::SetVarName => handlers::variables::declare(block, ctx),
            BlockKind::SetVarData => handlers::variables::assign(block, ctx),
        }
    }

    /// Waits `secs` seconds, ending early after the grace period when cancelled.
    pub(crate) async fn wait_secs(&self, secs: f64) -> WaitOutcome {
        cancellable_wait(&self.cancellation, wait::secs(secs), self.config.wait_slice).await
    }

    async fn fail(
        &self,
        block: &BlockNode,
        kind: BlockKind,
        ctx: &mut ExecutionContext,
        error: ExecutionError,
        custom_notification: bool,
    ) -> ExecutionResult {
        ctx.add_error(error.clone());

        if custom_notification {
            ctx.add_log(
                "Skipping automatic error notification: linked error handler sends its own",
                LogLevel::Debug,
                Some(&block.id),
            );
        } else if let Some(admission) = self.throttle.admit(&block.id, Some(kind)) {
            let notification = ErrorNotification {
                block_id: block.id.clone(),
                block_kind: kind.to_string(),
                message: error.message.clone(),
                template: admission.template,
                timestamp: Utc::now(),
            };
            if let Err(e) = self.services.notifier.send_error(notification).await {
                ctx.add_log(
                    format!("Failed to send error notification: {}", e),
                    LogLevel::Warn,
                    Some(&block.id),
                );
            }
        }

        ExecutionResult::failure(error)
    }

    async fn record(
        &self,
        block: &BlockNode,
        kind: BlockKind,
        ctx: &mut ExecutionContext,
        result: &ExecutionResult,
        started_at: DateTime<Utc>,
        elapsed: Duration,
    ) {
        let record = BlockRecord {
            run_id: ctx.run_id(),
            flow_id: ctx.flow_id().to_string(),
            block_id: block.id.clone(),
            block_kind: kind.to_string(),
            block_name: block.display_name(),
            status: if result.success {
                BlockStatus::Completed
            } else {
                BlockStatus::Failed
            },
            started_at,
            ended_at: Utc::now(),
            duration_ms: elapsed.as_millis() as u64,
            error_message: result.error.as_ref().map(|e| e.message.clone()),
            input: serde_json::Value::Object(block.parameters.clone()),
            output: result.data.clone(),
        };
        if let Err(e) = self.services.recorder.record_block(record).await {
            ctx.add_log(
                format!("Failed to record block execution: {}", e),
                LogLevel::Warn,
                Some(&block.id),
            );
        }
    }
}

/// Category and severity for a handler failure.
pub fn classify(kind: BlockKind, err: &BlockError) -> (ErrorKind, Severity) {
    match err {
        BlockError::Device(device) => device.classify(),
        BlockError::MissingParameter(_)
        | BlockError::InvalidParameters(_)
        | BlockError::VariableNotFound(_) => (ErrorKind::MissingParameter, Severity::High),
        BlockError::Condition(_) => (ErrorKind::ConditionError, Severity::High),
        BlockError::Context(_) => (ErrorKind::MemoryLimit, Severity::High),
        BlockError::Failed(_) => match kind {
            BlockKind::Sensor => (ErrorKind::SensorTimeout, Severity::Medium),
            BlockKind::Actuator => (ErrorKind::DeviceNotResponding, Severity::High),
            _ => (ErrorKind::ExecutionTimeout, Severity::High),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrocore::{ConditionError, ContextError, DeviceError};

    #[test]
    fn classification_table() {
        assert_eq!(
            classify(BlockKind::Sensor, &BlockError::Failed("glitch".into())),
            (ErrorKind::SensorTimeout, Severity::Medium)
        );
        assert_eq!(
            classify(BlockKind::Actuator, &BlockError::Failed("glitch".into())),
            (ErrorKind::DeviceNotResponding, Severity::High)
        );
        assert_eq!(
            classify(BlockKind::Wait, &BlockError::Failed("x".into())),
            (ErrorKind::ExecutionTimeout, Severity::High)
        );
        assert_eq!(
            classify(BlockKind::If, &ConditionError::NoCondition.into()),
            (ErrorKind::ConditionError, Severity::High)
        );
        assert_eq!(
            classify(BlockKind::SetVarData, &ContextError::CapacityExceeded { limit: 1 }.into()),
            (ErrorKind::MemoryLimit, Severity::High)
        );
        assert_eq!(
            classify(
                BlockKind::Sensor,
                &DeviceError::Timeout { device_id: "d".into(), timeout_ms: 5 }.into()
            ),
            (ErrorKind::SensorTimeout, Severity::Medium)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_tracks_remaining_budget() {
        let deadline = Deadline::after(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(deadline.remaining(), Duration::from_secs(6));
        assert_eq!(deadline.budget(), Duration::from_secs(10));
    }
}
