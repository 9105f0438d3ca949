use crate::config::RuntimeConfig;
use crate::graph::ExecutionGraph;
use crate::state::SystemStateManager;
use chrono::{DateTime, Utc};
use hydroblocks::{cancellable_wait, secs, BlockExecutor};
use hydrocore::events::{BlockEvent, BlockStatus, BlockTiming};
use hydrocore::params::{ErrorHandlerParams, FallbackStrategy};
use hydrocore::{
    ports, BlockNode, CustomNotification, DeviceInfo, ErrorKind, EventBus, ExecutionContext,
    ExecutionError, ExecutionEvent, ExecutionResult, FlowError, GraphError, LogLevel,
    ProgramStatus, Severity,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// How a run ended when it did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum RunEnd {
    /// The last block had nowhere to go.
    Completed { final_block: String },
    /// Cancellation was observed between blocks; the end block ran.
    Cancelled {
        reason: String,
        final_block: Option<String>,
    },
    /// Stopped by an error handler or an operator.
    Stopped {
        reason: String,
        final_block: Option<String>,
    },
}

impl RunEnd {
    pub fn is_success(&self) -> bool {
        !matches!(self, RunEnd::Stopped { .. })
    }

    pub fn final_block(&self) -> Option<&str> {
        match self {
            RunEnd::Completed { final_block } => Some(final_block),
            RunEnd::Cancelled { final_block, .. } | RunEnd::Stopped { final_block, .. } => {
                final_block.as_deref()
            }
        }
    }

    pub fn stopped_by(&self) -> Option<&str> {
        match self {
            RunEnd::Completed { .. } => None,
            RunEnd::Cancelled { reason, .. } | RunEnd::Stopped { reason, .. } => Some(reason),
        }
    }
}

enum Step {
    Next(String),
    End(RunEnd),
}

/// Walks one run through the graph, one block at a time.
pub struct FlowInterpreter {
    graph: ExecutionGraph,
    executor: Arc<BlockExecutor>,
    state: Arc<SystemStateManager>,
    events: Arc<EventBus>,
    pause_poll: Duration,
    post_block_delay: Duration,
    devices: HashMap<String, Option<DeviceInfo>>,
}

impl FlowInterpreter {
    pub fn new(
        graph: ExecutionGraph,
        executor: Arc<BlockExecutor>,
        state: Arc<SystemStateManager>,
        events: Arc<EventBus>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            graph,
            executor,
            state,
            events,
            pause_poll: config.pause_poll(),
            post_block_delay: config.post_block_delay(),
            devices: HashMap::new(),
        }
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    /// Runs from the entry block. A fatal failure puts the state manager
    /// into `Error` before it is returned.
    pub async fn run(&mut self, ctx: &mut ExecutionContext) -> Result<RunEnd, FlowError> {
        let entry = self.graph.entry_block().map(str::to_string);
        let result = match entry {
            Ok(entry) => self.execute_from(ctx, entry).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = &result {
            self.abort(ctx, e);
        }
        result
    }

    fn abort(&self, ctx: &mut ExecutionContext, error: &FlowError) {
        tracing::error!(flow_id = %ctx.flow_id(), error = %error, "flow execution aborted");
        if !matches!(error, FlowError::BlockFailed { .. }) {
            let kind = match error {
                FlowError::Graph(_) | FlowError::GotoTargetMissing(_) | FlowError::Validation(_) => {
                    ErrorKind::FlowValidationError
                }
                FlowError::Context(_) => ErrorKind::MemoryLimit,
                _ => ErrorKind::ExecutionTimeout,
            };
            let block_id = ctx.current_block_id().unwrap_or("unknown").to_string();
            ctx.add_error(ExecutionError::new(kind, error.to_string(), block_id, Severity::High));
        }
        self.state.set_error_state(&error.to_string());
    }

    async fn execute_from(&mut self, ctx: &mut ExecutionContext, start: String) -> Result<RunEnd, FlowError> {
        let mut current = start;
        let mut last_block: Option<String> = None;

        loop {
            let cancellation = self.executor.cancellation();
            if let Err(reason) = cancellation.check() {
                cancellation.reset();
                return Ok(self.jump_to_end(ctx, reason, last_block).await);
            }

            if ctx.is_paused() {
                tracing::info!(flow_id = %ctx.flow_id(), "execution paused, waiting for resume or stop");
                self.wait_for_resume_or_stop(ctx).await;
                if ctx.is_stopped() {
                    self.events
                        .emit(ExecutionEvent::status("stopped", Some(current.clone())));
                    return Ok(RunEnd::Stopped {
                        reason: "Stopped while paused".to_string(),
                        final_block: last_block,
                    });
                }
                self.events
                    .emit(ExecutionEvent::status("resumed", Some(current.clone())));
                continue;
            }

            if ctx.is_stopped() {
                self.events
                    .emit(ExecutionEvent::status("stopped", Some(current.clone())));
                return Ok(RunEnd::Stopped {
                    reason: "Execution stopped".to_string(),
                    final_block: last_block,
                });
            }

            let block = self
                .graph
                .block(&current)
                .cloned()
                .ok_or_else(|| GraphError::BlockNotFound(current.clone()))?;

            let result = self.execute_tracked(&block, ctx).await;
            last_block = Some(block.id.clone());

            let result = if result.success {
                result
            } else {
                match self.recover(&block, result, ctx).await? {
                    Some(routed) => routed,
                    None => {
                        return Ok(RunEnd::Stopped {
                            reason: format!("Stopped by error handler after {} failed", block.id),
                            final_block: last_block,
                        })
                    }
                }
            };

            if !self.post_block_delay.is_zero() {
                tokio::time::sleep(self.post_block_delay).await;
            }

            match self.route(&block, &result, ctx)? {
                Step::Next(next) => current = next,
                Step::End(end) => return Ok(end),
            }
        }
    }

    /// Executes one block with progress events, status updates and the
    /// executed-block bookkeeping around it.
    async fn execute_tracked(&mut self, block: &BlockNode, ctx: &mut ExecutionContext) -> ExecutionResult {
        ctx.set_current_block(&block.id);
        self.state
            .update_current_block(&block.id, Some(format!("Executing {}", block.definition_id)));

        let visible = block.kind.is_some_and(|k| k.is_ui_visible());
        let started_at = Utc::now();
        let clock = Instant::now();
        if visible {
            let event = self
                .block_event(block, ctx, BlockStatus::Started, started_at, None, None)
                .await;
            self.events.emit(ExecutionEvent::BlockStarted(event));
        }

        let custom_notification = self.has_custom_notification(&block.id);
        let result = self.executor.execute(block, ctx, custom_notification).await;
        let elapsed = clock.elapsed();

        tracing::debug!(
            block_id = %block.id,
            kind = %block.definition_id,
            success = result.success,
            port = %result.output_port,
            duration_ms = elapsed.as_millis() as u64,
            "block finished"
        );

        if visible {
            let status = if result.success {
                BlockStatus::Completed
            } else {
                BlockStatus::Failed
            };
            let event = self
                .block_event(block, ctx, status, started_at, Some(elapsed), result.data.clone())
                .await;
            self.events.emit(ExecutionEvent::BlockCompleted(event));
        }

        ctx.add_executed_block(&block.id);
        result
    }

    fn has_custom_notification(&self, block_id: &str) -> bool {
        self.graph
            .find_error_handler_for(block_id)
            .and_then(|h| h.params::<ErrorHandlerParams>().ok())
            .is_some_and(|p| p.has_custom_notification())
    }

    /// Decides what happens after a failed block. `Some` carries the result
    /// to route on, `None` ends the run.
    async fn recover(
        &mut self,
        block: &BlockNode,
        failed: ExecutionResult,
        ctx: &mut ExecutionContext,
    ) -> Result<Option<ExecutionResult>, FlowError> {
        let error = failed.error.clone().unwrap_or_else(|| {
            ExecutionError::new(ErrorKind::ExecutionTimeout, "Block failed", &block.id, Severity::High)
        });
        tracing::warn!(block_id = %block.id, error = %error, "block execution failed");

        if let Some(handler) = self.graph.find_error_handler_for(&block.id).cloned() {
            tracing::info!(block_id = %block.id, handler = %handler.id, "applying linked error handler");
            return self.apply_error_handler(&handler, block, &error, ctx).await;
        }

        if self.graph.first_target(&block.id, ports::ON_ERROR_OUT).is_some() {
            ctx.add_log(
                format!("Redirecting to error handler for block: {}", block.id),
                LogLevel::Info,
                Some(&block.id),
            );
            return Ok(Some(failed));
        }

        if error.severity.is_fatal() {
            return Err(FlowError::BlockFailed {
                block_id: block.id.clone(),
                message: error.message,
            });
        }

        ctx.add_log(
            format!("Non-critical error in block {}: {}", block.id, error.message),
            LogLevel::Warn,
            Some(&block.id),
        );
        Ok(Some(ExecutionResult::success(ports::FLOW_OUT)))
    }

    async fn apply_error_handler(
        &mut self,
        handler: &BlockNode,
        source: &BlockNode,
        error: &ExecutionError,
        ctx: &mut ExecutionContext,
    ) -> Result<Option<ExecutionResult>, FlowError> {
        let params = handler.params::<ErrorHandlerParams>().unwrap_or_else(|e| {
            ctx.add_log(
                format!("Error handler parameters unreadable, using defaults: {}", e),
                LogLevel::Warn,
                Some(&handler.id),
            );
            ErrorHandlerParams::default()
        });

        if params.has_custom_notification() {
            self.send_custom_notification(&params, source, error, ctx).await;
        } else if !params.user_message.trim().is_empty() {
            ctx.add_log(
                format!("User notification: {}", params.user_message),
                LogLevel::Info,
                Some(&handler.id),
            );
        }

        if params.retries_enabled() {
            let delay = secs(params.retry_delay);
            let slice = self.executor.config().wait_slice;
            for attempt in 1..=params.max_retries {
                if attempt > 1 && !delay.is_zero() {
                    cancellable_wait(self.executor.cancellation(), delay, slice).await;
                }
                ctx.add_log(
                    format!("Retry attempt {}/{} for block {}", attempt, params.max_retries, source.id),
                    LogLevel::Info,
                    Some(&handler.id),
                );
                let retried = self.execute_tracked(source, ctx).await;
                if retried.success {
                    ctx.add_log(
                        format!("Retry attempt {} succeeded", attempt),
                        LogLevel::Info,
                        Some(&handler.id),
                    );
                    return Ok(Some(retried));
                }
            }
            ctx.add_log(
                format!("All {} retry attempts failed", params.max_retries),
                LogLevel::Warn,
                Some(&handler.id),
            );
        }

        match params.fallback_strategy {
            FallbackStrategy::Continue => Ok(Some(ExecutionResult::success(ports::FLOW_OUT))),
            FallbackStrategy::Stop => {
                ctx.add_log("Error handler stopped the flow", LogLevel::Warn, Some(&handler.id));
                self.sync_program_status(ctx, ProgramStatus::Loaded).await;
                Ok(None)
            }
            FallbackStrategy::Pause => {
                ctx.pause();
                self.state.pause_execution();
                self.sync_program_status(ctx, ProgramStatus::Paused).await;
                self.events
                    .emit(ExecutionEvent::status("paused", Some(handler.id.clone())));
                Ok(Some(ExecutionResult::success(ports::FLOW_OUT)))
            }
        }
    }

    async fn send_custom_notification(
        &self,
        params: &ErrorHandlerParams,
        source: &BlockNode,
        error: &ExecutionError,
        ctx: &mut ExecutionContext,
    ) {
        let context = params.include_context_data.then(|| {
            json!({
                "sourceBlockId": source.id,
                "sourceBlockType": source.definition_id,
                "parameters": source.parameters,
                "error": {
                    "type": error.kind,
                    "severity": error.severity,
                    "message": error.message,
                    "timestamp": error.timestamp,
                },
            })
        });
        let notification = CustomNotification {
            source_block_id: source.id.clone(),
            source_block_kind: source.definition_id.clone(),
            message: params.user_message.clone(),
            context,
            timestamp: Utc::now(),
        };

        match self.executor.services().notifier.send_custom(notification).await {
            Ok(()) => ctx.add_log(
                format!("Custom error notification sent: {}", params.user_message),
                LogLevel::Info,
                Some(&source.id),
            ),
            Err(e) => ctx.add_log(
                format!("Failed to send custom error notification: {}", e),
                LogLevel::Warn,
                Some(&source.id),
            ),
        }
    }

    async fn sync_program_status(&self, ctx: &mut ExecutionContext, status: ProgramStatus) {
        let Some(program_id) = ctx.get_variable("programId").map(|v| v.to_string()) else {
            tracing::debug!("no programId in run variables, program status not synced");
            return;
        };
        let recorder = &self.executor.services().recorder;
        if let Err(e) = recorder.sync_program_status(&program_id, status).await {
            ctx.add_log(
                format!("Failed to sync program status: {}", e),
                LogLevel::Warn,
                None,
            );
        }
    }

    /// Picks the next block for a result: GOTO target, stop, or the first
    /// connection on the result's port.
    fn route(&self, block: &BlockNode, result: &ExecutionResult, ctx: &mut ExecutionContext) -> Result<Step, FlowError> {
        if result.is_redirect() {
            let target = result.redirect_target().unwrap_or_default();
            if !self.graph.contains(target) {
                return Err(FlowError::GotoTargetMissing(target.to_string()));
            }
            return Ok(Step::Next(target.to_string()));
        }

        if result.output_port == ports::FLOW_OUT_STOP {
            let strategy = result
                .data
                .as_ref()
                .and_then(|d| d.get("strategy"))
                .and_then(|s| s.as_str())
                .unwrap_or("unknown")
                .to_string();
            ctx.add_log(
                format!("Flow stopped by ErrorHandler: {}", strategy),
                LogLevel::Info,
                Some(&block.id),
            );
            return Ok(Step::End(RunEnd::Stopped {
                reason: format!("ErrorHandler: {}", strategy),
                final_block: Some(block.id.clone()),
            }));
        }

        match self.graph.first_target(&block.id, &result.output_port) {
            Some(next) => Ok(Step::Next(next.to_string())),
            None => {
                ctx.add_log(
                    format!("Flow completed at block: {}", block.id),
                    LogLevel::Info,
                    Some(&block.id),
                );
                Ok(Step::End(RunEnd::Completed {
                    final_block: block.id.clone(),
                }))
            }
        }
    }

    /// Ends a cancelled run through the first `system.end` block. The run
    /// counts as completed whatever that block returns.
    async fn jump_to_end(&mut self, ctx: &mut ExecutionContext, reason: String, last_block: Option<String>) -> RunEnd {
        let Some(end) = self.graph.system_end_block().cloned() else {
            ctx.add_log("Flow execution cancelled - no end block found", LogLevel::Info, None);
            return RunEnd::Cancelled {
                reason,
                final_block: last_block,
            };
        };

        ctx.add_log(
            format!("Execution cancelled - jumping to end block ({})", reason),
            LogLevel::Info,
            Some(&end.id),
        );
        self.state
            .update_current_block(&end.id, Some("Cancelled - executing end block".to_string()));

        let result = self.executor.execute(&end, ctx, false).await;
        ctx.add_executed_block(&end.id);
        if result.success {
            ctx.add_log("Flow completed at end block (cancelled)", LogLevel::Info, Some(&end.id));
        } else {
            ctx.add_log(
                "End block failed after cancellation, completing anyway",
                LogLevel::Warn,
                Some(&end.id),
            );
        }

        RunEnd::Cancelled {
            reason,
            final_block: Some(end.id),
        }
    }

    async fn wait_for_resume_or_stop(&self, ctx: &ExecutionContext) {
        while ctx.is_paused() && !ctx.is_stopped() {
            tokio::time::sleep(self.pause_poll).await;
        }
    }

    async fn block_event(
        &mut self,
        block: &BlockNode,
        ctx: &ExecutionContext,
        status: BlockStatus,
        started_at: DateTime<Utc>,
        elapsed: Option<Duration>,
        result: Option<serde_json::Value>,
    ) -> BlockEvent {
        let device = match block.device_id() {
            Some(id) => self.device(id).await,
            None => None,
        };

        BlockEvent {
            block_id: block.id.clone(),
            block_kind: block.definition_id.clone(),
            block_name: block.display_name(),
            device_name: device.as_ref().map(|d| d.name.clone()),
            device_type: device.as_ref().map(|d| d.device_type.clone()),
            parameters: block.parameters.clone(),
            identifiers: ctx.run_identifiers(),
            timing: BlockTiming {
                started_at,
                ended_at: elapsed.map(|_| Utc::now()),
                duration_ms: elapsed.map(|d| d.as_millis() as u64),
            },
            status,
            result,
        }
    }

    /// Device lookup for progress events, cached for the run.
    async fn device(&mut self, device_id: &str) -> Option<DeviceInfo> {
        if let Some(cached) = self.devices.get(device_id) {
            return cached.clone();
        }
        let resolved = self
            .executor
            .services()
            .gateway
            .resolve_device(device_id)
            .await
            .ok();
        self.devices.insert(device_id.to_string(), resolved.clone());
        resolved
    }
}
