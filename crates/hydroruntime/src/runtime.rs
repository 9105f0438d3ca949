use crate::config::RuntimeConfig;
use crate::graph::ExecutionGraph;
use crate::interpreter::FlowInterpreter;
use crate::state::{StateStatus, SystemStateManager};
use crate::validation::{self, ValidationReport};
use chrono::Utc;
use hydroblocks::BlockExecutor;
use hydrocore::{
    CancellationToken, EventBus, EventSink, ExecutionContext, ExecutionError, ExecutionEvent,
    FlowDefinition, FlowError, RunFlags, RunId, RunSummary, Services, SystemState, Value,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

type ActiveRun = Arc<Mutex<Option<Arc<RunFlags>>>>;

fn active(slot: &ActiveRun) -> MutexGuard<'_, Option<Arc<RunFlags>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What a finished run reports back
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: RunId,
    pub flow_id: String,
    pub success: bool,
    pub executed_blocks: Vec<String>,
    pub final_block: Option<String>,
    /// Why the run ended early, if it did.
    pub stopped_by: Option<String>,
    pub variables: BTreeMap<String, Value>,
    pub errors: Vec<ExecutionError>,
    pub duration_ms: u64,
}

/// Main runtime for executing flows
///
/// One flow runs at a time; the [`SystemStateManager`] refuses a second
/// start until the first has finished.
pub struct FlowRuntime {
    config: RuntimeConfig,
    executor: Arc<BlockExecutor>,
    state: Arc<SystemStateManager>,
    event_bus: Arc<EventBus>,
    active: ActiveRun,
    /// Held for the whole of `run`, including the drain after a stop.
    run_guard: tokio::sync::Mutex<()>,
}

impl FlowRuntime {
    pub fn new(config: RuntimeConfig, services: Services) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let cancellation = CancellationToken::new();
        let state = Arc::new(SystemStateManager::new(
            cancellation.clone(),
            event_bus.clone() as Arc<dyn EventSink>,
            config.state_history_limit,
        ));
        let executor = Arc::new(BlockExecutor::new(
            services,
            cancellation,
            config.executor_config(),
        ));

        Self {
            config,
            executor,
            state,
            event_bus,
            active: Arc::new(Mutex::new(None)),
            run_guard: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Structural check without running anything.
    pub fn validate(&self, flow: &FlowDefinition) -> ValidationReport {
        validation::validate(flow)
    }

    /// Runs `flow` to completion with `globals` seeded as run variables.
    ///
    /// Fails without side effects when the flow is invalid or another run
    /// is in progress. A failure after the run started leaves the state
    /// manager in `Error` until acknowledged.
    pub async fn run(
        &self,
        flow: &FlowDefinition,
        globals: BTreeMap<String, Value>,
    ) -> Result<RunOutcome, FlowError> {
        let graph = ExecutionGraph::build(flow)?;
        let warnings = validation::validate_graph(&graph).into_result()?;
        for warning in &warnings {
            tracing::warn!(flow_id = %flow.id, "{}", warning);
        }

        // A stopped run is back to Idle before its end block has run.
        let Ok(_running) = self.run_guard.try_lock() else {
            let state = self.state.current_state();
            let label = if state == SystemState::Idle {
                "stopping".to_string()
            } else {
                state.to_string()
            };
            return Err(FlowError::NotIdle(label));
        };
        if !self.state.start_execution(&flow.id) {
            return Err(FlowError::NotIdle(self.state.current_state().to_string()));
        }

        let flags = Arc::new(RunFlags::default());
        *active(&self.active) = Some(flags.clone());

        let mut ctx = ExecutionContext::with_limits(&flow.id, self.config.max_logs, self.config.max_variables)
            .with_events(self.event_bus.clone() as Arc<dyn EventSink>)
            .with_flags(flags.clone());
        ctx.start();

        let started_at = Utc::now();
        let clock = Instant::now();
        let result = match Self::seed(&mut ctx, &flow.id, globals) {
            Ok(()) => {
                self.state
                    .update_context(|c| c.current_action = Some("Flow validation completed".to_string()));
                tracing::info!(
                    flow_id = %flow.id,
                    run_id = %ctx.run_id(),
                    blocks = graph.len(),
                    "starting flow execution"
                );
                let mut interpreter = FlowInterpreter::new(
                    graph,
                    self.executor.clone(),
                    self.state.clone(),
                    self.event_bus.clone(),
                    &self.config,
                );
                interpreter.run(&mut ctx).await
            }
            Err(e) => {
                self.state.set_error_state(&e.to_string());
                Err(e)
            }
        };

        self.executor.cancellation().reset();
        {
            let mut slot = active(&self.active);
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &flags)) {
                *slot = None;
            }
        }
        match self.state.current_state() {
            SystemState::Running => {
                self.state.complete_execution();
            }
            SystemState::Paused => {
                self.state.stop_execution(false);
            }
            _ => {}
        }
        self.state.update_variables(ctx.variables());

        let success = result.as_ref().map(|end| end.is_success()).unwrap_or(false);
        let duration_ms = clock.elapsed().as_millis() as u64;
        self.event_bus.emit(ExecutionEvent::FlowCompleted {
            run_id: ctx.run_id(),
            flow_id: flow.id.clone(),
            success,
            duration_ms,
            timestamp: Utc::now(),
        });

        let summary = RunSummary {
            run_id: ctx.run_id(),
            flow_id: flow.id.clone(),
            success,
            executed_blocks: ctx.executed_blocks().len(),
            started_at,
            ended_at: Utc::now(),
        };
        if let Err(e) = self.executor.services().recorder.complete_run(summary).await {
            tracing::warn!(flow_id = %flow.id, error = %e, "failed to record run completion");
        }

        let end = result?;
        tracing::info!(
            flow_id = %flow.id,
            success,
            executed = ctx.executed_blocks().len(),
            duration_ms,
            "flow execution finished"
        );

        Ok(RunOutcome {
            run_id: ctx.run_id(),
            flow_id: flow.id.clone(),
            success,
            executed_blocks: ctx.executed_blocks().to_vec(),
            final_block: end.final_block().map(str::to_string),
            stopped_by: end.stopped_by().map(str::to_string),
            variables: ctx.variables(),
            errors: ctx.errors().to_vec(),
            duration_ms,
        })
    }

    fn seed(ctx: &mut ExecutionContext, flow_id: &str, globals: BTreeMap<String, Value>) -> Result<(), FlowError> {
        ctx.set_variable("flowId", Value::from(flow_id), None)?;
        for (name, value) in globals {
            ctx.set_variable(&name, value, None)?;
        }
        Ok(())
    }

    /// Handle for pausing, resuming or stopping the current run from
    /// another task.
    pub fn control(&self) -> RunControl {
        RunControl {
            state: self.state.clone(),
            active: self.active.clone(),
        }
    }

    pub fn state_manager(&self) -> &Arc<SystemStateManager> {
        &self.state
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

/// Operator controls for the run in progress
#[derive(Clone)]
pub struct RunControl {
    state: Arc<SystemStateManager>,
    active: ActiveRun,
}

impl RunControl {
    fn flags(&self) -> Option<Arc<RunFlags>> {
        active(&self.active).clone()
    }

    /// Takes effect before the next block starts.
    pub fn pause(&self) -> bool {
        if !self.state.pause_execution() {
            return false;
        }
        if let Some(flags) = self.flags() {
            flags.pause();
        }
        true
    }

    pub fn resume(&self) -> bool {
        if !self.state.resume_execution() {
            return false;
        }
        if let Some(flags) = self.flags() {
            flags.resume();
        }
        true
    }

    /// Cancels the run. A running flow finishes through its end block; a
    /// paused one ends where it is.
    pub fn stop(&self, emergency: bool) -> bool {
        let stopped = self.state.stop_execution(emergency);
        if let Some(flags) = self.flags() {
            flags.stop();
        }
        stopped
    }

    pub fn acknowledge_error(&self) -> bool {
        self.state.acknowledge_error()
    }

    pub fn status(&self) -> StateStatus {
        self.state.status()
    }
}

impl std::fmt::Debug for RunControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunControl")
            .field("state", &self.state.current_state())
            .field("active", &self.flags().is_some())
            .finish()
    }
}
