//! Process-wide execution state: the state machine, advisory device locks
//! and the queue of deferred monitoring runs.

use chrono::{DateTime, Utc};
use hydrocore::{CancellationToken, EventSink, ExecutionEvent, SystemState, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransition {
    pub from: SystemState,
    pub to: SystemState,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Exclusive,
    Shared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLock {
    pub device_id: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub kind: LockKind,
}

/// What the controller is doing right now, for status displays
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateContext {
    pub flow_id: Option<String>,
    pub current_block_id: Option<String>,
    pub current_action: Option<String>,
    pub variables: BTreeMap<String, Value>,
    pub error: Option<String>,
}

/// A monitoring run deferred until the controller is free again
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingFlow {
    pub flow_id: String,
    pub requested_by: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringQueueState {
    pub pending: Vec<PendingFlow>,
    pub is_paused: bool,
    pub paused_by: Option<String>,
    pub paused_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStatus {
    pub current_state: SystemState,
    pub context: StateContext,
    pub locked_resources: usize,
    pub history_len: usize,
    pub last_transition: Option<StateTransition>,
    pub monitoring_queue: MonitoringQueueState,
}

/// Identifies a registered state-change handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type StateChangeHandler = Arc<dyn Fn(SystemState, SystemState) + Send + Sync>;

struct Inner {
    state: SystemState,
    history: VecDeque<StateTransition>,
    locks: HashMap<String, ResourceLock>,
    context: StateContext,
    handlers: Vec<(HandlerId, StateChangeHandler)>,
    next_handler: u64,
    queue: VecDeque<PendingFlow>,
    queue_paused_by: Option<String>,
    queue_paused_at: Option<DateTime<Utc>>,
}

/// Coordinates the global execution state.
///
/// Every check-then-transition happens under one lock, so at most one
/// caller can move the machine out of `Idle` into `Running`.
pub struct SystemStateManager {
    inner: Mutex<Inner>,
    cancellation: CancellationToken,
    events: Arc<dyn EventSink>,
    history_limit: usize,
}

impl SystemStateManager {
    pub fn new(cancellation: CancellationToken, events: Arc<dyn EventSink>, history_limit: usize) -> Self {
        let mut history = VecDeque::new();
        history.push_back(StateTransition {
            from: SystemState::Idle,
            to: SystemState::Idle,
            reason: Some("System initialized".to_string()),
            timestamp: Utc::now(),
        });

        Self {
            inner: Mutex::new(Inner {
                state: SystemState::Idle,
                history,
                locks: HashMap::new(),
                context: StateContext::default(),
                handlers: Vec::new(),
                next_handler: 0,
                queue: VecDeque::new(),
                queue_paused_by: None,
                queue_paused_at: None,
            }),
            cancellation,
            events,
            history_limit: history_limit.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current_state(&self) -> SystemState {
        self.lock().state
    }

    pub fn current_context(&self) -> StateContext {
        self.lock().context.clone()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Applies a transition if the table allows it. Returns the handlers to
    /// notify once the lock is released.
    fn set_state(
        &self,
        inner: &mut Inner,
        to: SystemState,
        reason: &str,
    ) -> Option<Vec<StateChangeHandler>> {
        let from = inner.state;
        if !from.can_transition_to(to) {
            tracing::warn!(%from, %to, "invalid state transition rejected");
            return None;
        }

        inner.state = to;
        inner.context.current_action = Some(reason.to_string());
        inner.history.push_back(StateTransition {
            from,
            to,
            reason: Some(reason.to_string()),
            timestamp: Utc::now(),
        });
        while inner.history.len() > self.history_limit {
            inner.history.pop_front();
        }

        tracing::info!(%from, %to, reason, "system state changed");
        self.events.publish(ExecutionEvent::StateChanged {
            from,
            to,
            reason: Some(reason.to_string()),
            timestamp: Utc::now(),
        });
        Some(inner.handlers.iter().map(|(_, h)| h.clone()).collect())
    }

    fn notify(handlers: Vec<StateChangeHandler>, from: SystemState, to: SystemState) {
        for handler in handlers {
            handler(from, to);
        }
    }

    fn transition(&self, to: SystemState, reason: &str) -> bool {
        let (from, handlers) = {
            let mut inner = self.lock();
            let from = inner.state;
            (from, self.set_state(&mut inner, to, reason))
        };
        match handlers {
            Some(handlers) => {
                Self::notify(handlers, from, to);
                true
            }
            None => false,
        }
    }

    /// Idle -> Running. Resets the cancellation token and the status context.
    pub fn start_execution(&self, flow_id: &str) -> bool {
        let handlers = {
            let mut inner = self.lock();
            if inner.state != SystemState::Idle {
                tracing::warn!(flow_id, state = %inner.state, "cannot start execution");
                return false;
            }
            self.cancellation.reset();
            inner.context = StateContext {
                flow_id: Some(flow_id.to_string()),
                ..StateContext::default()
            };
            self.set_state(&mut inner, SystemState::Running, &format!("Started flow {}", flow_id))
        };
        let Some(handlers) = handlers else {
            return false;
        };
        Self::notify(handlers, SystemState::Idle, SystemState::Running);

        self.events.publish(ExecutionEvent::FlowStarted {
            run_id: None,
            flow_id: flow_id.to_string(),
            resumed: false,
            timestamp: Utc::now(),
        });
        true
    }

    pub fn pause_execution(&self) -> bool {
        if self.current_state() != SystemState::Running {
            return false;
        }
        let paused = self.transition(SystemState::Paused, "Execution paused");
        if paused {
            self.events.publish(ExecutionEvent::FlowPaused {
                flow_id: self.current_context().flow_id,
                timestamp: Utc::now(),
            });
        }
        paused
    }

    pub fn resume_execution(&self) -> bool {
        if self.current_state() != SystemState::Paused {
            return false;
        }
        let resumed = self.transition(SystemState::Running, "Execution resumed");
        if resumed {
            self.events.publish(ExecutionEvent::FlowStarted {
                run_id: None,
                flow_id: self.current_context().flow_id.unwrap_or_default(),
                resumed: true,
                timestamp: Utc::now(),
            });
        }
        resumed
    }

    /// Running -> Idle after a run ends on its own.
    pub fn complete_execution(&self) -> bool {
        self.transition(SystemState::Idle, "Flow completed")
    }

    /// Cancels the run and releases every lock, passing through `Stopped`
    /// straight back to `Idle`.
    pub fn stop_execution(&self, emergency: bool) -> bool {
        let reason = if emergency { "Emergency stop" } else { "Normal stop" };

        let (from, stopped, idle, flow_id) = {
            let mut inner = self.lock();
            let from = inner.state;
            if !matches!(
                from,
                SystemState::Running | SystemState::Paused | SystemState::Error
            ) {
                return false;
            }

            self.cancellation.cancel(reason);
            let Some(stopped) = self.set_state(&mut inner, SystemState::Stopped, reason) else {
                return false;
            };
            inner.context.current_action = Some(if emergency { "Emergency stopped" } else { "Stopped" }.to_string());
            inner.locks.clear();
            let flow_id = inner.context.flow_id.clone();
            let idle = self.set_state(&mut inner, SystemState::Idle, "Ready for next execution");
            inner.context = StateContext::default();
            (from, stopped, idle, flow_id)
        };

        Self::notify(stopped, from, SystemState::Stopped);
        self.events.publish(ExecutionEvent::FlowStopped {
            flow_id,
            emergency,
            timestamp: Utc::now(),
        });
        if let Some(idle) = idle {
            Self::notify(idle, SystemState::Stopped, SystemState::Idle);
        }
        true
    }

    /// Moves to `Error` from any non-idle state the table allows.
    pub fn set_error_state(&self, error: &str) -> bool {
        let (from, handlers, flow_id) = {
            let mut inner = self.lock();
            if inner.state == SystemState::Idle {
                return false;
            }
            let from = inner.state;
            let handlers = self.set_state(&mut inner, SystemState::Error, &format!("Error occurred: {}", error));
            if handlers.is_some() {
                inner.context.error = Some(error.to_string());
            }
            (from, handlers, inner.context.flow_id.clone())
        };
        let Some(handlers) = handlers else {
            return false;
        };

        Self::notify(handlers, from, SystemState::Error);
        self.events.publish(ExecutionEvent::ErrorOccurred {
            flow_id,
            error: error.to_string(),
            timestamp: Utc::now(),
        });
        true
    }

    /// Error -> Idle once an operator has seen the failure.
    pub fn acknowledge_error(&self) -> bool {
        if self.current_state() != SystemState::Error {
            return false;
        }
        let acknowledged = self.transition(SystemState::Idle, "Error acknowledged");
        if acknowledged {
            self.lock().context = StateContext::default();
        }
        acknowledged
    }

    // Resource locks

    /// Takes an advisory lock on `device_id`. Two shared locks may coexist;
    /// any other combination conflicts.
    pub fn lock_resource(&self, device_id: &str, requester: &str, kind: LockKind) -> bool {
        let mut inner = self.lock();
        if let Some(existing) = inner.locks.get(device_id) {
            return kind == LockKind::Shared && existing.kind == LockKind::Shared;
        }
        inner.locks.insert(
            device_id.to_string(),
            ResourceLock {
                device_id: device_id.to_string(),
                locked_by: requester.to_string(),
                locked_at: Utc::now(),
                kind,
            },
        );
        true
    }

    pub fn unlock_resource(&self, device_id: &str) {
        self.lock().locks.remove(device_id);
    }

    pub fn unlock_all_resources(&self) {
        self.lock().locks.clear();
    }

    pub fn is_resource_locked(&self, device_id: &str) -> bool {
        self.lock().locks.contains_key(device_id)
    }

    pub fn resource_lock(&self, device_id: &str) -> Option<ResourceLock> {
        self.lock().locks.get(device_id).cloned()
    }

    pub fn locked_resources(&self) -> Vec<ResourceLock> {
        self.lock().locks.values().cloned().collect()
    }

    // Status context

    pub fn update_context(&self, update: impl FnOnce(&mut StateContext)) {
        update(&mut self.lock().context);
    }

    pub fn update_current_block(&self, block_id: &str, action: Option<String>) {
        let mut inner = self.lock();
        inner.context.current_block_id = Some(block_id.to_string());
        if action.is_some() {
            inner.context.current_action = action;
        }
    }

    pub fn update_variables(&self, variables: BTreeMap<String, Value>) {
        self.lock().context.variables = variables;
    }

    // Subscribers

    pub fn on_state_change(&self, handler: impl Fn(SystemState, SystemState) + Send + Sync + 'static) -> HandlerId {
        let mut inner = self.lock();
        let id = HandlerId(inner.next_handler);
        inner.next_handler += 1;
        inner.handlers.push((id, Arc::new(handler)));
        id
    }

    pub fn remove_state_change_handler(&self, id: HandlerId) -> bool {
        let mut inner = self.lock();
        let before = inner.handlers.len();
        inner.handlers.retain(|(h, _)| *h != id);
        inner.handlers.len() != before
    }

    pub fn state_history(&self) -> Vec<StateTransition> {
        self.lock().history.iter().cloned().collect()
    }

    // Monitoring queue

    /// Defers a monitoring run. A flow already waiting is not queued twice.
    pub fn enqueue_monitoring(&self, flow_id: &str, requested_by: &str) -> bool {
        let mut inner = self.lock();
        if inner.queue.iter().any(|p| p.flow_id == flow_id) {
            tracing::debug!(flow_id, "monitoring flow already queued");
            return false;
        }
        inner.queue.push_back(PendingFlow {
            flow_id: flow_id.to_string(),
            requested_by: requested_by.to_string(),
            enqueued_at: Utc::now(),
        });
        true
    }

    /// Drains every pending request, oldest first.
    pub fn dequeue_all_pending(&self) -> Vec<PendingFlow> {
        self.lock().queue.drain(..).collect()
    }

    pub fn pause_monitoring(&self, paused_by: &str) {
        let mut inner = self.lock();
        inner.queue_paused_by = Some(paused_by.to_string());
        inner.queue_paused_at = Some(Utc::now());
    }

    /// Lifts the monitoring pause and returns how many runs are waiting.
    pub fn resume_monitoring(&self) -> usize {
        let pending = {
            let mut inner = self.lock();
            inner.queue_paused_by = None;
            inner.queue_paused_at = None;
            inner.queue.len()
        };
        self.events
            .publish(ExecutionEvent::status("monitoring_resumed", None));
        pending
    }

    pub fn monitoring_queue_state(&self) -> MonitoringQueueState {
        let inner = self.lock();
        Self::queue_state(&inner)
    }

    fn queue_state(inner: &Inner) -> MonitoringQueueState {
        MonitoringQueueState {
            pending: inner.queue.iter().cloned().collect(),
            is_paused: inner.queue_paused_by.is_some(),
            paused_by: inner.queue_paused_by.clone(),
            paused_at: inner.queue_paused_at,
        }
    }

    pub fn status(&self) -> StateStatus {
        let inner = self.lock();
        StateStatus {
            current_state: inner.state,
            context: inner.context.clone(),
            locked_resources: inner.locks.len(),
            history_len: inner.history.len(),
            last_transition: inner.history.back().cloned(),
            monitoring_queue: Self::queue_state(&inner),
        }
    }

    /// Drops locks, subscribers and queued runs and returns to `Idle` when
    /// the table allows it.
    pub fn cleanup(&self) {
        {
            let mut inner = self.lock();
            inner.locks.clear();
            inner.handlers.clear();
            inner.context = StateContext::default();
            inner.queue.clear();
            inner.queue_paused_by = None;
            inner.queue_paused_at = None;
        }
        self.transition(SystemState::Idle, "System cleanup");
    }
}

impl std::fmt::Debug for SystemStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemStateManager")
            .field("state", &self.current_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrocore::EventBus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use SystemState::*;

    fn manager() -> SystemStateManager {
        SystemStateManager::new(CancellationToken::new(), Arc::new(EventBus::new(16)), 100)
    }

    fn force(manager: &SystemStateManager, state: SystemState) {
        manager.lock().state = state;
    }

    #[test]
    fn disallowed_transitions_change_nothing() {
        let m = manager();
        for from in SystemState::ALL {
            for to in SystemState::ALL {
                if from.can_transition_to(to) {
                    continue;
                }
                force(&m, from);
                let history = m.state_history();
                assert!(!m.transition(to, "test"), "{from} -> {to}");
                assert_eq!(m.current_state(), from);
                assert_eq!(m.state_history(), history);
            }
        }
    }

    #[test]
    fn second_start_fails() {
        let m = manager();
        assert!(m.start_execution("f1"));
        assert!(!m.start_execution("f1"));
        assert_eq!(m.current_state(), Running);
    }

    #[test]
    fn start_resets_cancellation() {
        let m = manager();
        m.cancellation().cancel("left over");
        assert!(m.start_execution("f1"));
        assert!(!m.cancellation().is_cancelled());
    }

    #[test]
    fn stop_returns_to_idle_and_releases_locks() {
        let m = manager();
        m.start_execution("f1");
        assert!(m.lock_resource("pump", "f1", LockKind::Exclusive));
        assert!(m.stop_execution(true));

        assert_eq!(m.current_state(), Idle);
        assert!(m.locked_resources().is_empty());
        assert_eq!(m.cancellation().reason().as_deref(), Some("Emergency stop"));

        let tail: Vec<_> = m
            .state_history()
            .iter()
            .rev()
            .take(2)
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(tail, vec![(Stopped, Idle), (Running, Stopped)]);
        assert!(!m.stop_execution(false));
    }

    #[test]
    fn error_state_until_acknowledged() {
        let m = manager();
        assert!(!m.set_error_state("idle"));
        m.start_execution("f1");
        assert!(m.set_error_state("pump jammed"));
        assert_eq!(m.current_context().error.as_deref(), Some("pump jammed"));
        assert!(!m.start_execution("f2"));
        assert!(m.acknowledge_error());
        assert!(m.start_execution("f2"));
    }

    #[test]
    fn paused_runs_cannot_fail_directly() {
        let m = manager();
        m.start_execution("f1");
        assert!(m.pause_execution());
        assert!(!m.pause_execution());
        assert!(!m.set_error_state("late failure"));
        assert_eq!(m.current_state(), Paused);
        assert!(m.resume_execution());
        assert_eq!(m.current_state(), Running);
    }

    #[test]
    fn lock_compatibility() {
        let m = manager();
        assert!(m.lock_resource("valve", "a", LockKind::Shared));
        assert!(m.lock_resource("valve", "b", LockKind::Shared));
        assert!(!m.lock_resource("valve", "c", LockKind::Exclusive));

        assert!(m.lock_resource("pump", "a", LockKind::Exclusive));
        assert!(!m.lock_resource("pump", "b", LockKind::Shared));
        assert_eq!(m.resource_lock("pump").map(|l| l.locked_by), Some("a".to_string()));

        m.unlock_resource("pump");
        assert!(!m.is_resource_locked("pump"));
        m.unlock_all_resources();
        assert!(m.locked_resources().is_empty());
    }

    #[test]
    fn history_is_bounded() {
        let m = SystemStateManager::new(CancellationToken::new(), Arc::new(EventBus::new(16)), 3);
        for _ in 0..5 {
            m.start_execution("f");
            m.complete_execution();
        }
        assert_eq!(m.state_history().len(), 3);
        assert_eq!(m.status().last_transition.map(|t| t.to), Some(Idle));
    }

    #[test]
    fn handlers_see_transitions_until_removed() {
        let m = manager();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = m.on_state_change(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        m.start_execution("f");
        m.complete_execution();
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        assert!(m.remove_state_change_handler(id));
        m.start_execution("f");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn monitoring_queue_is_fifo_without_duplicates() {
        let m = manager();
        assert!(m.enqueue_monitoring("m1", "cycle-a"));
        assert!(m.enqueue_monitoring("m2", "cycle-a"));
        assert!(!m.enqueue_monitoring("m1", "cycle-b"));

        m.pause_monitoring("cycle-a");
        assert!(m.monitoring_queue_state().is_paused);
        assert_eq!(m.resume_monitoring(), 2);

        let drained: Vec<_> = m.dequeue_all_pending().into_iter().map(|p| p.flow_id).collect();
        assert_eq!(drained, vec!["m1", "m2"]);
        assert!(m.monitoring_queue_state().pending.is_empty());
    }

    #[tokio::test]
    async fn transitions_are_published() {
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let m = SystemStateManager::new(CancellationToken::new(), bus, 100);
        m.start_execution("f");

        match rx.recv().await.unwrap() {
            ExecutionEvent::StateChanged { from, to, .. } => assert_eq!((from, to), (Idle, Running)),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            ExecutionEvent::FlowStarted { resumed: false, .. }
        ));
    }
}
