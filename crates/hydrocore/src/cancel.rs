use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken as Signal;

/// Process-wide cancellation flag for the running flow.
///
/// Unlike a plain `tokio_util` token this one can be reset, so the same
/// handle is reused across runs. Clones share state.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    reason: Option<String>,
    signal: Signal,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        let mut slot = self.slot();
        slot.reason = Some(reason.into());
        self.inner.cancelled.store(true, Ordering::SeqCst);
        slot.signal.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.slot().reason.clone()
    }

    /// Clears the flag and the reason. Waiters on the previous signal stay parked.
    pub fn reset(&self) {
        let mut slot = self.slot();
        self.inner.cancelled.store(false, Ordering::SeqCst);
        slot.reason = None;
        slot.signal = Signal::new();
    }

    /// Returns the cancellation reason if cancelled.
    pub fn check(&self) -> Result<(), String> {
        if self.is_cancelled() {
            Err(self
                .reason()
                .unwrap_or_else(|| "cancelled".to_string()))
        } else {
            Ok(())
        }
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let signal = self.slot().signal.clone();
        if self.is_cancelled() {
            return;
        }
        signal.cancelled().await
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
