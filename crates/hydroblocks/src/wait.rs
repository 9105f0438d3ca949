use hydrocore::CancellationToken;
use tokio::time::{sleep, Duration, Instant};

/// Remaining time a wait is allowed after cancellation is observed.
pub const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Converts editor seconds into a duration. Negative and NaN become zero,
/// out-of-range values saturate.
pub fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The full duration elapsed.
    Completed,
    /// Cancellation cut the wait down to `elapsed`.
    Shortened { elapsed: Duration },
}

/// Sleeps for `duration` in slices, watching `token`.
///
/// When cancellation is seen with more than [`CANCEL_GRACE`] left, the wait
/// ends [`CANCEL_GRACE`] after that moment instead. The caller always gets
/// control back so it can run its closing step.
pub async fn cancellable_wait(
    token: &CancellationToken,
    duration: Duration,
    slice: Duration,
) -> WaitOutcome {
    let start = Instant::now();
    let mut deadline = start
        .checked_add(duration)
        .unwrap_or_else(|| start + Duration::from_secs(u32::MAX as u64));
    let mut shortened = false;
    let mut observed = false;
    let slice = if slice.is_zero() { Duration::from_millis(1000) } else { slice };

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }

        if !observed && token.is_cancelled() {
            observed = true;
            if deadline - now > CANCEL_GRACE {
                deadline = now + CANCEL_GRACE;
                shortened = true;
                tracing::info!(
                    elapsed_ms = (now - start).as_millis() as u64,
                    "wait cancelled, finishing after grace period"
                );
            }
            continue;
        }

        let step = slice.min(deadline - now);
        if observed {
            sleep(step).await;
        } else {
            tokio::select! {
                _ = sleep(step) => {}
                _ = token.cancelled() => {}
            }
        }
    }

    if shortened {
        WaitOutcome::Shortened {
            elapsed: start.elapsed(),
        }
    } else {
        WaitOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_are_clamped() {
        assert_eq!(secs(-3.0), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(1.5), Duration::from_millis(1500));
        assert_eq!(secs(f64::INFINITY), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_to_completion() {
        let token = CancellationToken::new();
        let start = Instant::now();
        let outcome = cancellable_wait(&token, Duration::from_secs(5), Duration::from_secs(1)).await;
        assert_eq!(outcome, WaitOutcome::Completed);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_leaves_grace_period() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(3)).await;
            canceller.cancel("operator stop");
        });

        let start = Instant::now();
        let outcome = cancellable_wait(&token, Duration::from_secs(60), Duration::from_secs(1)).await;

        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(
            outcome,
            WaitOutcome::Shortened {
                elapsed: Duration::from_secs(5)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn short_remainder_is_not_extended() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(4500)).await;
            canceller.cancel("stop");
        });

        let start = Instant::now();
        let outcome = cancellable_wait(&token, Duration::from_secs(5), Duration::from_secs(1)).await;
        assert_eq!(outcome, WaitOutcome::Completed);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_token() {
        let token = CancellationToken::new();
        token.cancel("stop");
        let start = Instant::now();
        cancellable_wait(&token, Duration::from_secs(30), Duration::from_secs(1)).await;
        assert_eq!(start.elapsed(), CANCEL_GRACE);
    }
}
