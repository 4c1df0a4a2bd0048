use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Bounds on waiting for an engine to publish its call surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Hard ceiling on the whole wait.
    pub timeout: Duration,
    /// Delay between predicate polls.
    pub poll_interval: Duration,
    /// Maximum number of polls before giving up.
    pub max_attempts: u32,
}

impl ReadinessPolicy {
    /// Default readiness ceiling.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Default poll interval.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
    /// Default poll budget.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            timeout: Self::DEFAULT_TIMEOUT,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitError {
    TimedOut,
    Cancelled,
}

enum Wake {
    Cancelled,
    Deadline,
    Signal,
    SignalClosed,
    Poll,
}

// Polling stops after `max_attempts`; the whole wait stops at `timeout`.
pub(crate) async fn wait_for<F>(
    mut ready: F,
    mut signal: Option<watch::Receiver<bool>>,
    policy: &ReadinessPolicy,
    cancel: &CancellationToken,
) -> Result<(), WaitError>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        if ready() || signal.as_ref().is_some_and(|rx| *rx.borrow()) {
            return Ok(());
        }
        if attempts >= policy.max_attempts {
            return Err(WaitError::TimedOut);
        }

        let wake = tokio::select! {
            _ = cancel.cancelled() => Wake::Cancelled,
            _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
            changed = signal_changed(signal.as_mut()) => {
                if changed { Wake::Signal } else { Wake::SignalClosed }
            }
            _ = tokio::time::sleep(policy.poll_interval) => Wake::Poll,
        };

        match wake {
            Wake::Cancelled => return Err(WaitError::Cancelled),
            Wake::Deadline => {
                return if ready() {
                    Ok(())
                } else {
                    Err(WaitError::TimedOut)
                };
            }
            Wake::Signal => {}
            // Sender gone: fall back to polling alone.
            Wake::SignalClosed => signal = None,
            Wake::Poll => attempts = attempts.saturating_add(1),
        }
    }
}

async fn signal_changed(rx: Option<&mut watch::Receiver<bool>>) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}
