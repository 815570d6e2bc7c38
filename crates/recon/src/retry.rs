//! Timeout + bounded retry around calls to external collaborators.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{DeliveryError, SourceError};

/// Cooperative cancellation flag shared between the caller and a run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Errors that can come out of a retried call.
pub trait RetryError: Send + 'static {
    /// The error reported when an attempt exceeds its timeout.
    fn timed_out(target: &str, secs: u64) -> Self;
    /// Whether another attempt could succeed.
    fn is_transient(&self) -> bool;
}

impl RetryError for SourceError {
    fn timed_out(_target: &str, secs: u64) -> Self {
        SourceError::Timeout { secs }
    }

    fn is_transient(&self) -> bool {
        // An empty or missing extract is an answer, not a glitch.
        !matches!(self, SourceError::Unavailable(_))
    }
}

impl RetryError for DeliveryError {
    fn timed_out(target: &str, secs: u64) -> Self {
        DeliveryError::Timeout {
            target: target.to_string(),
            secs,
        }
    }

    fn is_transient(&self) -> bool {
        true
    }
}

/// Run `op` up to `policy.attempts` times.
///
/// Each attempt runs on a helper thread and is abandoned once
/// `policy.timeout_secs` elapses; an abandoned attempt keeps running in the
/// background but its result is discarded. Backoff starts at
/// `initial_backoff_ms` and doubles after every failed attempt. Permanent
/// errors return immediately, as does a cancelled token between attempts.
pub fn call_with_retry<T, E>(
    target: &str,
    policy: &RetryConfig,
    cancel: &CancelToken,
    op: Arc<dyn Fn() -> Result<T, E> + Send + Sync>,
) -> Result<T, E>
where
    T: Send + 'static,
    E: RetryError,
{
    let attempts = policy.attempts.max(1);
    let mut backoff = policy.initial_backoff();

    for attempt in 1..=attempts {
        let (tx, rx) = mpsc::channel();
        let call = Arc::clone(&op);
        thread::spawn(move || {
            // Receiver may have given up already; nothing to do then.
            let _ = tx.send(call());
        });

        let err = match rx.recv_timeout(policy.timeout()) {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!(target_name = target, attempt, "call succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(e)) => e,
            Err(_) => E::timed_out(target, policy.timeout_secs),
        };

        if !err.is_transient() || attempt == attempts || cancel.is_cancelled() {
            return Err(err);
        }

        warn!(
            target_name = target,
            attempt,
            max_attempts = attempts,
            backoff_ms = backoff.as_millis() as u64,
            "call failed, retrying"
        );
        thread::sleep(backoff);
        backoff *= 2;
    }

    // attempts >= 1 so the loop always returns
    Err(E::timed_out(target, policy.timeout_secs))
}
