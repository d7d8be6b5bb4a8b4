// src/governor.rs

//! Deadline enforcement.
//!
//! The timeout governor is the third writer racing for an outcome. It
//! resolves the outcome with a fallback value when nothing else has by the
//! deadline. A late firing would be a no-op anyway; the timer task still
//! exits as soon as the outcome resolves so it does not outlive the attempt.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::{
    // ---
    log_debug,
    log_info,
    ResolvableOutcome,
};

/// Absolute expiry plus the value to resolve with at expiry.
#[derive(Debug, Clone)]
pub struct Deadline<T> {
    pub expires_at: Instant,
    pub fallback: T,
}

impl<T> Deadline<T> {
    /// A deadline `after` from now.
    pub fn after(after: Duration, fallback: T) -> Self {
        Self {
            expires_at: Instant::now() + after,
            fallback,
        }
    }
}

/// Arms one-shot deadlines against outcomes.
pub struct TimeoutGovernor;

impl TimeoutGovernor {
    /// Arm a deadline `after` from now.
    pub fn arm<T>(
        label: impl Into<String>,
        outcome: &ResolvableOutcome<T>,
        after: Duration,
        fallback: T,
    ) -> DeadlineGuard
    where
        T: Send + Sync + 'static,
    {
        Self::arm_deadline(label, outcome, Deadline::after(after, fallback))
    }

    /// Arm an explicit deadline.
    ///
    /// The timer completes the outcome with the fallback if it is still
    /// unresolved at expiry, and exits early if the outcome resolves first.
    pub fn arm_deadline<T>(
        label: impl Into<String>,
        outcome: &ResolvableOutcome<T>,
        deadline: Deadline<T>,
    ) -> DeadlineGuard
    where
        T: Send + Sync + 'static,
    {
        // ---
        let label = label.into();
        let outcome = outcome.clone();
        let Deadline {
            expires_at,
            fallback,
        } = deadline;

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep_until(expires_at) => {
                    if outcome.complete_with_default_if_unresolved(fallback) {
                        log_info!("{label}: deadline expired, resolved with fallback");
                    } else {
                        log_debug!("{label}: deadline expired after resolution");
                    }
                }
                _ = outcome.resolved() => {
                    log_debug!("{label}: deadline disarmed by resolution");
                }
            }
        });

        DeadlineGuard {
            expires_at,
            task: Some(task),
        }
    }
}

/// Owns an armed deadline timer.
///
/// Disarming or dropping the guard cancels the timer.
pub struct DeadlineGuard {
    expires_at: Instant,
    task: Option<JoinHandle<()>>,
}

impl DeadlineGuard {
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Whether the timer task has exited (fired or disarmed by resolution).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Cancel the timer.
    pub fn disarm(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}
