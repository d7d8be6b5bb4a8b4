// src/outcome.rs

//! Single-assignment outcome cell.
//!
//! A [`ResolvableOutcome`] is the one synchronization point shared by the
//! three writers of an orchestration attempt: the stage sequencer (failures),
//! the arrival listener (payloads and decode failures) and the timeout
//! governor (fallback). They race from independent execution contexts, and
//! the first completion attempt wins. Every later attempt returns `false`
//! and leaves the state alone.
//!
//! # State machine
//!
//! The cell carries an atomic tag that moves `UNRESOLVED -> CLAIMED ->
//! SETTLED`. Only the writer whose compare-and-set moves the tag out of
//! `UNRESOLVED` may store a value; it then publishes the value, flips the
//! tag to `SETTLED` and wakes every waiter. No lock is taken on the
//! completion path apart from draining registered continuations.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time;

use crate::{
    // ---
    log_debug,
    Failure,
    Result,
    RoundtripError,
};

const UNRESOLVED: u8 = 0;
const CLAIMED: u8 = 1;
const SETTLED: u8 = 2;

/// Final state of a resolved outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    // ---
    /// A matching frame arrived and decoded.
    Received(T),

    /// The deadline expired first; holds the caller's fallback value.
    TimedOut(T),

    /// A stage, the transport, or decoding failed first.
    Failed(Failure),
}

impl<T> Resolution<T> {
    pub fn is_received(&self) -> bool {
        matches!(self, Resolution::Received(_))
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Resolution::TimedOut(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Resolution::Failed(_))
    }

    /// The received payload or the fallback value.
    pub fn value(&self) -> Option<&T> {
        match self {
            Resolution::Received(v) | Resolution::TimedOut(v) => Some(v),
            Resolution::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Resolution::Failed(f) => Some(f),
            _ => None,
        }
    }

    /// Collapse into a `Result`, treating the fallback value as success.
    pub fn into_result(self) -> Result<T> {
        match self {
            Resolution::Received(v) | Resolution::TimedOut(v) => Ok(v),
            Resolution::Failed(f) => Err(RoundtripError::Failed(f)),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Resolution::Received(_) => "received",
            Resolution::TimedOut(_) => "timed out",
            Resolution::Failed(_) => "failed",
        }
    }
}

type Continuation<T> = Box<dyn FnOnce(&Resolution<T>) + Send>;

/// Acquire a mutex guard, ignoring poisoning.
///
/// The continuation list has no invariants a panicking continuation could
/// break; the worst case is a continuation that never runs.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Single-assignment result cell completed at most once.
///
/// Cheap to clone (internally `Arc`-backed); clones observe and complete the
/// same cell.
pub struct ResolvableOutcome<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: AtomicU8,
    slot: OnceLock<Resolution<T>>,
    notify: Notify,
    continuations: Mutex<Vec<Continuation<T>>>,
}

impl<T> Clone for ResolvableOutcome<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for ResolvableOutcome<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResolvableOutcome<T> {
    // ---
    /// Create an unresolved outcome.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(UNRESOLVED),
                slot: OnceLock::new(),
                notify: Notify::new(),
                continuations: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Resolve with a received payload.
    ///
    /// Returns `true` iff this call performed the transition.
    pub fn complete(&self, value: T) -> bool {
        self.settle(Resolution::Received(value))
    }

    /// Resolve with a failure.
    ///
    /// Returns `true` iff this call performed the transition.
    pub fn complete_with_error(&self, failure: Failure) -> bool {
        self.settle(Resolution::Failed(failure))
    }

    /// Resolve with the fallback value, unless something else already won.
    ///
    /// Same single-assignment attempt as [`complete`](Self::complete); only
    /// the resulting [`Resolution::TimedOut`] differs. Used by the timeout
    /// governor.
    pub fn complete_with_default_if_unresolved(&self, value: T) -> bool {
        self.settle(Resolution::TimedOut(value))
    }

    /// Whether a completion attempt has already won.
    ///
    /// Can be `true` a moment before [`peek`](Self::peek) returns the value,
    /// while the winner is still publishing it.
    pub fn is_resolved(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != UNRESOLVED
    }

    /// The final state, if published.
    pub fn peek(&self) -> Option<&Resolution<T>> {
        self.inner.slot.get()
    }

    /// Wait for the final state with no limit.
    pub async fn resolved(&self) -> &Resolution<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);

            // Register before checking so a settle in between is not missed.
            notified.as_mut().enable();

            if let Some(resolution) = self.inner.slot.get() {
                return resolution;
            }
            notified.await;
        }
    }

    /// Wait up to `timeout` for the final state.
    ///
    /// # Errors
    ///
    /// Returns [`RoundtripError::WaitTimeout`] when the caller's patience
    /// runs out first. This says nothing about the attempt itself, which may
    /// still resolve later.
    pub async fn wait(&self, timeout: Duration) -> Result<Resolution<T>>
    where
        T: Clone,
    {
        match time::timeout(timeout, self.resolved()).await {
            Ok(resolution) => Ok(resolution.clone()),
            Err(_) => Err(RoundtripError::WaitTimeout(timeout)),
        }
    }

    /// Register a continuation that runs once with the final state.
    ///
    /// Runs immediately on the calling thread if the outcome is already
    /// settled, otherwise on the thread of the winning writer.
    pub fn on_resolution(&self, f: impl FnOnce(&Resolution<T>) + Send + 'static) {
        let mut pending = lock_ignore_poison(&self.inner.continuations);

        if self.inner.state.load(Ordering::Acquire) != SETTLED {
            pending.push(Box::new(f));
            return;
        }
        drop(pending);

        if let Some(resolution) = self.inner.slot.get() {
            f(resolution);
        }
    }

    fn settle(&self, resolution: Resolution<T>) -> bool {
        // ---
        let claimed = self
            .inner
            .state
            .compare_exchange(UNRESOLVED, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if !claimed {
            log_debug!(
                "completion ({}) discarded, outcome already resolved",
                resolution.label()
            );
            return false;
        }

        // Only the claimer gets here, so the slot is still empty.
        let _ = self.inner.slot.set(resolution);
        self.inner.state.store(SETTLED, Ordering::Release);
        self.inner.notify.notify_waiters();

        let pending = std::mem::take(&mut *lock_ignore_poison(&self.inner.continuations));
        if let Some(resolution) = self.inner.slot.get() {
            for continuation in pending {
                continuation(resolution);
            }
        }

        true
    }
}

impl<T: fmt::Debug> fmt::Debug for ResolvableOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvableOutcome")
            .field("resolution", &self.peek())
            .finish()
    }
}
