// src/sequencer.rs

//! Ordered asynchronous setup stages.
//!
//! A [`StageSequencer`] runs its stages strictly one after another: a stage
//! starts only once the previous stage's future has completed, and its
//! output state is handed to the next stage. The first failure is routed
//! into the shared [`ResolvableOutcome`] and nothing after it runs.
//!
//! The sequencer answers "did setup succeed". It never completes the
//! outcome with a value; that belongs to whoever observes the real result.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::{
    // ---
    log_debug,
    log_warn,
    Failure,
    FailureKind,
    ResolvableOutcome,
    StageResult,
};

type BoxedStage<S> = Box<dyn FnOnce(S) -> BoxFuture<'static, StageResult<S>> + Send>;

struct Stage<S> {
    name: &'static str,
    kind: FailureKind,
    run: BoxedStage<S>,
}

/// Ordered list of asynchronous stages threading a state value `S`.
pub struct StageSequencer<S> {
    label: String,
    stages: Vec<Stage<S>>,
}

impl<S: Send + 'static> StageSequencer<S> {
    // ---
    /// Create an empty sequencer. `label` prefixes its log lines.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            stages: Vec::new(),
        }
    }

    /// Append a stage.
    ///
    /// `kind` classifies a panic raised by the stage, whether while building
    /// its future or while polling it.
    pub fn stage<F, Fut>(mut self, name: &'static str, kind: FailureKind, f: F) -> Self
    where
        F: FnOnce(S) -> Fut + Send + 'static,
        Fut: Future<Output = StageResult<S>> + Send + 'static,
    {
        self.stages.push(Stage {
            name,
            kind,
            run: Box::new(move |state| f(state).boxed()),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage in order.
    ///
    /// Returns the final state if all stages succeeded. Returns `None` if a
    /// stage failed (the failure is offered to `outcome`) or if `outcome`
    /// was already resolved by another writer before a stage could start.
    pub async fn run<T>(self, initial: S, outcome: &ResolvableOutcome<T>) -> Option<S> {
        // ---
        let label = self.label;
        let mut state = initial;

        for Stage { name, kind, run } in self.stages {
            if outcome.is_resolved() {
                log_debug!("{label}: outcome resolved before stage {name}, skipping the rest");
                return None;
            }

            log_debug!("{label}: stage {name} started");

            // Building the future happens inside the guarded block, so a
            // panic there is caught the same way as one while polling.
            let result = AssertUnwindSafe(async move { run(state).await })
                .catch_unwind()
                .await;

            let failure = match result {
                Ok(Ok(next)) => {
                    log_debug!("{label}: stage {name} succeeded");
                    state = next;
                    continue;
                }
                Ok(Err(failure)) => failure,
                Err(panic) => Failure::new(
                    kind,
                    format!("stage {name} panicked: {}", panic_message(panic.as_ref())),
                ),
            };

            log_warn!("{label}: stage {name} failed: {failure}");

            if !outcome.complete_with_error(failure) {
                log_debug!("{label}: stage {name} failure lost the race");
            }
            return None;
        }

        Some(state)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
