// src/orchestrator.rs

//! Connect, subscribe, publish, then race for the result.
//!
//! An [`Orchestrator`] runs one attempt per call:
//!
//! 1. A [`ResolvableOutcome`] is created and the deadline is armed against it.
//! 2. A [`StageSequencer`] runs connect -> subscribe -> publish on a spawned
//!    task. The subscribe stage arms the arrival listener before it reports
//!    success, so a frame published the instant the subscription is
//!    acknowledged is never missed.
//! 3. Session-level exceptions and transport errors are routed into the
//!    outcome after the caller's own callbacks have seen them.
//!
//! Whichever of the listener, the sequencer, the session handler, or the
//! deadline completes the outcome first decides the attempt.
//!
//! # Example
//!
//! ```no_run
//! use mom_roundtrip::{create_connector, Orchestrator, Resolution, RoundtripConfig, Text};
//!
//! # async fn run() -> mom_roundtrip::Result<()> {
//! let config = RoundtripConfig::memory("demo");
//! let orchestrator = Orchestrator::new(create_connector(&config)?, config);
//!
//! let resolution = orchestrator
//!     .orchestrate(
//!         "/topic/subscribe-test",
//!         "payload-from-websocket-java-client",
//!         "completeOnTimeout".to_string(),
//!         Text,
//!     )
//!     .await?;
//!
//! if let Resolution::Received(payload) = resolution {
//!     println!("echoed: {payload}");
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    retry::retry_with_backoff,
    ArrivalListener,
    AttemptId,
    ConnectorPtr,
    Deadline,
    DeadlineGuard,
    Decode,
    Destination,
    Failure,
    FailureKind,
    Frame,
    ListenerGuard,
    Receipt,
    Resolution,
    ResolvableOutcome,
    Result,
    RoundtripConfig,
    SessionCallbacks,
    SessionHandler,
    SessionHandlerPtr,
    SessionPtr,
    StageResult,
    StageSequencer,
    SubscriptionContext,
    TimeoutGovernor,
};

/// Setup stages of an attempt, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Subscribe,
    Publish,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Connect => "connect",
            Stage::Subscribe => "subscribe",
            Stage::Publish => "publish",
        }
    }

    /// Kind reported when this stage fails.
    pub fn failure_kind(self) -> FailureKind {
        match self {
            Stage::Connect => FailureKind::Connection,
            Stage::Subscribe => FailureKind::Subscription,
            Stage::Publish => FailureKind::Publish,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// State threaded through the setup stages.
#[derive(Default)]
struct Handshake {
    session: Option<SessionPtr>,
    listener: Option<ListenerGuard>,
    receipt: Option<Receipt>,
}

impl Handshake {
    fn session(&self, stage: Stage) -> StageResult<SessionPtr> {
        self.session
            .clone()
            .ok_or_else(|| Failure::new(stage.failure_kind(), "no session established"))
    }

    async fn release(self, label: &str) {
        // ---
        if let Some(listener) = self.listener {
            listener.detach();
        }
        if let Some(session) = self.session {
            if let Err(err) = session.disconnect().await {
                log_warn!("{label}: disconnect failed: {err}");
            }
        }
    }
}

/// Forwards session notifications to the caller, then to the outcome.
struct OutcomeRouter<T> {
    label: String,
    callbacks: SessionCallbacks,
    outcome: ResolvableOutcome<T>,
}

impl<T: Send + Sync + 'static> SessionHandler for OutcomeRouter<T> {
    // ---
    fn after_connected(&self, session_id: &str) {
        self.callbacks.after_connected(session_id);
    }

    fn handle_frame(&self, frame: &Frame) {
        self.callbacks.handle_frame(frame);
    }

    fn handle_exception(&self, failure: &Failure) {
        // ---
        self.callbacks.handle_exception(failure);
        if self.outcome.complete_with_error(failure.clone()) {
            log_warn!("{}: session exception resolved the attempt: {failure}", self.label);
        }
    }

    fn handle_transport_error(&self, failure: &Failure) {
        // ---
        self.callbacks.handle_transport_error(failure);
        if self.outcome.complete_with_error(failure.clone()) {
            log_warn!("{}: transport error resolved the attempt: {failure}", self.label);
        }
    }
}

/// Runs orchestration attempts against one connector.
///
/// Cheap to share by reference; every attempt gets its own session.
pub struct Orchestrator {
    connector: ConnectorPtr,
    config: RoundtripConfig,
    callbacks: SessionCallbacks,
}

impl Orchestrator {
    // ---
    pub fn new(connector: ConnectorPtr, config: RoundtripConfig) -> Self {
        Self {
            connector,
            config,
            callbacks: SessionCallbacks::new(),
        }
    }

    /// Observe session notifications of every attempt.
    ///
    /// Callbacks run before the notification is applied to the outcome.
    pub fn with_callbacks(mut self, callbacks: SessionCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn config(&self) -> &RoundtripConfig {
        &self.config
    }

    /// Start an attempt and return without waiting for it.
    ///
    /// The deadline is `config.deadline` from now. Must be called within a
    /// Tokio runtime.
    pub fn start<T, D>(
        &self,
        destination: impl Into<Destination>,
        payload: impl Into<Bytes>,
        fallback: T,
        decoder: D,
    ) -> Orchestration<T>
    where
        T: Send + Sync + 'static,
        D: Decode<T>,
    {
        self.launch(
            destination.into(),
            payload.into(),
            Deadline::after(self.config.deadline, fallback),
            Arc::new(decoder),
        )
    }

    /// Run one attempt and wait for its resolution.
    ///
    /// Resolves to [`Resolution::Received`] with the decoded payload,
    /// [`Resolution::TimedOut`] with `fallback` once `config.deadline`
    /// passes, or [`Resolution::Failed`] with the first failure.
    ///
    /// # Errors
    ///
    /// Returns [`RoundtripError::WaitTimeout`](crate::RoundtripError::WaitTimeout)
    /// only when nothing resolved the attempt within `config.wait_timeout`.
    pub async fn orchestrate<T, D>(
        &self,
        destination: impl Into<Destination>,
        payload: impl Into<Bytes>,
        fallback: T,
        decoder: D,
    ) -> Result<Resolution<T>>
    where
        T: Clone + Send + Sync + 'static,
        D: Decode<T>,
    {
        self.orchestrate_with_deadline(destination, payload, self.config.deadline, fallback, decoder)
            .await
    }

    /// Like [`orchestrate`](Self::orchestrate) with a per-call deadline.
    pub async fn orchestrate_with_deadline<T, D>(
        &self,
        destination: impl Into<Destination>,
        payload: impl Into<Bytes>,
        deadline: Duration,
        fallback: T,
        decoder: D,
    ) -> Result<Resolution<T>>
    where
        T: Clone + Send + Sync + 'static,
        D: Decode<T>,
    {
        let attempt = self.launch(
            destination.into(),
            payload.into(),
            Deadline::after(deadline, fallback),
            Arc::new(decoder),
        );
        self.finish(attempt).await
    }

    /// Run fresh attempts with backoff while they fail for a retryable
    /// reason.
    ///
    /// Uses `config.retry_config`; without one this is a single attempt.
    /// Received payloads, fallbacks, non-retryable failures and wait
    /// timeouts are returned as they are.
    pub async fn orchestrate_with_retry<T, D>(
        &self,
        destination: impl Into<Destination>,
        payload: impl Into<Bytes>,
        fallback: T,
        decoder: D,
    ) -> Result<Resolution<T>>
    where
        T: Clone + Send + Sync + 'static,
        D: Decode<T>,
    {
        // ---
        let destination = destination.into();
        let payload = payload.into();
        let decoder: Arc<dyn Decode<T>> = Arc::new(decoder);

        retry_with_backoff(self.config.retry_config.as_ref(), || {
            let attempt = self.launch(
                destination.clone(),
                payload.clone(),
                Deadline::after(self.config.deadline, fallback.clone()),
                decoder.clone(),
            );
            self.finish(attempt)
        })
        .await
    }

    async fn finish<T>(&self, attempt: Orchestration<T>) -> Result<Resolution<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        // ---
        let result = attempt.wait(self.config.wait_timeout).await;

        match &result {
            Ok(resolution) => log_debug!("{}: resolved {}", attempt.label, resolution_name(resolution)),
            Err(err) => log_warn!("{}: {err}", attempt.label),
        }

        attempt.detach().await;
        result
    }

    fn launch<T>(
        &self,
        destination: Destination,
        payload: Bytes,
        deadline: Deadline<T>,
        decoder: Arc<dyn Decode<T>>,
    ) -> Orchestration<T>
    where
        T: Send + Sync + 'static,
    {
        // ---
        let attempt_id = AttemptId::generate();
        let label = format!("{}/{attempt_id}", self.config.client_id);
        let outcome = ResolvableOutcome::new();

        log_info!(
            "{label}: starting attempt on {} for {destination}",
            self.config.endpoint
        );

        // Armed first so a stalled connect still resolves at the deadline.
        let deadline = TimeoutGovernor::arm_deadline(label.clone(), &outcome, deadline);

        let handler: SessionHandlerPtr = Arc::new(OutcomeRouter {
            label: label.clone(),
            callbacks: self.callbacks.clone(),
            outcome: outcome.clone(),
        });

        let connector = self.connector.clone();
        let endpoint = self.config.endpoint.clone();
        let subscribe_to = destination.clone();
        let listener_outcome = outcome.clone();
        let listener_label = label.clone();

        let sequencer = StageSequencer::new(label.clone())
            .stage(
                Stage::Connect.name(),
                Stage::Connect.failure_kind(),
                move |mut hs: Handshake| async move {
                    hs.session = Some(connector.connect(&endpoint, handler).await?);
                    Ok::<_, Failure>(hs)
                },
            )
            .stage(
                Stage::Subscribe.name(),
                Stage::Subscribe.failure_kind(),
                move |mut hs: Handshake| async move {
                    let session = hs.session(Stage::Subscribe)?;
                    let handle = session.subscribe(&subscribe_to).await?;

                    let context = SubscriptionContext::new(subscribe_to, decoder, listener_outcome);
                    hs.listener = Some(ArrivalListener::arm(listener_label, context, handle));
                    Ok::<_, Failure>(hs)
                },
            )
            .stage(
                Stage::Publish.name(),
                Stage::Publish.failure_kind(),
                move |mut hs: Handshake| async move {
                    let session = hs.session(Stage::Publish)?;
                    hs.receipt = Some(session.send(&destination, payload).await?);
                    Ok::<_, Failure>(hs)
                },
            );

        let task_outcome = outcome.clone();
        let task_label = label.clone();
        let sequencer = tokio::spawn(async move {
            let handshake = sequencer.run(Handshake::default(), &task_outcome).await;
            if let Some(receipt) = handshake.as_ref().and_then(|hs| hs.receipt.as_ref()) {
                log_debug!("{task_label}: handshake complete, receipt {}", receipt.id);
            }
            handshake
        });

        Orchestration {
            attempt_id,
            label,
            outcome,
            deadline: Some(deadline),
            sequencer: Some(sequencer),
        }
    }
}

fn resolution_name<T>(resolution: &Resolution<T>) -> &'static str {
    match resolution {
        Resolution::Received(_) => "received",
        Resolution::TimedOut(_) => "timed out with fallback",
        Resolution::Failed(_) => "failed",
    }
}

/// One in-flight attempt.
///
/// A successful handshake keeps its session and listener parked in the
/// sequencer task's output until [`detach`](Self::detach). Dropping the
/// orchestration cancels the deadline and any unfinished setup stage
/// without disconnecting gracefully.
pub struct Orchestration<T> {
    attempt_id: AttemptId,
    label: String,
    outcome: ResolvableOutcome<T>,
    deadline: Option<DeadlineGuard>,
    sequencer: Option<JoinHandle<Option<Handshake>>>,
}

impl<T> Orchestration<T> {
    pub fn attempt_id(&self) -> &AttemptId {
        &self.attempt_id
    }

    /// The shared outcome. Clones observe the same resolution.
    pub fn outcome(&self) -> &ResolvableOutcome<T> {
        &self.outcome
    }

    /// Wait up to `timeout` for the attempt to resolve.
    pub async fn wait(&self, timeout: Duration) -> Result<Resolution<T>>
    where
        T: Clone,
    {
        self.outcome.wait(timeout).await
    }

    /// Tear the attempt down.
    ///
    /// Disarms the deadline, cancels setup if it is still running, stops the
    /// listener (which unsubscribes) and disconnects the session. The
    /// outcome keeps whatever state it reached.
    pub async fn detach(mut self) {
        // ---
        if let Some(deadline) = self.deadline.take() {
            deadline.disarm();
        }

        let Some(task) = self.sequencer.take() else {
            return;
        };

        if !task.is_finished() {
            log_debug!("{}: cancelling unfinished setup", self.label);
            task.abort();
        }

        match task.await {
            Ok(Some(handshake)) => handshake.release(&self.label).await,
            Ok(None) => {}
            Err(err) if err.is_cancelled() => {}
            Err(err) => log_error!("{}: setup task ended abnormally: {err}", self.label),
        }

        log_debug!("{}: detached", self.label);
    }
}

impl<T> Drop for Orchestration<T> {
    fn drop(&mut self) {
        if let Some(task) = self.sequencer.take() {
            task.abort();
        }
    }
}

impl<T> fmt::Debug for Orchestration<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestration")
            .field("attempt_id", &self.attempt_id)
            .field("resolved", &self.outcome.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{create_memory_connector_with_broker, MemoryBroker, RoundtripError, Text};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DESTINATION: &str = "/topic/subscribe-test";
    const PAYLOAD: &str = "payload-from-websocket-java-client";
    const FALLBACK: &str = "completeOnTimeout";

    fn orchestrator(broker: &Arc<MemoryBroker>) -> Orchestrator {
        Orchestrator::new(
            create_memory_connector_with_broker(broker.clone()),
            RoundtripConfig::memory("test"),
        )
    }

    #[test]
    fn stages_map_to_failure_kinds() {
        // ---
        assert_eq!(Stage::Connect.failure_kind(), FailureKind::Connection);
        assert_eq!(Stage::Subscribe.failure_kind(), FailureKind::Subscription);
        assert_eq!(Stage::Publish.failure_kind(), FailureKind::Publish);
        assert_eq!(Stage::Subscribe.to_string(), "subscribe");
    }

    #[tokio::test(start_paused = true)]
    async fn echo_resolves_with_received_payload() {
        // ---
        let broker = MemoryBroker::new();
        let resolution = orchestrator(&broker)
            .orchestrate(DESTINATION, PAYLOAD, FALLBACK.to_string(), Text)
            .await
            .unwrap();

        assert_eq!(resolution, Resolution::Received(PAYLOAD.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn connection_refusal_fails_the_attempt() {
        // ---
        let broker = MemoryBroker::new();
        broker.refuse_connections("connection refused");

        let resolution = orchestrator(&broker)
            .orchestrate(DESTINATION, PAYLOAD, FALLBACK.to_string(), Text)
            .await
            .unwrap();

        assert_eq!(
            resolution,
            Resolution::Failed(Failure::connection("connection refused"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_connect_resolves_at_the_deadline() {
        // ---
        let broker = MemoryBroker::new();
        broker.delay_connections(Duration::from_secs(10));

        let attempt = orchestrator(&broker).start(DESTINATION, PAYLOAD, FALLBACK.to_string(), Text);
        let resolution = attempt.wait(Duration::from_secs(30)).await.unwrap();

        assert_eq!(resolution, Resolution::TimedOut(FALLBACK.to_string()));

        attempt.detach().await;
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_exception_resolves_after_callbacks_run() {
        // ---
        let broker = MemoryBroker::new();
        broker.mute(DESTINATION);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let orchestrator = orchestrator(&broker).with_callbacks(
            SessionCallbacks::new().on_exception(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let attempt = orchestrator.start(DESTINATION, PAYLOAD, FALLBACK.to_string(), Text);
        tokio::time::sleep(Duration::from_millis(10)).await;

        broker.raise_exception(Failure::publish("ERROR frame: malformed"));

        let resolution = attempt.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            resolution,
            Resolution::Failed(Failure::publish("ERROR frame: malformed"))
        );
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        attempt.detach().await;
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_is_not_the_fallback() {
        // ---
        let broker = MemoryBroker::new();
        broker.mute(DESTINATION);

        let orchestrator = Orchestrator::new(
            create_memory_connector_with_broker(broker.clone()),
            RoundtripConfig::memory("test").with_wait_timeout(Duration::from_millis(500)),
        );

        let err = orchestrator
            .orchestrate(DESTINATION, PAYLOAD, FALLBACK.to_string(), Text)
            .await
            .unwrap_err();

        assert!(matches!(err, RoundtripError::WaitTimeout(d) if d == Duration::from_millis(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn detach_releases_session_and_subscription() {
        // ---
        let broker = MemoryBroker::new();
        broker.mute(DESTINATION);

        let attempt = orchestrator(&broker).start(DESTINATION, PAYLOAD, FALLBACK.to_string(), Text);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(broker.session_count(), 1);
        assert_eq!(broker.subscriber_count(DESTINATION), 1);
        assert!(!attempt.outcome().is_resolved());

        attempt.detach().await;

        assert_eq!(broker.session_count(), 0);
        assert_eq!(broker.subscriber_count(DESTINATION), 0);
    }
}
