// src/listener.rs

//! Arrival listener.
//!
//! Completes the shared outcome with the decoded payload of the first
//! matching frame delivered to a subscription.
//!
//! The listener keeps draining and decoding frames after the outcome has
//! resolved (brokers may redeliver), so the transport never blocks on a
//! full inbox. Those late completion attempts simply lose. The receive loop
//! only stops when the guard is detached or the subscription closes.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

use crate::{
    // ---
    log_debug,
    Destination,
    Failure,
    Frame,
    ResolvableOutcome,
    Result,
    RoundtripError,
    SubscriptionHandle,
};

/// Payload decoding rule supplied by the caller.
///
/// Any `Fn(&Frame) -> Result<T>` closure is a decoder.
pub trait Decode<T>: Send + Sync + 'static {
    fn decode(&self, frame: &Frame) -> Result<T>;
}

impl<T, F> Decode<T> for F
where
    F: Fn(&Frame) -> Result<T> + Send + Sync + 'static,
{
    fn decode(&self, frame: &Frame) -> Result<T> {
        self(frame)
    }
}

/// Decodes the payload as UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct Text;

impl Decode<String> for Text {
    fn decode(&self, frame: &Frame) -> Result<String> {
        String::from_utf8(frame.payload.to_vec())
            .map_err(|e| RoundtripError::InvalidPayload(e.to_string()))
    }
}

/// Hands the payload bytes over untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Raw;

impl Decode<Bytes> for Raw {
    fn decode(&self, frame: &Frame) -> Result<Bytes> {
        Ok(frame.payload.clone())
    }
}

/// Deserializes the payload as JSON.
pub struct Json<T>(PhantomData<fn() -> T>);

impl<T> Json<T> {
    pub fn new() -> Self {
        Json(PhantomData)
    }
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Json<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Decode<T> for Json<T>
where
    T: DeserializeOwned + 'static,
{
    fn decode(&self, frame: &Frame) -> Result<T> {
        Ok(serde_json::from_slice(&frame.payload)?)
    }
}

/// What a listener needs to complete an outcome on arrival.
pub struct SubscriptionContext<T> {
    destination: Destination,
    decoder: Arc<dyn Decode<T>>,
    outcome: ResolvableOutcome<T>,
}

impl<T> SubscriptionContext<T> {
    pub fn new(
        destination: Destination,
        decoder: Arc<dyn Decode<T>>,
        outcome: ResolvableOutcome<T>,
    ) -> Self {
        Self {
            destination,
            decoder,
            outcome,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }
}

/// Decodes frames for one subscription and offers them to the outcome.
pub struct ArrivalListener<T> {
    label: String,
    context: SubscriptionContext<T>,
}

impl<T: Send + Sync + 'static> ArrivalListener<T> {
    // ---
    /// Create a listener. `label` prefixes its log lines.
    pub fn new(label: impl Into<String>, context: SubscriptionContext<T>) -> Self {
        Self {
            label: label.into(),
            context,
        }
    }

    /// Create a listener and start it on `handle` in one step.
    pub fn arm(
        label: impl Into<String>,
        context: SubscriptionContext<T>,
        handle: SubscriptionHandle,
    ) -> ListenerGuard {
        Self::new(label, context).spawn(handle)
    }

    /// Handle one inbound frame.
    ///
    /// Returns `true` if this frame resolved the outcome.
    pub fn on_frame(&self, frame: &Frame) -> bool {
        // ---
        let label = &self.label;
        let ctx = &self.context;

        if frame.destination != ctx.destination {
            log_debug!(
                "{label}: ignoring frame for {} on subscription {}",
                frame.destination,
                ctx.destination
            );
            return false;
        }

        let won = match ctx.decoder.decode(frame) {
            Ok(value) => ctx.outcome.complete(value),
            Err(err) => ctx.outcome.complete_with_error(Failure::decode(err.to_string())),
        };

        if won {
            log_debug!("{label}: frame on {} resolved the outcome", ctx.destination);
        } else {
            log_debug!("{label}: late frame on {} discarded", ctx.destination);
        }
        won
    }

    /// Spawn the receive loop over a subscription's inbox.
    ///
    /// The subscription stays open until the returned guard is detached or
    /// dropped.
    pub fn spawn(self, handle: SubscriptionHandle) -> ListenerGuard {
        // ---
        let destination = self.context.destination.clone();
        let mut inbox = handle.inbox;

        let task = tokio::spawn(async move {
            while let Some(frame) = inbox.recv().await {
                self.on_frame(&frame);
            }
            log_debug!(
                "{}: subscription to {} closed",
                self.label,
                self.context.destination
            );
        });

        ListenerGuard {
            destination,
            task: Some(task),
        }
    }
}

/// Owns a running receive loop.
///
/// Detaching or dropping the guard stops the loop and releases the
/// subscription.
pub struct ListenerGuard {
    destination: Destination,
    task: Option<JoinHandle<()>>,
}

impl ListenerGuard {
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Whether the receive loop has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop listening and unsubscribe.
    pub fn detach(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            log_debug!("detaching listener from {}", self.destination);
            task.abort();
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{FailureKind, Headers, Resolution};
    use serde::Deserialize;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn frame(destination: &str, payload: &'static [u8]) -> Frame {
        Frame::new(
            Destination::from(destination),
            Headers::new().with(Headers::DESTINATION, destination),
            Bytes::from_static(payload),
        )
    }

    fn listener<T: Send + Sync + 'static>(
        destination: &str,
        decoder: impl Decode<T>,
    ) -> (ArrivalListener<T>, ResolvableOutcome<T>) {
        let outcome = ResolvableOutcome::new();
        let context =
            SubscriptionContext::new(Destination::from(destination), Arc::new(decoder), outcome.clone());
        (ArrivalListener::new("test", context), outcome)
    }

    #[test]
    fn matching_frame_resolves_with_decoded_text() {
        // ---
        let (listener, outcome) = listener("/topic/t", Text);

        assert!(listener.on_frame(&frame("/topic/t", b"payload-from-websocket-java-client")));
        assert_eq!(
            outcome.peek(),
            Some(&Resolution::Received(
                "payload-from-websocket-java-client".to_string()
            ))
        );
    }

    #[test]
    fn other_destinations_are_ignored() {
        // ---
        let (listener, outcome) = listener("/topic/t", Text);

        assert!(!listener.on_frame(&frame("/topic/other", b"x")));
        assert!(!outcome.is_resolved());
    }

    #[test]
    fn undecodable_frame_fails_with_decode_kind() {
        // ---
        let (listener, outcome) = listener("/topic/t", Text);

        assert!(listener.on_frame(&frame("/topic/t", b"\xff\xfe")));

        let failure = outcome.peek().and_then(Resolution::failure).expect("failed");
        assert_eq!(failure.kind(), FailureKind::Decode);
    }

    #[test]
    fn late_frame_is_decoded_but_discarded() {
        // ---
        let (listener, outcome) = listener("/topic/t", Text);

        assert!(listener.on_frame(&frame("/topic/t", b"first")));
        assert!(!listener.on_frame(&frame("/topic/t", b"redelivered")));
        assert!(!listener.on_frame(&frame("/topic/t", b"\xff")));

        assert_eq!(
            outcome.peek(),
            Some(&Resolution::Received("first".to_string()))
        );
    }

    #[test]
    fn json_and_closure_decoders() {
        // ---
        #[derive(Debug, Deserialize, PartialEq)]
        struct Greeting {
            content: String,
        }

        let (json, outcome) = listener("/topic/greetings", Json::<Greeting>::new());
        assert!(json.on_frame(&frame("/topic/greetings", br#"{"content":"Hello, World!"}"#)));
        assert_eq!(
            outcome.peek().and_then(Resolution::value),
            Some(&Greeting {
                content: "Hello, World!".into()
            })
        );

        let (len, outcome) = listener("/topic/t", |f: &Frame| -> Result<usize> {
            Ok(f.payload.len())
        });
        assert!(len.on_frame(&frame("/topic/t", b"four")));
        assert_eq!(outcome.peek(), Some(&Resolution::Received(4)));
    }

    #[tokio::test]
    async fn receive_loop_keeps_draining_after_resolution() {
        // ---
        let (listener, outcome) = listener("/topic/t", Raw);
        let (tx, rx) = mpsc::channel(1);

        let guard = listener.spawn(SubscriptionHandle {
            destination: Destination::from("/topic/t"),
            inbox: rx,
        });

        // With capacity 1 these sends only complete if the loop keeps reading.
        for payload in [&b"one"[..], b"two", b"three", b"four"] {
            timeout(
                Duration::from_secs(1),
                tx.send(Frame::new(
                    Destination::from("/topic/t"),
                    Headers::new(),
                    Bytes::copy_from_slice(payload),
                )),
            )
            .await
            .expect("listener stopped draining")
            .expect("inbox closed");
        }

        let resolution = outcome.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(resolution, Resolution::Received(Bytes::from_static(b"one")));
        assert!(!guard.is_finished());
    }

    #[tokio::test]
    async fn detach_releases_the_subscription() {
        // ---
        let (listener, _outcome) = listener("/topic/t", Text);
        let (tx, rx) = mpsc::channel(4);

        let guard = listener.spawn(SubscriptionHandle {
            destination: Destination::from("/topic/t"),
            inbox: rx,
        });
        assert_eq!(guard.destination().as_str(), "/topic/t");

        guard.detach();

        timeout(Duration::from_secs(1), tx.closed())
            .await
            .expect("inbox still open after detach");
    }
}
