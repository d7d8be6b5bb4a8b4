// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the domain-level interface the orchestration core
//! consumes from a message-oriented transport: establishing a session,
//! subscribing to a destination, sending a payload, and reporting errors
//! that happen outside of any single call. It intentionally avoids any
//! reference to concrete protocols, brokers, or client libraries.
//!
//! The transport layer is responsible only for session mechanics and frame
//! delivery. Single-resolution semantics, deadlines and payload decoding are
//! handled elsewhere.
//!
//! Concrete implementations of this interface live under `src/transport/`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    Failure,
    Result,
};

/// Outcome of one transport call made by a sequencing stage.
pub type StageResult<T> = std::result::Result<T, Failure>;

/// Where to connect.
///
/// The interpretation is transport-specific (`memory://`, a broker URL, ...).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Endpoint(pub Arc<str>);

impl Endpoint {
    /// The scheme part of the endpoint (`"memory"` for `memory://local`).
    pub fn scheme(&self) -> Option<&str> {
        self.0.split_once("://").map(|(scheme, _)| scheme)
    }
}

impl<T> From<T> for Endpoint
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        Endpoint(value.into())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A destination that frames can be sent to and subscribed on.
///
/// Destinations are immutable, cheap to clone, and safe to share across
/// threads. The domain layer makes no assumptions about their syntax.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination(pub Arc<str>);

impl Destination {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Destination
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        Destination(value.into())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Frame header map.
///
/// Ordered so that logged frames read the same way every time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<Arc<str>, Arc<str>>);

impl Headers {
    pub const DESTINATION: &'static str = "destination";
    pub const MESSAGE_ID: &'static str = "message-id";
    pub const CONTENT_TYPE: &'static str = "content-type";

    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<Arc<str>>, value: impl Into<Arc<str>>) {
        self.0.insert(name.into(), value.into());
    }

    /// Builder-style variant of [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<Arc<str>>, value: impl Into<Arc<str>>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|v| &**v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One inbound message delivered to a subscription.
#[derive(Clone, Debug)]
pub struct Frame {
    // ---
    /// Destination the frame was published to.
    pub destination: Destination,

    /// Transport-supplied headers.
    pub headers: Headers,

    /// Undecoded payload bytes.
    pub payload: Bytes,
}

impl Frame {
    pub fn new(destination: Destination, headers: Headers, payload: Bytes) -> Self {
        Self {
            destination,
            headers,
            payload,
        }
    }
}

/// Acknowledgement of a successful send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub id: Arc<str>,
}

/// Handle returned from a successful subscription.
///
/// The subscription remains active until either:
/// - The handle is dropped (receiver channel closes)
/// - The session is disconnected
///
/// Dropping the handle unsubscribes from the destination.
pub struct SubscriptionHandle {
    // ---
    /// Destination this handle was subscribed to.
    pub destination: Destination,

    /// Receiver channel for delivered frames.
    pub inbox: mpsc::Receiver<Frame>,
}

/// Capability interface for session-level notifications.
///
/// A transport calls these from its own execution context, possibly
/// concurrently with in-flight stage calls. Implementations must not block.
pub trait SessionHandler: Send + Sync {
    /// The session was established.
    fn after_connected(&self, session_id: &str);

    /// A frame arrived that no subscription claimed.
    ///
    /// The memory transport calls this for frames published to a
    /// destination without a live subscriber.
    fn handle_frame(&self, frame: &Frame);

    /// The broker reported a protocol-level error for this session.
    fn handle_exception(&self, failure: &Failure);

    /// The underlying transport failed (connection lost, reset, ...).
    fn handle_transport_error(&self, failure: &Failure);
}

/// Shared session handler pointer.
pub type SessionHandlerPtr = Arc<dyn SessionHandler>;

type ConnectedCallback = Arc<dyn Fn(&str) + Send + Sync>;
type FrameCallback = Arc<dyn Fn(&Frame) + Send + Sync>;
type FailureCallback = Arc<dyn Fn(&Failure) + Send + Sync>;

/// [`SessionHandler`] assembled from four optional callbacks.
///
/// Any callback left unset falls back to logging the notification.
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    on_connected: Option<ConnectedCallback>,
    on_frame: Option<FrameCallback>,
    on_exception: Option<FailureCallback>,
    on_transport_error: Option<FailureCallback>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(f));
        self
    }

    pub fn on_frame(mut self, f: impl Fn(&Frame) + Send + Sync + 'static) -> Self {
        self.on_frame = Some(Arc::new(f));
        self
    }

    pub fn on_exception(mut self, f: impl Fn(&Failure) + Send + Sync + 'static) -> Self {
        self.on_exception = Some(Arc::new(f));
        self
    }

    pub fn on_transport_error(mut self, f: impl Fn(&Failure) + Send + Sync + 'static) -> Self {
        self.on_transport_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_frame", &self.on_frame.is_some())
            .field("on_exception", &self.on_exception.is_some())
            .field("on_transport_error", &self.on_transport_error.is_some())
            .finish()
    }
}

impl SessionHandler for SessionCallbacks {
    fn after_connected(&self, session_id: &str) {
        match &self.on_connected {
            Some(f) => f(session_id),
            None => log_info!("session {session_id} connected"),
        }
    }

    fn handle_frame(&self, frame: &Frame) {
        match &self.on_frame {
            Some(f) => f(frame),
            None => log_debug!("unclaimed frame on {}", frame.destination),
        }
    }

    fn handle_exception(&self, failure: &Failure) {
        match &self.on_exception {
            Some(f) => f(failure),
            None => log_warn!("session exception: {failure}"),
        }
    }

    fn handle_transport_error(&self, failure: &Failure) {
        match &self.on_transport_error {
            Some(f) => f(failure),
            None => log_warn!("transport error: {failure}"),
        }
    }
}

/// An established session.
///
/// All calls are asynchronous and report their own completion; none of them
/// block the caller's thread.
///
/// Implementations must ensure that:
/// - Once `subscribe()` returns successfully, frames sent to that destination
///   *after* that point are deliverable to the returned inbox.
/// - Dropping a session releases its resources even without `disconnect()`.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show
/// explicit lifetimes and a boxed `Future`. Consumers should treat methods
/// as normal `async fn`s.
#[async_trait]
pub trait Session: Send + Sync {
    // ---
    /// Identifier assigned by the transport, used for logging.
    fn session_id(&self) -> &str;

    /// Subscribe to a destination.
    async fn subscribe(&self, destination: &Destination) -> StageResult<SubscriptionHandle>;

    /// Send a payload to a destination.
    async fn send(&self, destination: &Destination, payload: Bytes) -> StageResult<Receipt>;

    /// Close the session and release associated resources.
    async fn disconnect(&self) -> Result<()>;
}

/// Shared session pointer.
pub type SessionPtr = Arc<dyn Session>;

/// Session factory.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a session with the endpoint.
    ///
    /// `handler` receives notifications for the lifetime of the session,
    /// including errors raised independently of any in-flight call.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        handler: SessionHandlerPtr,
    ) -> StageResult<SessionPtr>;
}

/// Shared connector pointer.
///
/// This is an `Arc<dyn Connector>`, which means:
/// - `.clone()` is cheap (only increments a reference count)
/// - Multiple orchestrations can share the same underlying broker
pub type ConnectorPtr = Arc<dyn Connector>;
