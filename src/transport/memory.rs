//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Connector` and `Session` traits. It is intended primarily for testing,
//! local execution, and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory transport defines the **reference behavior** for the
//! transport layer:
//!
//! - Once `subscribe()` returns successfully, frames sent to that
//!   destination *after* that point are deliverable.
//! - Destinations match by exact string equality.
//! - Frame delivery is deterministic within a single process.
//! - A frame that reaches no subscription is offered to every live
//!   session's `SessionHandler::handle_frame` instead of vanishing.
//!
//! ## Fault injection
//!
//! [`MemoryBroker`] can refuse connections, reject subscriptions or sends
//! per destination, silently drop frames for a destination, delay connects,
//! and raise session-level errors on every live session. These exist so the
//! failure paths of an orchestration can be exercised without a real broker.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    // ---
    log_debug,
    log_info,
    Connector,
    ConnectorPtr,
    Destination,
    Endpoint,
    Failure,
    Frame,
    Headers,
    Receipt,
    Result,
    Session,
    SessionHandlerPtr,
    SessionPtr,
    StageResult,
    SubscriptionHandle,
};

/// Inbox capacity per subscription.
const INBOX_CAPACITY: usize = 16;

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// None of the broker maps has invariants spanning entries; a panic while
/// holding a lock at worst leaves a stale subscriber that the next send
/// prunes.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Subscriber {
    session_id: Arc<str>,
    tx: mpsc::Sender<Frame>,
}

#[derive(Default)]
struct Faults {
    refuse_connections: Option<Arc<str>>,
    connect_delay: Option<Duration>,
    rejected_subscriptions: HashMap<Destination, Arc<str>>,
    rejected_sends: HashMap<Destination, Arc<str>>,
    muted: HashSet<Destination>,
}

/// Shared message bus for the in-memory transport.
///
/// Simulates a message broker within a single process. All sessions
/// connected through connectors sharing a `MemoryBroker` can send and
/// receive each other's frames, exactly as clients of a real broker would.
///
/// # Usage in tests
///
/// Construct a broker explicitly for isolation between parallel tests:
///
/// ```
/// # use mom_roundtrip::{MemoryBroker, create_memory_connector_with_broker};
/// let broker = MemoryBroker::new();
/// broker.reject_subscriptions("/topic/missing", "destination unavailable");
///
/// let connector = create_memory_connector_with_broker(broker.clone());
/// ```
pub struct MemoryBroker {
    // ---
    subscriptions: Mutex<HashMap<Destination, Vec<Subscriber>>>,
    sessions: Mutex<HashMap<Arc<str>, SessionHandlerPtr>>,
    faults: Mutex<Faults>,
    next_session: AtomicU64,
}

impl MemoryBroker {
    /// Create a new, empty broker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse every new connection with `cause`.
    pub fn refuse_connections(&self, cause: impl Into<Arc<str>>) {
        lock_ignore_poison(&self.faults).refuse_connections = Some(cause.into());
    }

    /// Delay every new connection by `delay` before it succeeds or fails.
    pub fn delay_connections(&self, delay: Duration) {
        lock_ignore_poison(&self.faults).connect_delay = Some(delay);
    }

    /// Fail subscriptions to `destination` with `cause`.
    pub fn reject_subscriptions(
        &self,
        destination: impl Into<Destination>,
        cause: impl Into<Arc<str>>,
    ) {
        lock_ignore_poison(&self.faults)
            .rejected_subscriptions
            .insert(destination.into(), cause.into());
    }

    /// Fail sends to `destination` with `cause`.
    pub fn reject_sends(&self, destination: impl Into<Destination>, cause: impl Into<Arc<str>>) {
        lock_ignore_poison(&self.faults)
            .rejected_sends
            .insert(destination.into(), cause.into());
    }

    /// Accept sends to `destination` but never deliver them.
    pub fn mute(&self, destination: impl Into<Destination>) {
        lock_ignore_poison(&self.faults)
            .muted
            .insert(destination.into());
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        *lock_ignore_poison(&self.faults) = Faults::default();
    }

    /// Report a transport error to every live session.
    pub fn fail_transport(&self, cause: impl Into<Arc<str>>) {
        // ---
        let failure = Failure::transport(cause);
        for handler in self.live_handlers() {
            handler.handle_transport_error(&failure);
        }
    }

    /// Report a broker-side protocol error to every live session.
    pub fn raise_exception(&self, failure: Failure) {
        // ---
        for handler in self.live_handlers() {
            handler.handle_exception(&failure);
        }
    }

    /// Publish a frame as the broker itself (e.g. a redelivery).
    ///
    /// Returns the number of subscribers the frame was delivered to. When
    /// that is zero, live sessions see the frame as unclaimed.
    pub async fn publish(&self, destination: impl Into<Destination>, payload: Bytes) -> usize {
        let destination = destination.into();
        let frame = Frame::new(destination.clone(), frame_headers(&destination), payload);
        self.deliver(frame).await
    }

    /// Number of open subscriptions to `destination`.
    pub fn subscriber_count(&self, destination: impl Into<Destination>) -> usize {
        // ---
        let destination = destination.into();
        let subs = lock_ignore_poison(&self.subscriptions);
        subs.get(&destination)
            .map_or(0, |v| v.iter().filter(|s| !s.tx.is_closed()).count())
    }

    /// Number of connected sessions.
    pub fn session_count(&self) -> usize {
        lock_ignore_poison(&self.sessions).len()
    }

    fn live_handlers(&self) -> Vec<SessionHandlerPtr> {
        lock_ignore_poison(&self.sessions)
            .values()
            .cloned()
            .collect()
    }

    fn subscribe(&self, session_id: &Arc<str>, destination: &Destination) -> StageResult<SubscriptionHandle> {
        // ---
        if let Some(cause) = lock_ignore_poison(&self.faults)
            .rejected_subscriptions
            .get(destination)
        {
            return Err(Failure::subscription(cause.clone()));
        }

        log_debug!("{session_id}: subscribe to {destination}");

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);

        lock_ignore_poison(&self.subscriptions)
            .entry(destination.clone())
            .or_default()
            .push(Subscriber {
                session_id: session_id.clone(),
                tx,
            });

        Ok(SubscriptionHandle {
            destination: destination.clone(),
            inbox: rx,
        })
    }

    async fn send(&self, session_id: &str, destination: &Destination, payload: Bytes) -> StageResult<Receipt> {
        // ---
        let muted = {
            let faults = lock_ignore_poison(&self.faults);
            if let Some(cause) = faults.rejected_sends.get(destination) {
                return Err(Failure::publish(cause.clone()));
            }
            faults.muted.contains(destination)
        };

        let headers = frame_headers(destination);
        let receipt = Receipt {
            id: headers
                .get(Headers::MESSAGE_ID)
                .unwrap_or_default()
                .into(),
        };

        if muted {
            log_debug!("{session_id}: send to muted {destination} dropped");
            return Ok(receipt);
        }

        let _delivered = self
            .deliver(Frame::new(destination.clone(), headers, payload))
            .await;
        log_debug!("{session_id}: send to {destination} reached {_delivered} subscriber(s)");

        Ok(receipt)
    }

    async fn deliver(&self, frame: Frame) -> usize {
        // ---
        // Snapshot the senders so no lock is held across a full inbox.
        let senders: Vec<mpsc::Sender<Frame>> = {
            let mut subs = lock_ignore_poison(&self.subscriptions);
            match subs.get_mut(&frame.destination) {
                Some(list) => {
                    list.retain(|s| !s.tx.is_closed());
                    list.iter().map(|s| s.tx.clone()).collect()
                }
                None => Vec::new(),
            }
        };

        let mut delivered = 0;
        for tx in senders {
            // A closed channel means the handle was dropped meanwhile.
            if tx.send(frame.clone()).await.is_ok() {
                delivered += 1;
            }
        }

        if delivered == 0 {
            for handler in self.live_handlers() {
                handler.handle_frame(&frame);
            }
        }
        delivered
    }

    fn register_session(&self, handler: SessionHandlerPtr) -> Arc<str> {
        // ---
        let n = self.next_session.fetch_add(1, Ordering::Relaxed);
        let session_id: Arc<str> = format!("mem-session-{n}").into();

        lock_ignore_poison(&self.sessions).insert(session_id.clone(), handler);
        session_id
    }

    fn release_session(&self, session_id: &str) {
        // ---
        lock_ignore_poison(&self.sessions).remove(session_id);

        let mut subs = lock_ignore_poison(&self.subscriptions);
        for list in subs.values_mut() {
            list.retain(|s| &*s.session_id != session_id);
        }
        subs.retain(|_, list| !list.is_empty());
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        // ---
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            next_session: AtomicU64::new(1),
        }
    }
}

fn frame_headers(destination: &Destination) -> Headers {
    Headers::new()
        .with(Headers::DESTINATION, destination.as_str())
        .with(Headers::MESSAGE_ID, Uuid::new_v4().to_string())
        .with(Headers::CONTENT_TYPE, "text/plain;charset=UTF-8")
}

/// Process-global broker used by [`create_memory_connector`].
static GLOBAL_BROKER: OnceLock<Arc<MemoryBroker>> = OnceLock::new();

fn global_broker() -> Arc<MemoryBroker> {
    GLOBAL_BROKER.get_or_init(MemoryBroker::new).clone()
}

struct MemoryConnector {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl Connector for MemoryConnector {
    // ---
    async fn connect(
        &self,
        endpoint: &Endpoint,
        handler: SessionHandlerPtr,
    ) -> StageResult<SessionPtr> {
        // ---
        let (refused, delay) = {
            let faults = lock_ignore_poison(&self.broker.faults);
            (faults.refuse_connections.clone(), faults.connect_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(cause) = refused {
            return Err(Failure::connection(cause));
        }

        let session_id = self.broker.register_session(handler.clone());
        log_info!("{session_id}: connected to {endpoint}");

        handler.after_connected(&session_id);

        Ok(Arc::new(MemorySession {
            session_id,
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// A session on a [`MemoryBroker`].
///
/// Disconnecting or dropping the session closes every subscription it made.
struct MemorySession {
    session_id: Arc<str>,
    broker: Arc<MemoryBroker>,
    closed: AtomicBool,
}

#[async_trait]
impl Session for MemorySession {
    // ---
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn subscribe(&self, destination: &Destination) -> StageResult<SubscriptionHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Failure::subscription("session closed"));
        }
        self.broker.subscribe(&self.session_id, destination)
    }

    async fn send(&self, destination: &Destination, payload: Bytes) -> StageResult<Receipt> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Failure::publish("session closed"));
        }
        self.broker
            .send(&self.session_id, destination, payload)
            .await
    }

    async fn disconnect(&self) -> Result<()> {
        // ---
        if !self.closed.swap(true, Ordering::AcqRel) {
            log_debug!("{}: disconnecting", self.session_id);
            self.broker.release_session(&self.session_id);
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.broker.release_session(&self.session_id);
        }
    }
}

/// Create a connector on the process-global broker.
///
/// All connectors created with this function share a single message bus,
/// matching the semantics of clients connected to one real broker.
///
/// For isolated parallel testing, use [`create_memory_connector_with_broker`].
pub fn create_memory_connector() -> ConnectorPtr {
    create_memory_connector_with_broker(global_broker())
}

/// Create a connector on the provided broker.
pub fn create_memory_connector_with_broker(broker: Arc<MemoryBroker>) -> ConnectorPtr {
    Arc::new(MemoryConnector { broker })
}
