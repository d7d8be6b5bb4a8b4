//! Single-resolution publish/subscribe round trips over a message broker
//!
//! This library connects to a broker, subscribes to a destination, publishes
//! a payload to it, and then races three independent writers for one
//! outcome: the arrival of a matching frame, a setup or transport failure,
//! and a deadline that substitutes a fallback value. Exactly one of them
//! wins; every later attempt is discarded.
//!

// Import all sub modules once...
mod attempt;
mod config;
mod domain;
mod error;
mod governor;
mod listener;
mod macros;
mod orchestrator;
mod outcome;
mod retry;
mod sequencer;
mod transport;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use orchestrator::{Orchestration, Orchestrator, Stage};

pub use config::{RetryConfig, RoundtripConfig};

pub use attempt::AttemptId;
pub use error::{Failure, FailureKind, Result, RoundtripError};

pub use governor::{Deadline, DeadlineGuard, TimeoutGovernor};
pub use listener::{ArrivalListener, Decode, Json, ListenerGuard, Raw, SubscriptionContext, Text};
pub use outcome::{Resolution, ResolvableOutcome};
pub use retry::retry_with_backoff;
pub use sequencer::StageSequencer;

pub use transport::{
    // ---
    create_connector,
    create_memory_connector,
    create_memory_connector_with_broker,
    MemoryBroker,
};

// --- public re-exports
pub use domain::{
    //
    Connector,
    ConnectorPtr,
    Destination,
    Endpoint,
    Frame,
    Headers,
    Receipt,
    Session,
    SessionCallbacks,
    SessionHandler,
    SessionHandlerPtr,
    SessionPtr,
    StageResult,
    SubscriptionHandle,
};
