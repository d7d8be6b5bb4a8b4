// src/error.rs

//! Failure and error types.
//!
//! Two layers are kept apart here:
//!
//! - [`Failure`] is what an orchestration attempt resolves to when one of its
//!   stages, the transport, or payload decoding breaks. It is stored inside
//!   the outcome cell and is therefore `Clone`.
//! - [`RoundtripError`] is the crate-level error returned by fallible APIs,
//!   including the caller-side wait timeout, which is *not* a
//!   [`Failure`].
//!
//! A deadline that expires is neither: it resolves the attempt with the
//! caller's fallback value.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Which part of an orchestration attempt broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    // ---
    /// The session could not be established.
    Connection,

    /// The broker refused or failed the subscription.
    Subscription,

    /// The payload could not be published.
    Publish,

    /// An arrived frame could not be decoded.
    Decode,

    /// The transport reported an error independently of any stage.
    Transport,
}

impl FailureKind {
    /// Whether a fresh attempt has a reasonable chance of succeeding.
    ///
    /// Only connection-level and transport-level failures qualify; a
    /// rejected destination or an undecodable payload will fail again.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Connection | FailureKind::Transport)
    }

    fn as_str(self) -> &'static str {
        match self {
            FailureKind::Connection => "connection",
            FailureKind::Subscription => "subscription",
            FailureKind::Publish => "publish",
            FailureKind::Decode => "decode",
            FailureKind::Transport => "transport",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of one orchestration attempt.
///
/// Carries the originating [`FailureKind`] and the underlying cause as text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} failure: {cause}")]
pub struct Failure {
    kind: FailureKind,
    cause: Arc<str>,
}

impl Failure {
    // ---
    /// Create a failure of the given kind.
    pub fn new(kind: FailureKind, cause: impl Into<Arc<str>>) -> Self {
        Self {
            kind,
            cause: cause.into(),
        }
    }

    pub fn connection(cause: impl Into<Arc<str>>) -> Self {
        Self::new(FailureKind::Connection, cause)
    }

    pub fn subscription(cause: impl Into<Arc<str>>) -> Self {
        Self::new(FailureKind::Subscription, cause)
    }

    pub fn publish(cause: impl Into<Arc<str>>) -> Self {
        Self::new(FailureKind::Publish, cause)
    }

    pub fn decode(cause: impl Into<Arc<str>>) -> Self {
        Self::new(FailureKind::Decode, cause)
    }

    pub fn transport(cause: impl Into<Arc<str>>) -> Self {
        Self::new(FailureKind::Transport, cause)
    }

    /// The originating kind.
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// The underlying cause.
    pub fn cause(&self) -> &str {
        &self.cause
    }

    /// See [`FailureKind::is_retryable`].
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Errors returned by the crate's fallible APIs.
#[derive(Error, Debug)]
pub enum RoundtripError {
    /// The orchestration attempt resolved to a failure.
    #[error(transparent)]
    Failed(#[from] Failure),

    /// The caller stopped waiting before the outcome resolved.
    ///
    /// Distinct from the attempt's own deadline, which resolves to the
    /// fallback value instead of producing an error.
    #[error("gave up waiting for the outcome after {0:?}")]
    WaitTimeout(Duration),

    /// Payload bytes did not match the expected encoding.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No transport is available for the endpoint's scheme.
    #[error("unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),

    /// A required configuration value is missing.
    #[error("missing config: {0}")]
    MissingConfig(String),
}

/// Result type alias for fallible operations.
pub type Result<T> = std::result::Result<T, RoundtripError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn failure_display_names_kind_and_cause() {
        // ---
        let failure = Failure::subscription("destination unavailable");
        assert_eq!(
            failure.to_string(),
            "subscription failure: destination unavailable"
        );
        assert_eq!(failure.kind(), FailureKind::Subscription);
        assert_eq!(failure.cause(), "destination unavailable");
    }

    #[test]
    fn only_connection_and_transport_are_retryable() {
        // ---
        assert!(Failure::connection("refused").is_retryable());
        assert!(Failure::transport("reset").is_retryable());
        assert!(!Failure::subscription("nope").is_retryable());
        assert!(!Failure::publish("nope").is_retryable());
        assert!(!Failure::decode("nope").is_retryable());
    }

    #[test]
    fn failure_converts_into_crate_error_transparently() {
        // ---
        let err: RoundtripError = Failure::publish("broker full").into();
        assert_eq!(err.to_string(), "publish failure: broker full");
        assert!(matches!(err, RoundtripError::Failed(ref f) if f.kind() == FailureKind::Publish));
    }

    #[test]
    fn wait_timeout_is_not_a_failure() {
        // ---
        let err = RoundtripError::WaitTimeout(Duration::from_millis(5));
        assert!(!matches!(err, RoundtripError::Failed(_)));
        assert!(err.to_string().contains("5ms"));
    }
}
