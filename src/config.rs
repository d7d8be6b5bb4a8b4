//! Public, transport-agnostic orchestration configuration.
//!
//! This type intentionally contains no transport-specific concepts.
//! Transport layers interpret the endpoint into concrete connection
//! settings.

use std::time::Duration;

use crate::Endpoint;

/// Retry configuration with exponential backoff.
///
/// Applies only to the caller-level retry wrapper
/// ([`Orchestrator::orchestrate_with_retry`](crate::Orchestrator::orchestrate_with_retry));
/// a single orchestration attempt never retries anything.
///
/// # Example
///
/// ```
/// use mom_roundtrip::RetryConfig;
/// use std::time::Duration;
///
/// let retry_config = RetryConfig {
///     max_attempts: 5,
///     multiplier: 2.0,
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(10),
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt).
    pub max_attempts: u32,

    /// Backoff multiplier applied to the delay after each retry.
    ///
    /// Example: 2.0 doubles the delay each time (exponential backoff).
    pub multiplier: f32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retry attempts (caps exponential growth).
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    /// Reasonable default retry configuration.
    ///
    /// - `max_attempts`: 3
    /// - `multiplier`: 2.0 (exponential backoff)
    /// - `initial_delay`: 100ms
    /// - `max_delay`: 5s
    fn default() -> Self {
        Self {
            max_attempts: 3,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Orchestration configuration.
#[derive(Debug, Clone)]
pub struct RoundtripConfig {
    // ---
    /// Where sessions connect.
    ///
    /// `memory://...` selects the in-process broker.
    pub endpoint: Endpoint,

    /// Identifier for this client, used for logging.
    pub client_id: String,

    /// How long an attempt waits for an arrival before resolving with the
    /// fallback value.
    ///
    /// Default: 3 seconds
    pub deadline: Duration,

    /// How long `orchestrate()` waits for the attempt to resolve at all.
    ///
    /// Should exceed `deadline`; when it runs out the caller gets
    /// [`RoundtripError::WaitTimeout`](crate::RoundtripError::WaitTimeout)
    /// instead of a resolution.
    ///
    /// Default: 30 seconds
    pub wait_timeout: Duration,

    /// Optional caller-level retry configuration.
    pub retry_config: Option<RetryConfig>,
}

impl RoundtripConfig {
    /// Create a config for the given endpoint.
    pub fn with_endpoint(endpoint: impl Into<Endpoint>, client_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client_id: client_id.into(),
            deadline: Duration::from_secs(3),
            wait_timeout: Duration::from_secs(30),
            retry_config: None,
        }
    }

    /// Create an in-memory broker config.
    pub fn memory(client_id: impl Into<String>) -> Self {
        Self::with_endpoint("memory://local", client_id)
    }

    /// Set the arrival deadline.
    ///
    /// # Example
    ///
    /// ```
    /// use mom_roundtrip::RoundtripConfig;
    /// use std::time::Duration;
    ///
    /// let config = RoundtripConfig::memory("client")
    ///     .with_deadline(Duration::from_millis(500));
    /// ```
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set how long the caller waits for a resolution.
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// Configure caller-level retry with exponential backoff.
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry_config = Some(config);
        self
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn memory_defaults() {
        // ---
        let config = RoundtripConfig::memory("client-1");

        assert_eq!(config.endpoint.scheme(), Some("memory"));
        assert_eq!(config.client_id, "client-1");
        assert_eq!(config.deadline, Duration::from_secs(3));
        assert_eq!(config.wait_timeout, Duration::from_secs(30));
        assert!(config.retry_config.is_none());
    }

    #[test]
    fn builder_methods_override() {
        // ---
        let config = RoundtripConfig::with_endpoint("ws://localhost:8080/gs-guide-websocket", "c")
            .with_deadline(Duration::from_millis(200))
            .with_wait_timeout(Duration::from_secs(1))
            .with_retry(RetryConfig::default());

        assert_eq!(config.endpoint.scheme(), Some("ws"));
        assert_eq!(config.deadline, Duration::from_millis(200));
        assert_eq!(config.wait_timeout, Duration::from_secs(1));
        assert_eq!(config.retry_config.map(|r| r.max_attempts), Some(3));
    }
}
