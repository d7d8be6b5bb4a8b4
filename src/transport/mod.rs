//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Connector` and `Session` traits, exposed only through constructor
//! functions and the broker handle tests need for fault injection.
//!
//! Domain code must not depend on transport-specific types.

mod memory;

pub use memory::{
    // ---
    create_memory_connector,
    create_memory_connector_with_broker,
    MemoryBroker,
};

use crate::{
    // ---
    ConnectorPtr,
    Result,
    RoundtripConfig,
    RoundtripError,
};

/// Select a connector for the configured endpoint.
///
/// # Errors
///
/// - `RoundtripError::MissingConfig` if the endpoint is empty
/// - `RoundtripError::UnsupportedEndpoint` if no transport handles its scheme
pub fn create_connector(config: &RoundtripConfig) -> Result<ConnectorPtr> {
    // ---
    let endpoint = &config.endpoint;

    if endpoint.0.is_empty() {
        return Err(RoundtripError::MissingConfig("endpoint".into()));
    }

    match endpoint.scheme() {
        Some("memory") => Ok(create_memory_connector()),
        _ => Err(RoundtripError::UnsupportedEndpoint(endpoint.to_string())),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn memory_scheme_selects_memory_connector() {
        // ---
        let config = RoundtripConfig::memory("client");
        assert!(create_connector(&config).is_ok());
    }

    #[test]
    fn other_schemes_are_rejected() {
        // ---
        let config = RoundtripConfig::with_endpoint("ws://localhost:8080/gs-guide-websocket", "c");
        assert!(matches!(
            create_connector(&config),
            Err(RoundtripError::UnsupportedEndpoint(e)) if e.starts_with("ws://")
        ));

        let config = RoundtripConfig::with_endpoint("", "c");
        assert!(matches!(
            create_connector(&config),
            Err(RoundtripError::MissingConfig(_))
        ));
    }
}
