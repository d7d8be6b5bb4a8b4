//! Echo round trip using the in-memory broker.
//!
//! Subscribes to a destination, publishes to it, and reports which writer
//! resolved each attempt: the echoed frame, a setup failure, or the
//! deadline fallback.
//!
//! Run with: RUST_LOG=debug cargo run --example echo_memory

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::panic_in_result_fn
)]

use std::time::Duration;

use mom_roundtrip::{
    create_memory_connector_with_broker, Json, MemoryBroker, Orchestrator, Resolution, Result,
    RoundtripConfig, Text,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt as tracing_format, EnvFilter};

const DESTINATION: &str = "/topic/subscribe-test";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Greeting {
    content: String,
}

fn report<T: std::fmt::Debug>(name: &str, resolution: &Resolution<T>) {
    match resolution {
        Resolution::Received(value) => println!("{name}: received {value:?}"),
        Resolution::TimedOut(value) => println!("{name}: timed out, fallback {value:?}"),
        Resolution::Failed(failure) => println!("{name}: failed, {failure}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_format()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_line_number(true)
        .init();

    let broker = MemoryBroker::new();
    let config = RoundtripConfig::memory("echo").with_deadline(Duration::from_millis(500));
    let orchestrator =
        Orchestrator::new(create_memory_connector_with_broker(broker.clone()), config);

    // 1. The published payload comes straight back.
    let resolution = orchestrator
        .orchestrate(
            DESTINATION,
            "payload-from-websocket-java-client",
            "completeOnTimeout".to_string(),
            Text,
        )
        .await?;
    report("echo", &resolution);

    // 2. Same round trip with a JSON body.
    let body = serde_json::to_vec(&Greeting {
        content: "Hello, World!".into(),
    })?;
    let resolution = orchestrator
        .orchestrate(
            "/topic/greetings",
            body,
            Greeting {
                content: "nobody answered".into(),
            },
            Json::<Greeting>::new(),
        )
        .await?;
    report("json", &resolution);

    // 3. The broker refuses the subscription.
    broker.reject_subscriptions("/topic/missing", "destination unavailable");
    let resolution = orchestrator
        .orchestrate("/topic/missing", "ignored", String::new(), Text)
        .await?;
    report("rejected", &resolution);

    // 4. Frames are accepted but never delivered, so the deadline wins.
    broker.mute("/topic/void");
    let resolution = orchestrator
        .orchestrate("/topic/void", "lost", "completeOnTimeout".to_string(), Text)
        .await?;
    report("muted", &resolution);

    Ok(())
}
