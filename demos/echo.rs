//! Keeps a connection to an echo server alive and prints what comes back.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=debug cargo run --example echo -- wss://echo.websocket.org
//! ```
//!
//! Stop the server (or cut the network) while it runs to watch it reconnect.

use std::time::Duration;

use resilient_ws::ws::config::{Config, ReconnectConfig};
use resilient_ws::ws::{ConnectionManager, Handlers, Payload};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "wss://echo.websocket.org".to_owned());

    let config = Config::builder()
        .heartbeat_interval(Duration::from_secs(10))
        .debug_logging(true)
        .reconnect(
            ReconnectConfig::builder()
                .interval(Duration::from_secs(1))
                .backoff_multiplier(2.0)
                .max_interval(Duration::from_secs(30))
                .max_elapsed(Duration::from_secs(300))
                .build(),
        )
        .build();

    let handlers = Handlers::default()
        .on_message(|payload| match payload {
            Payload::Text(text) => info!(%text, "Received"),
            other => info!(?other, "Received"),
        })
        .on_reconnect_success(|epoch| info!(%epoch, "Reconnected"))
        .on_reconnect_stopped(|reason, close| warn!(%reason, code = close.code, "Gave up"))
        .heartbeat_payload(|| Some(Payload::from(r#"{"type":"ping"}"#)));

    let connection = ConnectionManager::new(&endpoint, config, handlers)?;
    let epoch = connection.connect().await?;
    info!(%endpoint, %epoch, "Connected");

    for n in 0..5 {
        if let Err(e) = connection.send(format!("message {n}")).await {
            warn!(error = %e, "Send failed");
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    let mut state_rx = connection.state_receiver();
    let left_open = tokio::time::timeout(
        Duration::from_secs(60),
        state_rx.wait_for(|state| !state.is_open()),
    )
    .await;
    if left_open.is_ok() {
        info!(state = ?connection.state(), "Connection left open state");
    }

    connection.close_normal().await?;
    Ok(())
}
