//! Example: connecting every shard of a bot and logging its events
//!
//! Run with: SHARDWIRE_TOKEN="Bot ..." cargo run --example gateway

use shardwire::rest::RestRequest;
use shardwire::{Activity, Client, ClientConfig, GatewayEvent, Presence, Status};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// GUILDS | GUILD_MESSAGES
const INTENTS: u64 = (1 << 0) | (1 << 9);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,shardwire=debug")),
        )
        .init();

    let token = std::env::var("SHARDWIRE_TOKEN")?;

    let config = ClientConfig::builder(token)
        .intents(INTENTS)
        .presence(Presence {
            status: Status::Online,
            activities: vec![Activity {
                name: "the shards".to_string(),
                kind: 3,
                url: None,
            }],
            ..Default::default()
        })
        .build()?;
    let client = Client::new(config)?;

    let me = client.rest().request(RestRequest::get("/users/@me")).await?;
    info!("Logged in as {}", me.unwrap_or_default()["username"]);

    // Subscribe before connecting so fatal errors always have an observer
    let mut events = client.subscribe();
    client.connect().await?;

    let metrics = client.metrics();
    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                GatewayEvent::Ready { shard_id } => info!("[SHARD-{}] Ready", shard_id),
                GatewayEvent::AllReady => info!("All shards ready"),
                GatewayEvent::Dispatch { shard_id, name, .. } => {
                    info!("[SHARD-{}] {}", shard_id, name)
                }
                GatewayEvent::Warn { shard_id, message } => {
                    warn!("[SHARD-{}] {}", shard_id, message)
                }
                GatewayEvent::Error { shard_id, error } => {
                    error!("[SHARD-{}] {}", shard_id, error)
                }
                _ => {}
            }
        }
    });

    info!("Running... Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    // Print final metrics
    let snapshot = metrics.snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Reconnections: {}", snapshot.reconnections_total);
    info!("  Frames received: {}", snapshot.frames_received_total);
    info!("  REST requests: {}", snapshot.rest_requests_total);
    info!("  Ready shards: {}", snapshot.ready_shards);

    // Graceful shutdown
    client.shutdown().await?;
    watcher.abort();
    info!("Client stopped");

    Ok(())
}
