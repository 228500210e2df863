//! Example: log gateway traffic for a bot token
//!
//! Connects every recommended shard, logs readiness and message dispatches,
//! prints metrics on Ctrl+C and shuts down.
//!
//! Run with: GATEWAY_TOKEN=... RUST_LOG=info,gateway_shard_manager=debug cargo run --example gateway_logger

use gateway_shard_manager::{EventHandler, GatewayClient, GatewayConfig};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// GUILDS | GUILD_MESSAGES
const INTENTS: u64 = 1 | (1 << 9);

struct Logger;

impl EventHandler for Logger {
    async fn on_ready(&self) {
        info!("All shards ready");
    }

    async fn on_disconnect(&self) {
        info!("Every shard is down, waiting for them to come back");
    }

    async fn on_shard_ready(&self, shard_id: u32, unavailable_guilds: &HashSet<String>) {
        info!(
            "[SHARD-{}] Ready ({} guilds still unavailable)",
            shard_id,
            unavailable_guilds.len()
        );
    }

    async fn on_dispatch(&self, shard_id: u32, event: &str, data: Value) {
        if event == "MESSAGE_CREATE" {
            let content: String = data["content"]
                .as_str()
                .unwrap_or_default()
                .chars()
                .take(100)
                .collect();
            info!(
                "[SHARD-{}] #{} {}: {}",
                shard_id,
                data["channel_id"].as_str().unwrap_or("?"),
                data["author"]["username"].as_str().unwrap_or("?"),
                content
            );
        }
    }

    async fn on_guild_available(&self, shard_id: u32, data: Value) {
        info!(
            "[SHARD-{}] Guild available: {}",
            shard_id,
            data["name"].as_str().unwrap_or("?")
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let token = std::env::var("GATEWAY_TOKEN")?;
    let config = GatewayConfig::builder(token)
        .intents(INTENTS)
        .compress(true)
        .presence(json!({
            "since": null,
            "activities": [{"name": "the gateway", "type": 3}],
            "status": "online",
            "afk": false
        }))
        .build()?;

    let client = GatewayClient::new(config, Logger);
    let manager = client.connect().await?;
    info!("Started {} shards", manager.len());

    tokio::signal::ctrl_c().await?;

    let snapshot = manager.metrics().snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Resumes: {}", snapshot.resumes_total);
    info!("  Frames received: {}", snapshot.frames_received_total);
    info!("  Zombie disconnects: {}", snapshot.zombie_disconnects_total);
    for shard in &snapshot.shards {
        info!(
            "  [SHARD-{}] {} latency={:?}",
            shard.shard_id, shard.status, shard.latency
        );
    }

    client.disconnect().await;
    info!("Client stopped");
    Ok(())
}
