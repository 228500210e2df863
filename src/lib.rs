//! # gateway-shard-manager
//!
//! Client-side gateway sharding for a real-time chat platform.
//!
//! ## Features
//!
//! - **Sharding** with the platform's entity→shard routing formula and staggered spawning
//! - **Session resumption** after drops, with jittered backoff when a fresh identify is needed
//! - **Heartbeats** with zombie-connection detection and latency tracking
//! - **Readiness tracking** per shard (guild drain with grace timer) and across all shards
//! - **Frame codecs**: JSON text or MessagePack binary, optional zlib-stream transport compression
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use gateway_shard_manager::{EventHandler, GatewayClient, GatewayConfig};
//!
//! struct MyHandler;
//!
//! impl EventHandler for MyHandler {
//!     async fn on_ready(&self) {
//!         println!("all shards connected");
//!     }
//! }
//!
//! let config = GatewayConfig::builder(std::env::var("GATEWAY_TOKEN")?)
//!     .intents(513)
//!     .compress(true)
//!     .build()?;
//!
//! let client = GatewayClient::new(config, MyHandler);
//! let manager = client.connect().await?;
//! manager.request_guild_members(guild_id, Default::default())?;
//! ```

mod client;
mod codec;
mod config;
mod connection;
mod error;
mod handler;
mod health;
mod lifecycle;
mod manager;
mod metrics;
mod protocol;
mod rest;
mod shard;

pub use client::{GatewayClient, ShardPlan};
pub use codec::{FrameCodec, FrameDecoder, ZlibStream, ZLIB_SUFFIX};
pub use config::{
    BackoffConfig, ConfigError, ConnectionConfig, Encoding, GatewayConfig, GatewayConfigBuilder,
    ShardCount, DEFAULT_API_BASE, DEFAULT_GATEWAY_VERSION,
};
pub use error::{Error, ErrorKind};
pub use handler::{EventHandler, NoopHandler};
pub use health::HeartbeatTracker;
pub use lifecycle::{DisconnectPlan, ShardAction, ShardEvent, ShardInfo, ShardState, ShardStatus};
pub use manager::ShardManager;
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use protocol::{
    classify_close, shard_for_entity, CloseInfo, Envelope, GuildStub, HelloPayload,
    IdentifyPayload, IdentifyProperties, OpCode, ReadyPayload, ResumePayload,
};
pub use rest::{GatewayBotInfo, GatewayInfo, GatewaySource, RestClient, SessionStartLimit};
pub use shard::MemberRequest;

/// Result type for gateway-shard-manager operations
pub type Result<T> = std::result::Result<T, Error>;
