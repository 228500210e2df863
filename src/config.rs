use crate::protocol::IdentifyProperties;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Default REST base used to discover the gateway.
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Default gateway protocol version.
pub const DEFAULT_GATEWAY_VERSION: u8 = 10;

/// Wire serialization strategy for gateway frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Text frames carrying JSON
    #[default]
    Json,
    /// Binary frames carrying MessagePack
    MsgPack,
}

impl Encoding {
    /// Value of the `encoding` query parameter
    pub fn as_query(&self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::MsgPack => "msgpack",
        }
    }
}

/// How many shards the client should run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardCount {
    /// Use the recommendation from the gateway bot endpoint
    #[default]
    Auto,
    /// Use exactly this many shards
    Fixed(u32),
}

/// Configuration for the gateway client
#[derive(Clone)]
pub struct GatewayConfig {
    /// Authentication token (without any `Bot ` prefix)
    pub token: String,
    /// Gateway intents bitfield
    pub intents: u64,
    /// Connection properties sent in identify
    pub properties: IdentifyProperties,
    /// Presence sent with identify
    pub presence: Option<Value>,
    /// Member count above which a guild is considered large (50..=250)
    pub large_threshold: u32,
    /// Whether to receive presence and typing events
    pub guild_subscriptions: bool,
    /// Frame serialization strategy
    pub encoding: Encoding,
    /// Use zlib-stream transport compression
    pub compress: bool,
    /// Gateway protocol version
    pub gateway_version: u8,
    /// Skip gateway discovery and connect here
    pub gateway_url: Option<String>,
    /// REST base for gateway discovery
    pub api_base: String,
    /// Total shard count
    pub shard_count: ShardCount,
    /// First shard ID this process runs
    pub first_shard_id: u32,
    /// Last shard ID this process runs (defaults to total - 1)
    pub last_shard_id: Option<u32>,
    /// Connection-related settings
    pub connection: ConnectionConfig,
    /// Backoff settings for reconnection
    pub backoff: BackoffConfig,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("token", &redact_token(&self.token))
            .field("intents", &self.intents)
            .field("properties", &self.properties)
            .field("presence", &self.presence)
            .field("large_threshold", &self.large_threshold)
            .field("guild_subscriptions", &self.guild_subscriptions)
            .field("encoding", &self.encoding)
            .field("compress", &self.compress)
            .field("gateway_version", &self.gateway_version)
            .field("gateway_url", &self.gateway_url)
            .field("api_base", &self.api_base)
            .field("shard_count", &self.shard_count)
            .field("first_shard_id", &self.first_shard_id)
            .field("last_shard_id", &self.last_shard_id)
            .field("connection", &self.connection)
            .field("backoff", &self.backoff)
            .finish()
    }
}

/// Redact a token for logging, keeping only a short prefix.
fn redact_token(token: &str) -> String {
    if token.len() <= 8 {
        return "***".to_string();
    }
    let prefix: String = token.chars().take(4).collect();
    format!("{}***", prefix)
}

impl GatewayConfig {
    /// Create a new builder for configuration
    pub fn builder(token: impl Into<String>) -> GatewayConfigBuilder {
        GatewayConfigBuilder {
            config: GatewayConfig {
                token: token.into(),
                intents: 0,
                properties: IdentifyProperties::default(),
                presence: None,
                large_threshold: 250,
                guild_subscriptions: true,
                encoding: Encoding::default(),
                compress: false,
                gateway_version: DEFAULT_GATEWAY_VERSION,
                gateway_url: None,
                api_base: DEFAULT_API_BASE.to_string(),
                shard_count: ShardCount::default(),
                first_shard_id: 0,
                last_shard_id: None,
                connection: ConnectionConfig::default(),
                backoff: BackoffConfig::default(),
            },
        }
    }
}

/// Builder for GatewayConfig
#[derive(Debug, Clone)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Set the intents bitfield
    pub fn intents(mut self, intents: u64) -> Self {
        self.config.intents = intents;
        self
    }

    /// Set identify connection properties
    pub fn properties(mut self, properties: IdentifyProperties) -> Self {
        self.config.properties = properties;
        self
    }

    /// Set the presence sent with identify
    pub fn presence(mut self, presence: Value) -> Self {
        self.config.presence = Some(presence);
        self
    }

    /// Set the large guild threshold
    pub fn large_threshold(mut self, threshold: u32) -> Self {
        self.config.large_threshold = threshold;
        self
    }

    /// Enable or disable presence/typing subscriptions
    pub fn guild_subscriptions(mut self, enabled: bool) -> Self {
        self.config.guild_subscriptions = enabled;
        self
    }

    /// Set the frame encoding
    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.config.encoding = encoding;
        self
    }

    /// Enable or disable zlib-stream compression
    pub fn compress(mut self, enabled: bool) -> Self {
        self.config.compress = enabled;
        self
    }

    /// Set the gateway protocol version
    pub fn gateway_version(mut self, version: u8) -> Self {
        self.config.gateway_version = version;
        self
    }

    /// Connect to this gateway URL instead of asking the REST API
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.gateway_url = Some(url.into());
        self
    }

    /// Set the REST base URL
    pub fn api_base(mut self, base: impl Into<String>) -> Self {
        self.config.api_base = base.into();
        self
    }

    /// Set the shard count
    pub fn shard_count(mut self, count: ShardCount) -> Self {
        self.config.shard_count = count;
        self
    }

    /// Restrict this process to a range of shard IDs
    pub fn shard_range(mut self, first: u32, last: u32) -> Self {
        self.config.first_shard_id = first;
        self.config.last_shard_id = Some(last);
        self
    }

    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.config.backoff = config;
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        let config = self.config;

        if config.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }

        if !(50..=250).contains(&config.large_threshold) {
            return Err(ConfigError::InvalidIdentify(format!(
                "large_threshold must be within 50..=250, got {}",
                config.large_threshold
            )));
        }

        if config.shard_count == ShardCount::Fixed(0) {
            return Err(ConfigError::InvalidSharding(
                "shard count cannot be 0".to_string(),
            ));
        }

        if let Some(last) = config.last_shard_id {
            if last < config.first_shard_id {
                return Err(ConfigError::InvalidSharding(
                    "last_shard_id must be >= first_shard_id".to_string(),
                ));
            }
            if let ShardCount::Fixed(total) = config.shard_count {
                if last >= total {
                    return Err(ConfigError::InvalidSharding(format!(
                        "last_shard_id {} is outside a {}-shard deployment",
                        last, total
                    )));
                }
            }
        }

        if config.backoff.max_delay < config.backoff.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }

        if config.backoff.initial_delay.is_zero() {
            return Err(ConfigError::InvalidBackoff(
                "initial_delay must be > 0".to_string(),
            ));
        }

        if config.connection.connect_timeout.is_zero() || config.connection.ready_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "connect_timeout and ready_timeout must be > 0".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// No token given
    #[error("A gateway token is required")]
    MissingToken,
    /// Invalid identify settings
    #[error("Invalid identify configuration: {0}")]
    InvalidIdentify(String),
    /// Invalid shard settings
    #[error("Invalid shard configuration: {0}")]
    InvalidSharding(String),
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid timeout configuration
    #[error("Invalid timeout configuration: {0}")]
    InvalidTimeout(String),
}

/// Connection-related configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time allowed from opening the transport until READY/RESUMED
    pub connect_timeout: Duration,
    /// Grace period for unavailable guilds before declaring the shard ready
    pub ready_timeout: Duration,
    /// Delay between successive shard spawns
    pub spawn_delay: Duration,
    /// Stop reconnecting after this many consecutive attempts (None = never stop)
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(15),
            spawn_delay: Duration::from_secs(5),
            max_reconnect_attempts: None,
        }
    }
}

/// Backoff configuration for reconnection without a session
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Baseline delay, restored after every successful connect
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(7),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    /// Grow a delay by a random factor in `[1, 3)`, capped at `max_delay`.
    ///
    /// `jitter` is a uniform sample from `[0, 1)`.
    pub fn next_delay(&self, current: Duration, jitter: f64) -> Duration {
        let grown = (current.as_millis() as f64 * (jitter * 2.0 + 1.0)).round();
        let capped = grown.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_is_capped() {
        let config = BackoffConfig::default();

        assert_eq!(
            config.next_delay(Duration::from_secs(7), 0.5),
            Duration::from_secs(14)
        );
        assert_eq!(
            config.next_delay(Duration::from_secs(7), 0.0),
            Duration::from_secs(7)
        );
        assert_eq!(
            config.next_delay(Duration::from_secs(20), 0.99),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_backoff_with_random_jitter_never_exceeds_cap() {
        let config = BackoffConfig::default();
        let mut delay = config.initial_delay;

        for _ in 0..50 {
            let next = config.next_delay(delay, rand::random::<f64>());
            assert!(next >= delay);
            assert!(next <= config.max_delay);
            delay = next;
        }
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = GatewayConfig::builder("token-abcdefgh")
            .intents(513)
            .build()
            .expect("valid config");

        assert_eq!(config.intents, 513);
        assert_eq!(config.large_threshold, 250);
        assert_eq!(config.connection.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.connection.ready_timeout, Duration::from_secs(15));
        assert_eq!(config.connection.spawn_delay, Duration::from_secs(5));
        assert_eq!(config.backoff.initial_delay, Duration::from_secs(7));
        assert_eq!(config.shard_count, ShardCount::Auto);
        assert!(config.guild_subscriptions);
    }

    #[test]
    fn test_config_builder_rejects_invalid_values() {
        assert!(matches!(
            GatewayConfig::builder("  ").build(),
            Err(ConfigError::MissingToken)
        ));
        assert!(GatewayConfig::builder("tok").large_threshold(10).build().is_err());
        assert!(GatewayConfig::builder("tok")
            .shard_count(ShardCount::Fixed(0))
            .build()
            .is_err());
        assert!(GatewayConfig::builder("tok")
            .shard_count(ShardCount::Fixed(2))
            .shard_range(0, 2)
            .build()
            .is_err());
        assert!(GatewayConfig::builder("tok").shard_range(3, 1).build().is_err());
        assert!(GatewayConfig::builder("tok")
            .backoff(BackoffConfig {
                initial_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(5),
            })
            .build()
            .is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = GatewayConfig::builder("NzkyNzE1NDU0MTk2MDg4ODQy.secret")
            .build()
            .expect("valid config");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("Nzky***"));
    }
}
