use crate::config::{ConfigError, GatewayConfig, ShardCount};
use crate::error::Error;
use crate::handler::EventHandler;
use crate::manager::ShardManager;
use crate::rest::{GatewayBotInfo, GatewayInfo, GatewaySource, RestClient};
use parking_lot::RwLock;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Which shards this process runs and where they connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    pub url: String,
    pub total_shards: u32,
    pub first_shard_id: u32,
    pub last_shard_id: u32,
}

impl ShardPlan {
    pub fn ids(&self) -> RangeInclusive<u32> {
        self.first_shard_id..=self.last_shard_id
    }
}

/// What the REST layer told us, if it was asked at all
#[derive(Debug)]
enum GatewayLookup {
    Skipped,
    Gateway(GatewayInfo),
    Bot(GatewayBotInfo),
}

fn plan_shards(config: &GatewayConfig, lookup: GatewayLookup) -> Result<ShardPlan, Error> {
    let (rest_url, recommended) = match lookup {
        GatewayLookup::Bot(info) => {
            let limit = &info.session_start_limit;
            if limit.is_exhausted() {
                return Err(Error::SessionStartLimit {
                    reset_after: limit.reset_after(),
                });
            }
            info!(
                "Gateway recommends {} shards ({}/{} session starts left)",
                info.shards, limit.remaining, limit.total
            );
            (Some(info.url), Some(info.shards))
        }
        GatewayLookup::Gateway(info) => (Some(info.url), None),
        GatewayLookup::Skipped => (None, None),
    };

    let url = config
        .gateway_url
        .clone()
        .or(rest_url)
        .ok_or_else(|| ConfigError::InvalidSharding("no gateway URL available".to_string()))?;

    let total_shards = match config.shard_count {
        ShardCount::Fixed(n) => n,
        ShardCount::Auto => recommended.unwrap_or(1).max(1),
    };

    let first_shard_id = config.first_shard_id;
    let last_shard_id = config.last_shard_id.unwrap_or(total_shards - 1);
    if first_shard_id > last_shard_id || last_shard_id >= total_shards {
        return Err(ConfigError::InvalidSharding(format!(
            "shard range {}..={} does not fit a {}-shard deployment",
            first_shard_id, last_shard_id, total_shards
        ))
        .into());
    }

    Ok(ShardPlan {
        url,
        total_shards,
        first_shard_id,
        last_shard_id,
    })
}

/// Composition root: asks the REST layer how to shard, then starts the
/// manager and connects shards one `spawn_delay` apart.
///
/// ```ignore
/// let config = GatewayConfig::builder(token).intents(513).build()?;
/// let client = GatewayClient::new(config, MyHandler);
/// let manager = client.connect().await?;
/// ```
pub struct GatewayClient<H: EventHandler, R: GatewaySource = RestClient> {
    config: Arc<GatewayConfig>,
    handler: Arc<H>,
    source: R,
    manager: RwLock<Option<Arc<ShardManager<H>>>>,
    started: AtomicBool,
}

impl<H: EventHandler> GatewayClient<H, RestClient> {
    pub fn new(config: GatewayConfig, handler: H) -> Self {
        let rest = RestClient::new(config.api_base.clone(), config.token.clone());
        Self::with_source(config, handler, rest)
    }
}

impl<H: EventHandler, R: GatewaySource> GatewayClient<H, R> {
    /// Use a custom source for gateway discovery
    pub fn with_source(config: GatewayConfig, handler: H, source: R) -> Self {
        Self {
            config: Arc::new(config),
            handler: Arc::new(handler),
            source,
            manager: RwLock::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// The running manager, once `connect` has started it
    pub fn manager(&self) -> Option<Arc<ShardManager<H>>> {
        self.manager.read().clone()
    }

    /// Bootstrap and connect every shard in the configured range.
    ///
    /// Shards that fail their first connect keep retrying on their own; the
    /// failure is logged and reported through `on_error`/`on_shard_disconnect`.
    pub async fn connect(&self) -> Result<Arc<ShardManager<H>>, Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning);
        }

        match self.start().await {
            Ok(manager) => Ok(manager),
            Err(e) => {
                self.started.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn start(&self) -> Result<Arc<ShardManager<H>>, Error> {
        let plan = plan_shards(&self.config, self.lookup().await?)?;
        info!(
            "Starting shards {}..={} of {} at {}",
            plan.first_shard_id, plan.last_shard_id, plan.total_shards, plan.url
        );

        let manager = Arc::new(ShardManager::with_shared_handler(
            self.config.clone(),
            self.handler.clone(),
            plan.url.clone(),
            plan.total_shards,
        ));
        for id in plan.ids() {
            manager.spawn(id);
        }
        *self.manager.write() = Some(manager.clone());

        let spawn_delay = self.config.connection.spawn_delay;
        for id in plan.ids() {
            if id != plan.first_shard_id {
                tokio::time::sleep(spawn_delay).await;
            }
            if let Err(e) = manager.connect(id).await {
                warn!("[SHARD-{}] Initial connect failed: {}", id, e);
            }
        }

        Ok(manager)
    }

    async fn lookup(&self) -> Result<GatewayLookup, Error> {
        Ok(match (self.config.shard_count, &self.config.gateway_url) {
            (ShardCount::Fixed(_), Some(_)) => GatewayLookup::Skipped,
            (ShardCount::Fixed(_), None) => GatewayLookup::Gateway(self.source.gateway().await?),
            (ShardCount::Auto, _) => GatewayLookup::Bot(self.source.gateway_bot().await?),
        })
    }

    /// Stop every shard. The client can be connected again afterwards.
    pub async fn disconnect(&self) {
        let manager = self.manager.write().take();
        if let Some(manager) = manager {
            manager.shutdown().await;
        }
        self.started.store(false, Ordering::Release);
    }
}
