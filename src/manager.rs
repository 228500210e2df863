use crate::codec::FrameCodec;
use crate::config::{ConfigError, GatewayConfig};
use crate::connection::ConnectionContext;
use crate::error::Error;
use crate::handler::EventHandler;
use crate::lifecycle::{ShardEvent, ShardInfo, ShardStatus};
use crate::metrics::Metrics;
use crate::protocol::{shard_for_entity, OpCode};
use crate::shard::{MemberRequest, Shard};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

/// How long `shutdown` waits for each shard task to finish its close handshake
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type ShardMap = Arc<RwLock<HashMap<u32, Shard>>>;

/// Owns every shard of this process and aggregates their readiness.
///
/// # Thread Safety
///
/// `ShardManager` is `Send + Sync`. The shard map is only mutated through
/// manager methods; shards report upward through one event channel that a
/// single router task consumes, and that router is the only writer of the
/// global ready flag.
///
/// # Spawn staggering
///
/// The platform limits how fast sessions may be started. Callers connecting
/// several shards must wait `ConnectionConfig::spawn_delay` (5s by default)
/// between successive [`connect`](ShardManager::connect) calls.
/// [`GatewayClient`](crate::GatewayClient) does this for you.
pub struct ShardManager<H: EventHandler> {
    handler: Arc<H>,
    config: Arc<GatewayConfig>,
    metrics: Arc<Metrics>,
    shards: ShardMap,
    gateway_url: Arc<RwLock<String>>,
    total_shards: u32,
    codec: FrameCodec,
    ready: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<ShardEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<ShardEvent>>>,
    router: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl<H: EventHandler> ShardManager<H> {
    /// Create a manager for a deployment of `total_shards` shards
    pub fn new(
        config: GatewayConfig,
        handler: H,
        gateway_url: impl Into<String>,
        total_shards: u32,
    ) -> Self {
        Self::with_shared_handler(Arc::new(config), Arc::new(handler), gateway_url, total_shards)
    }

    /// Create a manager sharing an existing config and handler
    pub fn with_shared_handler(
        config: Arc<GatewayConfig>,
        handler: Arc<H>,
        gateway_url: impl Into<String>,
        total_shards: u32,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let codec = FrameCodec::for_encoding(config.encoding);
        Self {
            handler,
            config,
            metrics: Arc::new(Metrics::new()),
            shards: Arc::new(RwLock::new(HashMap::new())),
            gateway_url: Arc::new(RwLock::new(gateway_url.into())),
            total_shards: total_shards.max(1),
            codec,
            ready: Arc::new(AtomicBool::new(false)),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            router: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Total shards in the deployment (used by the routing formula)
    pub fn total_shards(&self) -> u32 {
        self.total_shards
    }

    pub fn gateway_url(&self) -> String {
        self.gateway_url.read().clone()
    }

    /// Change the gateway URL used by future (non-resume) connections
    pub fn set_gateway_url(&self, url: impl Into<String>) {
        *self.gateway_url.write() = url.into();
    }

    /// Whether every managed shard is Connected (latched by the event router)
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shards.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.read().is_empty()
    }

    pub fn get(&self, id: u32) -> Option<ShardInfo> {
        self.shards.read().get(&id).map(Shard::info)
    }

    /// Snapshot of all shards, ordered by ID
    pub fn shards(&self) -> Vec<ShardInfo> {
        let mut infos: Vec<ShardInfo> = self.shards.read().values().map(Shard::info).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Shard index owning an entity
    pub fn shard_id_for_entity(&self, entity_id: u64) -> u32 {
        shard_for_entity(entity_id, self.total_shards)
    }

    /// The managed shard owning an entity, if this process runs it
    pub fn get_by_entity_id(&self, entity_id: u64) -> Option<ShardInfo> {
        self.get(self.shard_id_for_entity(entity_id))
    }

    fn context(&self) -> ConnectionContext {
        ConnectionContext {
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            events: self.event_tx.clone(),
            gateway_url: self.gateway_url.clone(),
            codec: self.codec,
        }
    }

    /// Register a Dead shard without connecting it.
    ///
    /// Readiness is judged against every registered shard, so register the
    /// whole range before connecting the first one. Returns `false` if the
    /// ID was already registered or lies outside `0..total_shards`.
    pub fn spawn(&self, id: u32) -> bool {
        if self.check_shard_id(id).is_err() {
            warn!("[SHARD-{}] Not registered: outside {} total shards", id, self.total_shards);
            return false;
        }
        let mut shards = self.shards.write();
        if shards.contains_key(&id) {
            return false;
        }
        debug!("[SHARD-{}] Registered", id);
        shards.insert(id, Shard::new(id, self.total_shards, self.context()));
        true
    }

    /// Connect a shard, creating it if needed.
    ///
    /// Resolves once the transport opens. Fails with `AlreadyConnected` if a
    /// live shard has this ID; a Dead shard is revived in place. IDs outside
    /// `0..total_shards` are rejected with a config error.
    pub async fn connect(&self, id: u32) -> Result<(), Error> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        self.check_shard_id(id)?;
        self.ensure_router();

        let opened = {
            let mut shards = self.shards.write();
            let shard = shards
                .entry(id)
                .or_insert_with(|| Shard::new(id, self.total_shards, self.context()));
            if shard.status().is_live() {
                return Err(Error::AlreadyConnected { shard_id: id });
            }
            info!("[SHARD-{}] Connecting", id);
            shard.connect()
        };

        match opened.await {
            Ok(result) => result,
            Err(_) => Err(Error::ShuttingDown),
        }
    }

    fn check_shard_id(&self, id: u32) -> Result<(), Error> {
        if id >= self.total_shards {
            return Err(ConfigError::InvalidSharding(format!(
                "shard {} is outside 0..{}",
                id, self.total_shards
            ))
            .into());
        }
        Ok(())
    }

    /// Disconnect a shard. With `reconnect` it resumes or retries on its own,
    /// even if its connection task had already stopped.
    pub fn dispose(&self, id: u32, reconnect: bool) -> Result<(), Error> {
        self.dispose_with_code(id, reconnect, None)
    }

    /// Disconnect a shard with an explicit close code
    pub fn dispose_with_code(&self, id: u32, reconnect: bool, code: Option<u16>) -> Result<(), Error> {
        let mut shards = self.shards.write();
        let shard = shards
            .get_mut(&id)
            .ok_or(Error::NotConnected { shard_id: id })?;
        info!("[SHARD-{}] Disposing (reconnect={})", id, reconnect);
        shard.disconnect(reconnect, code);
        Ok(())
    }

    /// Send a raw op on one shard. Dropped silently if that shard is not connected.
    pub fn send(&self, id: u32, op: OpCode, d: Value) -> Result<(), Error> {
        let shards = self.shards.read();
        let shard = shards
            .get(&id)
            .ok_or(Error::NotConnected { shard_id: id })?;
        shard.send(op, d);
        Ok(())
    }

    /// Update presence on every shard
    pub fn update_presence(&self, presence: Value) {
        for shard in self.shards.read().values() {
            shard.update_presence(presence.clone());
        }
    }

    /// Join, move or leave a voice channel through the guild's shard
    pub fn update_voice_state(
        &self,
        guild_id: u64,
        channel_id: Option<u64>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), Error> {
        let id = self.shard_id_for_entity(guild_id);
        let shards = self.shards.read();
        let shard = shards
            .get(&id)
            .ok_or(Error::NotConnected { shard_id: id })?;
        let channel_id = channel_id.map(|c| c.to_string());
        shard.update_voice_state(&guild_id.to_string(), channel_id.as_deref(), self_mute, self_deaf);
        Ok(())
    }

    /// Request guild members through the guild's shard
    pub fn request_guild_members(&self, guild_id: u64, request: MemberRequest) -> Result<(), Error> {
        let id = self.shard_id_for_entity(guild_id);
        let shards = self.shards.read();
        let shard = shards
            .get(&id)
            .ok_or(Error::NotConnected { shard_id: id })?;
        shard.request_guild_members(&guild_id.to_string(), request);
        Ok(())
    }

    /// Start the event router if it is not running
    fn ensure_router(&self) {
        let mut router = self.router.lock();
        if router.is_some() {
            return;
        }
        let Some(events) = self.event_rx.lock().take() else {
            return;
        };

        let task = EventRouter {
            handler: self.handler.clone(),
            shards: self.shards.clone(),
            metrics: self.metrics.clone(),
            ready: self.ready.clone(),
            down: HashSet::new(),
        };
        *router = Some(tokio::spawn(task.run(events)));
    }

    /// Hard-disconnect every shard, wait for their tasks, stop the router.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down {} shards", self.len());

        let tasks: Vec<(u32, JoinHandle<()>)> = {
            let mut shards = self.shards.write();
            shards
                .values_mut()
                .filter_map(|shard| {
                    shard.disconnect(false, None);
                    shard.take_task().map(|task| (shard.id(), task))
                })
                .collect()
        };

        for (id, mut task) in tasks {
            if timeout(SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                warn!("[SHARD-{}] Did not stop within {:?}, aborting", id, SHUTDOWN_TIMEOUT);
                task.abort();
            }
        }

        for shard in self.shards.write().values_mut() {
            shard.abort();
        }
        self.ready.store(false, Ordering::Release);

        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
        info!("Shutdown complete");
    }
}

impl<H: EventHandler> Drop for ShardManager<H> {
    fn drop(&mut self) {
        for shard in self.shards.write().values_mut() {
            shard.abort();
        }
        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
    }
}

/// Consumes shard events, calls the handler, owns global readiness
struct EventRouter<H: EventHandler> {
    handler: Arc<H>,
    shards: ShardMap,
    metrics: Arc<Metrics>,
    ready: Arc<AtomicBool>,
    /// Shards that reported a disconnect since their last READY/RESUMED
    down: HashSet<u32>,
}

impl<H: EventHandler> EventRouter<H> {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ShardEvent>) {
        while let Some(event) = events.recv().await {
            self.route(event).await;
        }
        debug!("Event router stopped");
    }

    async fn route(&mut self, event: ShardEvent) {
        let handler = self.handler.clone();
        match event {
            ShardEvent::Connect { shard_id } => {
                self.guard(shard_id, "on_connect", handler.on_connect(shard_id))
                    .await;
            }
            ShardEvent::Hello {
                shard_id,
                heartbeat_interval,
            } => {
                self.guard(shard_id, "on_hello", handler.on_hello(shard_id, heartbeat_interval))
                    .await;
            }
            ShardEvent::Ready {
                shard_id,
                unavailable_guilds,
            } => {
                self.down.remove(&shard_id);
                self.guard(
                    shard_id,
                    "on_shard_ready",
                    handler.on_shard_ready(shard_id, &unavailable_guilds),
                )
                .await;
                self.check_ready().await;
            }
            ShardEvent::Resumed { shard_id } => {
                self.down.remove(&shard_id);
                self.guard(shard_id, "on_shard_resume", handler.on_shard_resume(shard_id))
                    .await;
                self.check_ready().await;
            }
            ShardEvent::Disconnect { shard_id, error } => {
                self.down.insert(shard_id);
                self.guard(
                    shard_id,
                    "on_shard_disconnect",
                    handler.on_shard_disconnect(shard_id, error.as_ref()),
                )
                .await;
                self.check_disconnected().await;
            }
            ShardEvent::Dispatch {
                shard_id,
                event,
                data,
            } => {
                self.guard(shard_id, "on_dispatch", handler.on_dispatch(shard_id, &event, data))
                    .await;
            }
            ShardEvent::GuildAvailable { shard_id, data } => {
                self.guard(
                    shard_id,
                    "on_guild_available",
                    handler.on_guild_available(shard_id, data),
                )
                .await;
            }
            ShardEvent::GuildUnavailable { shard_id, guild_id } => {
                self.guard(
                    shard_id,
                    "on_guild_unavailable",
                    handler.on_guild_unavailable(shard_id, &guild_id),
                )
                .await;
            }
            ShardEvent::Error { shard_id, error } => {
                self.metrics.record_error();
                if error.is_fatal() {
                    error!("[SHARD-{}] {}", shard_id, error);
                }
                self.guard(shard_id, "on_error", handler.on_error(shard_id, &error))
                    .await;
            }
        }
    }

    /// Fire `on_ready` the first time every shard is Connected
    async fn check_ready(&self) {
        let all_ready = {
            let shards = self.shards.read();
            all_connected(shards.values().map(Shard::status))
        };
        if all_ready && !self.ready.swap(true, Ordering::AcqRel) {
            info!("All shards ready");
            let handler = self.handler.clone();
            self.guard_global("on_ready", handler.on_ready()).await;
        }
    }

    /// Fire `on_disconnect` once every shard is down after having been ready
    async fn check_disconnected(&self) {
        let all_down = {
            let shards = self.shards.read();
            !shards.is_empty() && shards.keys().all(|id| self.down.contains(id))
        };
        if all_down && self.ready.swap(false, Ordering::AcqRel) {
            warn!("All shards disconnected");
            let handler = self.handler.clone();
            self.guard_global("on_disconnect", handler.on_disconnect()).await;
        }
    }

    /// Run a handler callback, containing panics
    async fn guard<F: Future<Output = ()>>(&self, shard_id: u32, callback: &str, fut: F) {
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            error!(
                "[SHARD-{}] Handler.{} panicked! Event dropped. Error: {:?}",
                shard_id, callback, panic
            );
            self.metrics.record_error();
        }
    }

    async fn guard_global<F: Future<Output = ()>>(&self, callback: &str, fut: F) {
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            error!("Handler.{} panicked! Error: {:?}", callback, panic);
            self.metrics.record_error();
        }
    }
}

/// True iff there is at least one shard and all of them are Connected
fn all_connected(statuses: impl IntoIterator<Item = ShardStatus>) -> bool {
    let mut any = false;
    for status in statuses {
        if status != ShardStatus::Connected {
            return false;
        }
        any = true;
    }
    any
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct CountingHandler {
        ready: AtomicUsize,
        disconnected: AtomicUsize,
        shard_ready: AtomicUsize,
    }

    impl EventHandler for CountingHandler {
        async fn on_ready(&self) {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_disconnect(&self) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_shard_ready(&self, _shard_id: u32, _unavailable: &HashSet<String>) {
            self.shard_ready.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingHandler;

    impl EventHandler for PanickingHandler {
        async fn on_dispatch(&self, _shard_id: u32, _event: &str, _data: Value) {
            panic!("handler bug");
        }
    }

    fn config() -> GatewayConfig {
        GatewayConfig::builder("test-token-123456").build().unwrap()
    }

    fn manager<H: EventHandler>(handler: H, total: u32) -> ShardManager<H> {
        ShardManager::new(config(), handler, "ws://127.0.0.1:1", total)
    }

    fn router<H: EventHandler>(manager: &ShardManager<H>) -> EventRouter<H> {
        EventRouter {
            handler: manager.handler.clone(),
            shards: manager.shards.clone(),
            metrics: manager.metrics.clone(),
            ready: manager.ready.clone(),
            down: HashSet::new(),
        }
    }

    /// Walk a shard's state machine through Hello and an empty READY
    fn drive_connected<H: EventHandler>(manager: &ShardManager<H>, id: u32) {
        let shards = manager.shards.read();
        let mut state = shards[&id].state().write();
        state.begin_connect();
        state.handle(
            Envelope::new(OpCode::Hello, json!({"heartbeat_interval": 45000})),
            Instant::now(),
        );
        state.handle(
            Envelope::dispatch("READY", 1, json!({"session_id": format!("s{}", id), "guilds": []})),
            Instant::now(),
        );
    }

    fn drive_dead<H: EventHandler>(manager: &ShardManager<H>, id: u32) {
        let shards = manager.shards.read();
        let plan = shards[&id].state().write().disconnect(true);
        assert_eq!(plan, crate::lifecycle::DisconnectPlan::Resume);
    }

    fn ready_event(shard_id: u32) -> ShardEvent {
        ShardEvent::Ready {
            shard_id,
            unavailable_guilds: HashSet::new(),
        }
    }

    #[test]
    fn test_all_connected() {
        assert!(!all_connected(Vec::new()));
        assert!(all_connected(vec![ShardStatus::Connected, ShardStatus::Connected]));
        assert!(!all_connected(vec![ShardStatus::Connected, ShardStatus::WaitingForGuilds]));
    }

    #[test]
    fn test_entity_routing() {
        let manager = manager(CountingHandler::default(), 4);
        assert_eq!(manager.shard_id_for_entity(12345), 0);

        let guild_id: u64 = 175_928_847_299_117_063;
        let expected = ((guild_id >> 22) % 4) as u32;
        assert_eq!(manager.shard_id_for_entity(guild_id), expected);

        assert!(manager.get_by_entity_id(guild_id).is_none());
        manager.spawn(expected);
        assert_eq!(manager.get_by_entity_id(guild_id).map(|s| s.id), Some(expected));
    }

    #[test]
    fn test_dispose_unknown_shard() {
        let manager = manager(CountingHandler::default(), 1);
        assert!(matches!(
            manager.dispose(0, true),
            Err(Error::NotConnected { shard_id: 0 })
        ));
        assert!(matches!(
            manager.request_guild_members(1, MemberRequest::default()),
            Err(Error::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_shard_id_outside_total_is_rejected() {
        let manager = manager(CountingHandler::default(), 4);

        let err = manager.connect(4).await.unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::InvalidSharding(_))));
        assert!(matches!(
            manager.connect(u32::MAX).await,
            Err(Error::Config(_))
        ));
        assert!(!manager.spawn(7));
        assert!(manager.is_empty());
        assert!(manager.get(4).is_none());
    }

    #[tokio::test]
    async fn test_dispose_reconnect_revives_stopped_shard() {
        let manager = manager(CountingHandler::default(), 1);
        manager.spawn(0);
        manager.dispose(0, true).unwrap();

        let info = manager.get(0).unwrap();
        assert_eq!(info.status, ShardStatus::Dead);
        assert_eq!(info.reconnect_attempts, 1);
        assert!(manager.shards.read()[&0].is_running());
        manager.shutdown().await;
    }

    #[test]
    fn test_spawn_registers_once() {
        let manager = manager(CountingHandler::default(), 2);
        assert!(manager.spawn(0));
        assert!(!manager.spawn(0));
        assert!(manager.spawn(1));
        assert_eq!(manager.len(), 2);
        assert!(manager.shards().iter().all(|s| s.status == ShardStatus::Dead));
    }

    #[tokio::test]
    async fn test_connect_twice_fails_without_second_instance() {
        let manager = manager(CountingHandler::default(), 1);
        manager.spawn(0);
        drive_connected(&manager, 0);

        let err = manager.connect(0).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyConnected { shard_id: 0 }));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_global_ready_fires_once() {
        let manager = manager(CountingHandler::default(), 2);
        manager.spawn(0);
        manager.spawn(1);
        let mut router = router(&manager);

        drive_connected(&manager, 0);
        router.route(ready_event(0)).await;
        assert_eq!(manager.handler.ready.load(Ordering::SeqCst), 0);
        assert!(!manager.is_ready());

        drive_connected(&manager, 1);
        router.route(ready_event(1)).await;
        assert_eq!(manager.handler.ready.load(Ordering::SeqCst), 1);
        assert!(manager.is_ready());

        router.route(ready_event(1)).await;
        router.route(ShardEvent::Resumed { shard_id: 0 }).await;
        assert_eq!(manager.handler.ready.load(Ordering::SeqCst), 1);
        assert_eq!(manager.handler.shard_ready.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_global_disconnect_rearms_ready() {
        let manager = manager(CountingHandler::default(), 2);
        manager.spawn(0);
        manager.spawn(1);
        let mut router = router(&manager);

        for id in [0, 1] {
            drive_connected(&manager, id);
            router.route(ready_event(id)).await;
        }
        assert_eq!(manager.handler.ready.load(Ordering::SeqCst), 1);

        for id in [0, 1] {
            drive_dead(&manager, id);
            router
                .route(ShardEvent::Disconnect {
                    shard_id: id,
                    error: None,
                })
                .await;
        }
        assert_eq!(manager.handler.disconnected.load(Ordering::SeqCst), 1);
        assert!(!manager.is_ready());

        for id in [0, 1] {
            drive_connected(&manager, id);
            router.route(ShardEvent::Resumed { shard_id: id }).await;
        }
        assert_eq!(manager.handler.ready.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let manager = manager(PanickingHandler, 1);
        let mut router = router(&manager);

        router
            .route(ShardEvent::Dispatch {
                shard_id: 0,
                event: "MESSAGE_CREATE".into(),
                data: json!({}),
            })
            .await;
        assert_eq!(manager.metrics.errors(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_connects() {
        let manager = manager(CountingHandler::default(), 1);
        manager.shutdown().await;
        assert!(matches!(manager.connect(0).await, Err(Error::ShuttingDown)));
    }
}
