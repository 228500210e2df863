use crate::error::Error;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

/// Trait that users implement to receive gateway events.
///
/// The manager owns connection lifecycle, heartbeats, resumption and
/// readiness tracking; the handler only observes. It is also the sink for
/// entity caches: guild payloads arrive through [`on_guild_available`] and
/// every other dispatch through [`on_dispatch`], uninterpreted.
///
/// Every method has a no-op default. Handlers run on the manager's event
/// router, one event at a time in arrival order; a panicking handler is
/// caught and logged without affecting the shards.
///
/// # Example
///
/// ```ignore
/// use gateway_shard_manager::EventHandler;
/// use serde_json::Value;
///
/// struct Logger;
///
/// impl EventHandler for Logger {
///     async fn on_ready(&self) {
///         println!("all shards ready");
///     }
///
///     async fn on_dispatch(&self, shard_id: u32, event: &str, data: Value) {
///         if event == "MESSAGE_CREATE" {
///             println!("[{}] {}", shard_id, data["content"]);
///         }
///     }
/// }
/// ```
///
/// [`on_guild_available`]: EventHandler::on_guild_available
/// [`on_dispatch`]: EventHandler::on_dispatch
pub trait EventHandler: Send + Sync + 'static {
    /// Every managed shard reached Connected.
    ///
    /// Fires once per readiness cycle: again only after all shards went
    /// down and came back.
    fn on_ready(&self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Every shard disconnected after the client had been ready
    fn on_disconnect(&self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Transport opened
    fn on_connect(&self, _shard_id: u32) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Server Hello received
    fn on_hello(&self, _shard_id: u32, _heartbeat_interval: Duration) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// A shard finished its guild drain (or the grace period ran out).
    ///
    /// `unavailable_guilds` lists guilds that were still missing.
    fn on_shard_ready(
        &self,
        _shard_id: u32,
        _unavailable_guilds: &HashSet<String>,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// A shard resumed its previous session
    fn on_shard_resume(&self, _shard_id: u32) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// A shard's transport went away. Reconnection is already scheduled
    /// unless the error is fatal.
    fn on_shard_disconnect(
        &self,
        _shard_id: u32,
        _error: Option<&Error>,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Any dispatch not consumed by readiness tracking (including READY)
    fn on_dispatch(&self, _shard_id: u32, _event: &str, _data: Value) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Full payload for a guild that was pending or in an outage
    fn on_guild_available(&self, _shard_id: u32, _data: Value) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// A guild went into an outage
    fn on_guild_unavailable(&self, _shard_id: u32, _guild_id: &str) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Non-fatal problems and terminal errors alike.
    ///
    /// Use [`Error::is_fatal`] to spot shards that stopped for good.
    fn on_error(&self, _shard_id: u32, _error: &Error) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Handler that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {}
