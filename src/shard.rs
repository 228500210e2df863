use crate::connection::{Connection, ConnectionContext, ShardCommand};
use crate::error::Error;
use crate::lifecycle::{DisconnectPlan, ShardEvent, ShardInfo, ShardState, ShardStatus};
use crate::protocol::{Envelope, OpCode};
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Commands buffered per shard before sends start being dropped
const COMMAND_BUFFER: usize = 256;

/// Options for a guild member request (op 8)
#[derive(Debug, Clone, Default)]
pub struct MemberRequest {
    /// Username prefix to match; empty with `limit == 0` requests everyone
    pub query: Option<String>,
    /// Explicit user IDs instead of a query
    pub user_ids: Vec<String>,
    pub limit: u32,
    pub presences: bool,
    /// Echoed back in the GUILD_MEMBERS_CHUNK dispatches
    pub nonce: Option<String>,
}

impl MemberRequest {
    fn into_payload(self, guild_id: &str) -> Value {
        let mut d = json!({
            "guild_id": guild_id,
            "limit": self.limit,
            "presences": self.presences,
        });
        if self.user_ids.is_empty() {
            d["query"] = Value::from(self.query.unwrap_or_default());
        } else {
            d["user_ids"] = Value::from(self.user_ids);
        }
        if let Some(nonce) = self.nonce {
            d["nonce"] = Value::from(nonce);
        }
        d
    }
}

/// A single gateway shard.
///
/// The manager owns the `Shard`; the shard's transport is owned by its
/// connection task. State is shared with that task behind a lock so status
/// and session details can be read without a round-trip.
pub struct Shard {
    id: u32,
    state: Arc<RwLock<ShardState>>,
    ctx: ConnectionContext,
    /// Set by the connection task while a transport is open
    open: Arc<AtomicBool>,
    command_tx: Option<mpsc::Sender<ShardCommand>>,
    task: Option<JoinHandle<()>>,
}

impl Shard {
    pub(crate) fn new(id: u32, total_shards: u32, ctx: ConnectionContext) -> Self {
        let state = ShardState::new(id, total_shards, ctx.config.clone());
        Self {
            id,
            state: Arc::new(RwLock::new(state)),
            ctx,
            open: Arc::new(AtomicBool::new(false)),
            command_tx: None,
            task: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn status(&self) -> ShardStatus {
        self.state.read().status()
    }

    pub fn info(&self) -> ShardInfo {
        self.state.read().info()
    }

    /// Whether the connection task is alive
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Start connecting.
    ///
    /// The returned receiver resolves once the transport opens, or with the
    /// error that prevented it. It resolves immediately if already Connected.
    pub fn connect(&mut self) -> oneshot::Receiver<Result<(), Error>> {
        let (tx, rx) = oneshot::channel();

        if !self.state.write().begin_connect() {
            debug!("[SHARD-{}] Already connected", self.id);
            let _ = tx.send(Ok(()));
            return rx;
        }

        let tx = match (&self.command_tx, self.is_running()) {
            (Some(command_tx), true) => match command_tx.try_send(ShardCommand::Connect(Some(tx))) {
                Ok(()) => return rx,
                Err(e) => match e.into_inner() {
                    ShardCommand::Connect(Some(tx)) => tx,
                    _ => return rx,
                },
            },
            _ => tx,
        };

        self.spawn(Some(tx), None);
        rx
    }

    /// Spawn a fresh connection task, replacing any previous one.
    ///
    /// With a `plan` the task first follows it (resume now or wait out the
    /// backoff) instead of connecting straight away.
    fn spawn(
        &mut self,
        opener: Option<oneshot::Sender<Result<(), Error>>>,
        plan: Option<DisconnectPlan>,
    ) {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let connection = Connection::new(
            self.id,
            self.state.clone(),
            self.ctx.clone(),
            self.open.clone(),
            command_rx,
            opener,
        );

        let id = self.id;
        let open = self.open.clone();
        let state = self.state.clone();
        let metrics = self.ctx.metrics.clone();
        let events = self.ctx.events.clone();

        self.task = Some(tokio::spawn(async move {
            let outcome = AssertUnwindSafe(connection.run(plan)).catch_unwind().await;
            open.store(false, Ordering::Release);
            if let Err(panic) = outcome {
                let reason = panic_message(panic.as_ref());
                error!("[SHARD-{}] Connection task panicked: {}", id, reason);
                metrics.record_error();
                state.write().mark_dead();
                let _ = events.send(ShardEvent::Disconnect {
                    shard_id: id,
                    error: Some(Error::ConnectionFailed {
                        shard_id: id,
                        reason: format!("connection task panicked: {}", reason),
                    }),
                });
            }
        }));
        self.command_tx = Some(command_tx);
    }

    /// Tear down the transport.
    ///
    /// With `reconnect` the shard resumes (session present) or retries after
    /// its backoff, starting a connection task if none is running. Without it
    /// the session is discarded and the task stops.
    pub fn disconnect(&mut self, reconnect: bool, code: Option<u16>) {
        if let Some(command_tx) = self.command_tx.as_ref().filter(|_| self.is_running()) {
            match command_tx.try_send(ShardCommand::Disconnect { reconnect, code }) {
                Ok(()) => return,
                Err(e) => warn!("[SHARD-{}] Could not deliver disconnect: {}", self.id, e),
            }
        }

        if !reconnect {
            self.state.write().disconnect(false);
            return;
        }

        let plan = self.state.write().disconnect(true);
        debug!(
            "[SHARD-{}] No connection task, scheduling reconnect: {:?}",
            self.id, plan
        );
        self.spawn(None, Some(plan));
    }

    /// Send a raw op. Dropped (never an error) unless a transport is open.
    pub fn send(&self, op: OpCode, d: Value) {
        self.send_envelope(Envelope::new(op, d));
    }

    fn send_envelope(&self, envelope: Envelope) {
        let live = self.open.load(Ordering::Acquire) && self.is_running();
        let delivered = live
            && self
                .command_tx
                .as_ref()
                .is_some_and(|tx| tx.try_send(ShardCommand::Send(envelope.clone())).is_ok());

        if !delivered {
            debug!(
                "[SHARD-{}] Dropping op {}: transport not open",
                self.id, envelope.op
            );
            self.ctx.metrics.record_frame_dropped();
        }
    }

    /// Update presence now and remember it for future identifies
    pub fn update_presence(&self, presence: Value) {
        let envelope = self.state.write().set_presence(presence);
        self.send_envelope(envelope);
    }

    /// Join, move or leave (`channel_id = None`) a voice channel
    pub fn update_voice_state(
        &self,
        guild_id: &str,
        channel_id: Option<&str>,
        self_mute: bool,
        self_deaf: bool,
    ) {
        self.send(
            OpCode::VoiceStateUpdate,
            json!({
                "guild_id": guild_id,
                "channel_id": channel_id,
                "self_mute": self_mute,
                "self_deaf": self_deaf,
            }),
        );
    }

    /// Ask for guild members; answered with GUILD_MEMBERS_CHUNK dispatches
    pub fn request_guild_members(&self, guild_id: &str, request: MemberRequest) {
        self.send(OpCode::RequestGuildMembers, request.into_payload(guild_id));
    }

    /// Abort the connection task without a close handshake
    pub(crate) fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.command_tx = None;
        self.open.store(false, Ordering::Release);
        self.state.write().mark_dead();
    }

    /// Take the task handle so a caller can await it
    pub(crate) fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &Arc<RwLock<ShardState>> {
        &self.state
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
