//! Shard connection state machine.
//!
//! `ShardState` never touches the network or the clock. The connection task
//! feeds it decoded envelopes, close codes and timer expirations, and executes
//! the [`ShardAction`]s it returns. Keeping the transitions here means every
//! exit path of the state machine can be tested without a socket.

use crate::config::GatewayConfig;
use crate::error::Error;
use crate::health::HeartbeatTracker;
use crate::protocol::{
    classify_close, Envelope, GuildStub, HelloPayload, IdentifyPayload, OpCode, ReadyPayload,
    ResumePayload, ABNORMAL_CLOSE_CODE, NORMAL_CLOSE_CODE, ZOMBIE_CLOSE_CODE,
};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Lifecycle status of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardStatus {
    /// No transport; initial state and the state after every disconnect
    #[default]
    Dead,
    /// Transport opening, waiting for Hello
    Handshaking,
    /// Hello received, identify or resume sent
    Nearly,
    /// READY received, waiting for unavailable guilds to stream in
    WaitingForGuilds,
    /// Fully connected
    Connected,
}

impl ShardStatus {
    /// Whether a transport is open or being opened
    pub fn is_live(&self) -> bool {
        !matches!(self, ShardStatus::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShardStatus::Dead => "dead",
            ShardStatus::Handshaking => "handshaking",
            ShardStatus::Nearly => "nearly",
            ShardStatus::WaitingForGuilds => "waiting_for_guilds",
            ShardStatus::Connected => "connected",
        }
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events a shard reports to its manager
#[derive(Debug)]
pub enum ShardEvent {
    /// Transport opened
    Connect { shard_id: u32 },
    /// Hello received
    Hello {
        shard_id: u32,
        heartbeat_interval: Duration,
    },
    /// Shard became ready; carries guilds that never became available
    Ready {
        shard_id: u32,
        unavailable_guilds: HashSet<String>,
    },
    /// Session resumed
    Resumed { shard_id: u32 },
    /// Transport torn down
    Disconnect {
        shard_id: u32,
        error: Option<Error>,
    },
    /// Any dispatch not consumed by readiness tracking
    Dispatch {
        shard_id: u32,
        event: String,
        data: Value,
    },
    /// A guild promised during handshake arrived
    GuildAvailable { shard_id: u32, data: Value },
    /// A guild went into an outage
    GuildUnavailable { shard_id: u32, guild_id: String },
    /// Non-fatal error surfaced for observation
    Error { shard_id: u32, error: Error },
}

impl ShardEvent {
    /// Shard that emitted this event
    pub fn shard_id(&self) -> u32 {
        match self {
            ShardEvent::Connect { shard_id }
            | ShardEvent::Hello { shard_id, .. }
            | ShardEvent::Ready { shard_id, .. }
            | ShardEvent::Resumed { shard_id }
            | ShardEvent::Disconnect { shard_id, .. }
            | ShardEvent::Dispatch { shard_id, .. }
            | ShardEvent::GuildAvailable { shard_id, .. }
            | ShardEvent::GuildUnavailable { shard_id, .. }
            | ShardEvent::Error { shard_id, .. } => *shard_id,
        }
    }
}

/// Side effects requested by the state machine, executed in order
#[derive(Debug)]
pub enum ShardAction {
    /// Write a frame
    Send(Envelope),
    /// (Re)start the repeating heartbeat timer
    StartHeartbeat(Duration),
    /// (Re)start the guild grace timer
    ArmReadyTimer(Duration),
    /// Cancel the guild grace timer
    ClearReadyTimer,
    /// Cancel the connect timeout
    ClearHandshakeTimer,
    /// Report an event upward
    Emit(ShardEvent),
    /// Tear down the transport; remaining actions are discarded
    Disconnect {
        reconnect: bool,
        code: Option<u16>,
        error: Option<Error>,
    },
}

/// What the connection task does after a disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectPlan {
    /// Hard reset done, task exits
    Stop,
    /// Session present, reconnect immediately and resume
    Resume,
    /// No session, reconnect after a delay and identify
    RetryAfter(Duration),
    /// Reconnect limit reached
    GiveUp { attempts: u32 },
}

/// Point-in-time view of a shard
#[derive(Debug, Clone)]
pub struct ShardInfo {
    pub id: u32,
    pub status: ShardStatus,
    pub session_id: Option<String>,
    pub sequence: i64,
    pub latency: Option<Duration>,
    pub unavailable_guilds: HashSet<String>,
    pub reconnect_attempts: u32,
}

/// Per-shard session and connection state
#[derive(Debug)]
pub struct ShardState {
    id: u32,
    total_shards: u32,
    config: Arc<GatewayConfig>,
    status: ShardStatus,
    session_id: Option<String>,
    resume_url: Option<String>,
    sequence: i64,
    close_sequence: Option<i64>,
    heartbeat: HeartbeatTracker,
    heartbeat_interval: Option<Duration>,
    unavailable_guilds: HashSet<String>,
    reconnect_backoff: Duration,
    reconnect_attempts: u32,
    /// Last connection reached READY or RESUMED
    session_opened: bool,
    presence: Option<Value>,
    /// Set once a disconnect is requested so timers cannot request another
    closing: bool,
}

impl ShardState {
    pub fn new(id: u32, total_shards: u32, config: Arc<GatewayConfig>) -> Self {
        let reconnect_backoff = config.backoff.initial_delay;
        let presence = config.presence.clone();
        Self {
            id,
            total_shards,
            config,
            status: ShardStatus::Dead,
            session_id: None,
            resume_url: None,
            sequence: -1,
            close_sequence: None,
            heartbeat: HeartbeatTracker::new(),
            heartbeat_interval: None,
            unavailable_guilds: HashSet::new(),
            reconnect_backoff,
            reconnect_attempts: 0,
            session_opened: false,
            presence,
            closing: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn total_shards(&self) -> u32 {
        self.total_shards
    }

    pub fn status(&self) -> ShardStatus {
        self.status
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Gateway URL to use when resuming, if the server supplied one
    pub fn resume_url(&self) -> Option<&str> {
        self.session_id.as_ref().and(self.resume_url.as_deref())
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn close_sequence(&self) -> Option<i64> {
        self.close_sequence
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn is_heartbeat_acked(&self) -> bool {
        self.heartbeat.is_acked()
    }

    pub fn latency(&self) -> Option<Duration> {
        self.heartbeat.latency()
    }

    pub fn unavailable_guilds(&self) -> &HashSet<String> {
        &self.unavailable_guilds
    }

    pub fn reconnect_backoff(&self) -> Duration {
        self.reconnect_backoff
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn info(&self) -> ShardInfo {
        ShardInfo {
            id: self.id,
            status: self.status,
            session_id: self.session_id.clone(),
            sequence: self.sequence,
            latency: self.heartbeat.latency(),
            unavailable_guilds: self.unavailable_guilds.clone(),
            reconnect_attempts: self.reconnect_attempts,
        }
    }

    fn set_status(&mut self, status: ShardStatus) {
        if self.status != status {
            debug!(
                "[SHARD-{}] Status {} -> {}",
                self.id, self.status, status
            );
            self.status = status;
        }
    }

    /// Enter Handshaking for a new connection attempt.
    ///
    /// Returns `false` (and changes nothing) when already Connected.
    pub fn begin_connect(&mut self) -> bool {
        if self.status == ShardStatus::Connected {
            return false;
        }
        self.set_status(ShardStatus::Handshaking);
        self.heartbeat.reset();
        self.heartbeat_interval = None;
        self.closing = false;
        true
    }

    /// Process one decoded inbound envelope
    pub fn handle(&mut self, envelope: Envelope, now: Instant) -> Vec<ShardAction> {
        self.heartbeat.record_received(now);
        if let Some(seq) = envelope.s {
            self.observe_sequence(seq);
        }

        trace!(
            "[SHARD-{}] <- op {} s={:?} t={:?}",
            self.id,
            envelope.op,
            envelope.s,
            envelope.t
        );

        match envelope.opcode() {
            Some(OpCode::Dispatch) => self.handle_dispatch(envelope),
            Some(OpCode::Heartbeat) => {
                debug!("[SHARD-{}] Server requested a heartbeat", self.id);
                vec![self.heartbeat_action(now, false)]
            }
            Some(OpCode::Reconnect) => {
                info!("[SHARD-{}] Server requested a reconnect", self.id);
                self.request_disconnect(true, None, None)
            }
            Some(OpCode::InvalidSession) => self.handle_invalid_session(&envelope.d),
            Some(OpCode::Hello) => self.handle_hello(envelope.d, now),
            Some(OpCode::HeartbeatAck) => {
                self.heartbeat.record_ack(now);
                trace!(
                    "[SHARD-{}] Heartbeat ACK (latency {:?})",
                    self.id,
                    self.heartbeat.latency()
                );
                Vec::new()
            }
            Some(op) => {
                debug!("[SHARD-{}] Ignoring outbound-only op {:?}", self.id, op);
                Vec::new()
            }
            None => {
                debug!("[SHARD-{}] Ignoring unknown op {}", self.id, envelope.op);
                Vec::new()
            }
        }
    }

    /// Sequence numbers only move forward
    fn observe_sequence(&mut self, seq: u64) {
        let seq = i64::try_from(seq).unwrap_or(i64::MAX);
        if seq > self.sequence {
            if self.sequence >= 0 && seq > self.sequence + 1 {
                debug!(
                    "[SHARD-{}] Sequence gap: {} -> {}",
                    self.id, self.sequence, seq
                );
            }
            self.sequence = seq;
        } else {
            debug!(
                "[SHARD-{}] Ignoring stale sequence {} (current {})",
                self.id, seq, self.sequence
            );
        }
    }

    fn handle_hello(&mut self, d: Value, now: Instant) -> Vec<ShardAction> {
        let hello: HelloPayload = match serde_json::from_value(d) {
            Ok(hello) => hello,
            Err(e) => {
                return vec![self.emit_error(Error::Decode(format!("invalid Hello payload: {}", e)))]
            }
        };

        let interval = Duration::from_millis(hello.heartbeat_interval);
        self.heartbeat_interval = Some(interval);
        self.set_status(ShardStatus::Nearly);
        debug!(
            "[SHARD-{}] Hello received, heartbeat every {:?}",
            self.id, interval
        );

        vec![
            ShardAction::StartHeartbeat(interval),
            self.handshake_action(),
            self.heartbeat_action(now, false),
            ShardAction::Emit(ShardEvent::Hello {
                shard_id: self.id,
                heartbeat_interval: interval,
            }),
        ]
    }

    /// Resume when a session exists, identify otherwise
    fn handshake_action(&self) -> ShardAction {
        let envelope = if self.session_id.is_some() {
            self.resume_envelope()
        } else {
            self.identify_envelope()
        };
        match envelope {
            Ok(envelope) => ShardAction::Send(envelope),
            Err(e) => self.emit_error(e),
        }
    }

    pub fn identify_envelope(&self) -> Result<Envelope, Error> {
        info!(
            "[SHARD-{}] Identifying as shard {}/{}",
            self.id, self.id, self.total_shards
        );
        let payload = IdentifyPayload {
            token: self.config.token.clone(),
            properties: self.config.properties.clone(),
            // Per-payload compression is never requested; zlib-stream is negotiated in the URL
            compress: false,
            large_threshold: self.config.large_threshold,
            shard: Some([self.id, self.total_shards]),
            intents: self.config.intents,
            guild_subscriptions: self.config.guild_subscriptions,
            presence: self.presence.clone(),
        };
        Envelope::from_payload(OpCode::Identify, &payload)
    }

    pub fn resume_envelope(&self) -> Result<Envelope, Error> {
        let session_id = self
            .session_id
            .clone()
            .ok_or(Error::SessionInvalid { shard_id: self.id })?;
        let seq = self.close_sequence.unwrap_or(self.sequence).max(0) as u64;
        info!(
            "[SHARD-{}] Resuming session {} at sequence {}",
            self.id, session_id, seq
        );
        let payload = ResumePayload {
            token: self.config.token.clone(),
            session_id,
            seq,
        };
        Envelope::from_payload(OpCode::Resume, &payload)
    }

    fn heartbeat_action(&mut self, now: Instant, normal: bool) -> ShardAction {
        self.heartbeat.record_sent(now, normal);
        let d = if self.sequence >= 0 {
            Value::from(self.sequence)
        } else {
            Value::Null
        };
        ShardAction::Send(Envelope::new(OpCode::Heartbeat, d))
    }

    fn handle_dispatch(&mut self, envelope: Envelope) -> Vec<ShardAction> {
        let Some(event) = envelope.t else {
            debug!("[SHARD-{}] Dispatch without an event name", self.id);
            return Vec::new();
        };

        match event.as_str() {
            "READY" => self.handle_ready(envelope.d),
            "RESUMED" => {
                info!("[SHARD-{}] Session resumed", self.id);
                self.set_status(ShardStatus::Connected);
                self.reset_reconnect_state();
                vec![
                    ShardAction::ClearHandshakeTimer,
                    ShardAction::Emit(ShardEvent::Resumed { shard_id: self.id }),
                ]
            }
            "GUILD_CREATE" => self.handle_guild_create(envelope.d),
            "GUILD_DELETE" => self.handle_guild_delete(envelope.d),
            _ => vec![self.dispatch(event, envelope.d)],
        }
    }

    fn handle_ready(&mut self, d: Value) -> Vec<ShardAction> {
        let ready: ReadyPayload = match serde_json::from_value(d.clone()) {
            Ok(ready) => ready,
            Err(e) => {
                return vec![self.emit_error(Error::Decode(format!("invalid READY payload: {}", e)))]
            }
        };

        info!(
            "[SHARD-{}] READY (session {}, {} guilds)",
            self.id,
            ready.session_id,
            ready.guilds.len()
        );

        self.session_id = Some(ready.session_id);
        self.resume_url = ready.resume_gateway_url;
        self.unavailable_guilds = ready
            .guilds
            .into_iter()
            .filter(|g| g.unavailable)
            .map(|g| g.id)
            .collect();
        self.set_status(ShardStatus::WaitingForGuilds);
        self.reset_reconnect_state();

        let mut actions = vec![
            ShardAction::ClearHandshakeTimer,
            self.dispatch("READY".to_string(), d),
        ];
        actions.extend(self.check_ready());
        actions
    }

    fn handle_guild_create(&mut self, d: Value) -> Vec<ShardAction> {
        let id = d.get("id").and_then(Value::as_str).map(str::to_owned);
        match id {
            Some(id) if self.unavailable_guilds.remove(&id) => {
                trace!(
                    "[SHARD-{}] Guild {} available ({} remaining)",
                    self.id,
                    id,
                    self.unavailable_guilds.len()
                );
                let mut actions = vec![ShardAction::Emit(ShardEvent::GuildAvailable {
                    shard_id: self.id,
                    data: d,
                })];
                if self.status == ShardStatus::WaitingForGuilds {
                    actions.extend(self.check_ready());
                }
                actions
            }
            _ => vec![self.dispatch("GUILD_CREATE".to_string(), d)],
        }
    }

    fn handle_guild_delete(&mut self, d: Value) -> Vec<ShardAction> {
        match serde_json::from_value::<GuildStub>(d.clone()) {
            Ok(guild) if guild.unavailable => {
                warn!("[SHARD-{}] Guild {} became unavailable", self.id, guild.id);
                self.unavailable_guilds.insert(guild.id.clone());
                vec![ShardAction::Emit(ShardEvent::GuildUnavailable {
                    shard_id: self.id,
                    guild_id: guild.id,
                })]
            }
            _ => vec![self.dispatch("GUILD_DELETE".to_string(), d)],
        }
    }

    fn handle_invalid_session(&mut self, d: &Value) -> Vec<ShardAction> {
        let resumable = d.as_bool().unwrap_or(false);
        if resumable && self.session_id.is_some() {
            warn!("[SHARD-{}] Session invalidated (resumable), resuming", self.id);
            return vec![self.handshake_action()];
        }

        warn!("[SHARD-{}] Session invalidated, re-identifying", self.id);
        self.clear_session();
        vec![
            self.emit_error(Error::SessionInvalid { shard_id: self.id }),
            self.handshake_action(),
        ]
    }

    /// Ready if nothing is pending, otherwise restart the grace timer
    fn check_ready(&mut self) -> Vec<ShardAction> {
        if self.unavailable_guilds.is_empty() {
            return self.mark_ready();
        }
        debug!(
            "[SHARD-{}] Waiting for {} guilds",
            self.id,
            self.unavailable_guilds.len()
        );
        vec![ShardAction::ArmReadyTimer(self.config.connection.ready_timeout)]
    }

    fn mark_ready(&mut self) -> Vec<ShardAction> {
        self.set_status(ShardStatus::Connected);
        info!(
            "[SHARD-{}] Shard ready ({} guilds unavailable)",
            self.id,
            self.unavailable_guilds.len()
        );
        vec![
            ShardAction::ClearReadyTimer,
            ShardAction::Emit(ShardEvent::Ready {
                shard_id: self.id,
                unavailable_guilds: self.unavailable_guilds.clone(),
            }),
        ]
    }

    /// Heartbeat timer fired
    pub fn heartbeat_tick(&mut self, now: Instant) -> Vec<ShardAction> {
        if self.closing {
            return Vec::new();
        }
        if !self.heartbeat.is_acked() {
            warn!(
                "[SHARD-{}] Heartbeat not acknowledged, connection zombied",
                self.id
            );
            return self.request_disconnect(
                true,
                Some(ZOMBIE_CLOSE_CODE),
                Some(Error::HeartbeatTimeout { shard_id: self.id }),
            );
        }
        vec![self.heartbeat_action(now, true)]
    }

    /// Guild grace timer fired
    pub fn ready_timeout_elapsed(&mut self) -> Vec<ShardAction> {
        if self.status != ShardStatus::WaitingForGuilds {
            return Vec::new();
        }
        warn!(
            "[SHARD-{}] Guild grace period elapsed with {} guilds unavailable",
            self.id,
            self.unavailable_guilds.len()
        );
        self.mark_ready()
    }

    /// Connect timeout fired before READY/RESUMED
    pub fn handshake_timed_out(&mut self) -> Vec<ShardAction> {
        if self.closing || matches!(self.status, ShardStatus::Connected | ShardStatus::WaitingForGuilds) {
            return Vec::new();
        }
        warn!("[SHARD-{}] Handshake timed out in {}", self.id, self.status);
        let timeout = self.config.connection.connect_timeout;
        self.request_disconnect(
            true,
            None,
            Some(Error::HandshakeTimeout {
                shard_id: self.id,
                timeout,
            }),
        )
    }

    /// Transport closed by the server (or ended without a close frame)
    pub fn handle_close(&mut self, code: Option<u16>) -> Vec<ShardAction> {
        if self.closing {
            return Vec::new();
        }
        let info = classify_close(code.unwrap_or(ABNORMAL_CLOSE_CODE));

        if info.resets_sequence {
            self.sequence = 0;
            self.close_sequence = None;
        }
        if info.invalidates_session {
            self.clear_session();
        }

        if !info.recoverable {
            error!(
                "[SHARD-{}] Closed with unrecoverable code {}: {}",
                self.id, info.code, info.message
            );
            let shard_id = self.id;
            let error = move || Error::UnrecoverableClose {
                shard_id,
                code: info.code,
                message: info.message,
            };
            let mut actions = vec![self.emit_error(error())];
            actions.extend(self.request_disconnect(false, None, Some(error())));
            return actions;
        }

        let error = if info.code == NORMAL_CLOSE_CODE {
            info!("[SHARD-{}] Connection closed normally", self.id);
            None
        } else {
            warn!(
                "[SHARD-{}] Closed with code {}: {}",
                self.id, info.code, info.message
            );
            Some(Error::Closed {
                shard_id: self.id,
                code: info.code,
                message: info.message,
            })
        };
        self.request_disconnect(true, None, error)
    }

    fn request_disconnect(
        &mut self,
        reconnect: bool,
        code: Option<u16>,
        error: Option<Error>,
    ) -> Vec<ShardAction> {
        self.closing = true;
        vec![ShardAction::Disconnect {
            reconnect,
            code,
            error,
        }]
    }

    /// Transport is gone; decide what happens next.
    pub fn disconnect(&mut self, reconnect: bool) -> DisconnectPlan {
        self.set_status(ShardStatus::Dead);
        self.heartbeat.reset();
        self.heartbeat_interval = None;
        self.unavailable_guilds.clear();
        self.closing = false;
        if self.sequence >= 0 {
            self.close_sequence = Some(self.sequence);
        }

        if !reconnect {
            self.hard_reset();
            return DisconnectPlan::Stop;
        }

        if let Some(max) = self.config.connection.max_reconnect_attempts {
            if self.reconnect_attempts >= max {
                let attempts = self.reconnect_attempts;
                error!(
                    "[SHARD-{}] Giving up after {} reconnect attempts",
                    self.id, attempts
                );
                self.reconnect_attempts = 0;
                return DisconnectPlan::GiveUp { attempts };
            }
        }
        self.reconnect_attempts += 1;

        // Only a session that actually opened earns an immediate resume
        let opened = std::mem::take(&mut self.session_opened);
        if opened && self.session_id.is_some() {
            debug!("[SHARD-{}] Reconnecting to resume session", self.id);
            return DisconnectPlan::Resume;
        }

        let delay = self.reconnect_backoff;
        self.reconnect_backoff = self
            .config
            .backoff
            .next_delay(delay, rand::random::<f64>());
        debug!(
            "[SHARD-{}] Reconnecting in {:?} (next backoff {:?})",
            self.id, delay, self.reconnect_backoff
        );
        DisconnectPlan::RetryAfter(delay)
    }

    /// Forget the session completely; the next connect identifies.
    pub fn hard_reset(&mut self) {
        self.clear_session();
        self.reconnect_backoff = self.config.backoff.initial_delay;
        self.reconnect_attempts = 0;
        self.session_opened = false;
    }

    /// Task ended abnormally; mark dead without touching the session
    pub(crate) fn mark_dead(&mut self) {
        self.set_status(ShardStatus::Dead);
        self.heartbeat.reset();
        self.heartbeat_interval = None;
        self.closing = false;
    }

    fn clear_session(&mut self) {
        self.session_id = None;
        self.resume_url = None;
        self.sequence = -1;
        self.close_sequence = None;
    }

    fn reset_reconnect_state(&mut self) {
        self.reconnect_backoff = self.config.backoff.initial_delay;
        self.reconnect_attempts = 0;
        self.session_opened = true;
    }

    /// Store the presence for future identifies and build the update frame
    pub fn set_presence(&mut self, presence: Value) -> Envelope {
        self.presence = Some(presence.clone());
        Envelope::new(OpCode::StatusUpdate, presence)
    }

    fn dispatch(&self, event: String, data: Value) -> ShardAction {
        ShardAction::Emit(ShardEvent::Dispatch {
            shard_id: self.id,
            event,
            data,
        })
    }

    fn emit_error(&self, error: Error) -> ShardAction {
        ShardAction::Emit(ShardEvent::Error {
            shard_id: self.id,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, GatewayConfig};
    use crate::protocol::RESUMABLE_CLOSE_CODE;
    use serde_json::json;

    fn config() -> Arc<GatewayConfig> {
        Arc::new(
            GatewayConfig::builder("test-token-123456")
                .intents(513)
                .build()
                .unwrap(),
        )
    }

    fn sends(actions: &[ShardAction]) -> Vec<&Envelope> {
        actions
            .iter()
            .filter_map(|a| match a {
                ShardAction::Send(env) => Some(env),
                _ => None,
            })
            .collect()
    }

    fn hello(state: &mut ShardState) -> Vec<ShardAction> {
        state.begin_connect();
        state.handle(
            Envelope::new(OpCode::Hello, json!({"heartbeat_interval": 41250})),
            Instant::now(),
        )
    }

    fn ready(state: &mut ShardState, guilds: &[&str]) -> Vec<ShardAction> {
        let guilds: Vec<_> = guilds
            .iter()
            .map(|id| json!({"id": id, "unavailable": true}))
            .collect();
        state.handle(
            Envelope::dispatch(
                "READY",
                1,
                json!({
                    "session_id": "abc",
                    "resume_gateway_url": "wss://resume.example",
                    "guilds": guilds,
                }),
            ),
            Instant::now(),
        )
    }

    fn guild_create(state: &mut ShardState, seq: u64, id: &str) -> Vec<ShardAction> {
        state.handle(
            Envelope::dispatch("GUILD_CREATE", seq, json!({"id": id, "name": "g"})),
            Instant::now(),
        )
    }

    fn emitted_ready(actions: &[ShardAction]) -> Option<&HashSet<String>> {
        actions.iter().find_map(|a| match a {
            ShardAction::Emit(ShardEvent::Ready {
                unavailable_guilds, ..
            }) => Some(unavailable_guilds),
            _ => None,
        })
    }

    #[test]
    fn test_hello_identifies_without_session() {
        let mut state = ShardState::new(1, 4, config());
        let actions = hello(&mut state);

        assert_eq!(state.status(), ShardStatus::Nearly);
        assert!(matches!(actions[0], ShardAction::StartHeartbeat(d) if d == Duration::from_millis(41250)));

        let sent = sends(&actions);
        assert_eq!(sent[0].opcode(), Some(OpCode::Identify));
        assert_eq!(sent[0].d["shard"], json!([1, 4]));
        assert_eq!(sent[0].d["token"], json!("test-token-123456"));
        assert_eq!(sent[0].d["intents"], json!(513));
        assert_eq!(sent[1].opcode(), Some(OpCode::Heartbeat));
        assert_eq!(sent[1].d, Value::Null);
        // Immediate heartbeat does not arm zombie detection
        assert!(state.is_heartbeat_acked());
    }

    #[test]
    fn test_hello_resumes_with_session() {
        let mut state = ShardState::new(0, 1, config());
        hello(&mut state);
        ready(&mut state, &[]);
        state.handle(Envelope::dispatch("MESSAGE_CREATE", 7, json!({})), Instant::now());
        assert_eq!(state.disconnect(true), DisconnectPlan::Resume);

        let actions = hello(&mut state);
        let sent = sends(&actions);
        assert_eq!(sent[0].opcode(), Some(OpCode::Resume));
        assert_eq!(sent[0].d["session_id"], json!("abc"));
        assert_eq!(sent[0].d["seq"], json!(7));
        assert_eq!(state.resume_url(), Some("wss://resume.example"));
    }

    #[test]
    fn test_sequence_only_moves_forward() {
        let mut state = ShardState::new(0, 1, config());
        let now = Instant::now();
        for seq in [1, 2, 2, 5, 9] {
            state.handle(Envelope::dispatch("TYPING_START", seq, json!({})), now);
            assert_eq!(state.sequence(), seq as i64);
        }
        state.handle(Envelope::dispatch("TYPING_START", 3, json!({})), now);
        assert_eq!(state.sequence(), 9);
    }

    #[test]
    fn test_zombie_disconnects_exactly_once() {
        let mut state = ShardState::new(0, 1, config());
        hello(&mut state);
        let now = Instant::now();

        let first = state.heartbeat_tick(now);
        assert_eq!(sends(&first)[0].opcode(), Some(OpCode::Heartbeat));
        assert!(!state.is_heartbeat_acked());

        let second = state.heartbeat_tick(now + Duration::from_secs(41));
        assert_eq!(second.len(), 1);
        match &second[0] {
            ShardAction::Disconnect {
                reconnect,
                code,
                error,
            } => {
                assert!(*reconnect);
                assert_eq!(*code, Some(ZOMBIE_CLOSE_CODE));
                assert!(matches!(error, Some(Error::HeartbeatTimeout { shard_id: 0 })));
            }
            other => panic!("expected disconnect, got {:?}", other),
        }

        assert!(state.heartbeat_tick(now + Duration::from_secs(82)).is_empty());
    }

    #[test]
    fn test_heartbeat_ack_records_latency() {
        let mut state = ShardState::new(0, 1, config());
        hello(&mut state);
        let sent_at = Instant::now();
        state.heartbeat_tick(sent_at);
        state.handle(
            Envelope::new(OpCode::HeartbeatAck, Value::Null),
            sent_at + Duration::from_millis(80),
        );
        assert!(state.is_heartbeat_acked());
        assert_eq!(state.latency(), Some(Duration::from_millis(80)));
        assert!(!state.heartbeat_tick(sent_at + Duration::from_secs(41)).is_empty());
    }

    #[test]
    fn test_guild_drain_marks_ready() {
        let mut state = ShardState::new(0, 1, config());
        hello(&mut state);
        let actions = ready(&mut state, &["A", "B"]);
        assert_eq!(state.status(), ShardStatus::WaitingForGuilds);
        assert!(actions.iter().any(|a| matches!(a, ShardAction::ArmReadyTimer(_))));
        assert!(emitted_ready(&actions).is_none());

        let actions = guild_create(&mut state, 2, "A");
        assert_eq!(state.status(), ShardStatus::WaitingForGuilds);
        assert!(actions.iter().any(|a| matches!(a, ShardAction::ArmReadyTimer(_))));

        let actions = guild_create(&mut state, 3, "B");
        assert_eq!(state.status(), ShardStatus::Connected);
        assert!(emitted_ready(&actions).expect("ready emitted").is_empty());
        assert!(actions.iter().any(|a| matches!(a, ShardAction::ClearReadyTimer)));
    }

    #[test]
    fn test_ready_without_guilds_is_immediate() {
        let mut state = ShardState::new(0, 1, config());
        hello(&mut state);
        let actions = ready(&mut state, &[]);
        assert_eq!(state.status(), ShardStatus::Connected);
        assert!(emitted_ready(&actions).is_some());
        assert!(actions.iter().any(|a| matches!(a, ShardAction::ClearHandshakeTimer)));
    }

    #[test]
    fn test_grace_timeout_carries_remaining_guilds() {
        let mut state = ShardState::new(0, 1, config());
        hello(&mut state);
        ready(&mut state, &["A", "B"]);
        guild_create(&mut state, 2, "B");

        let actions = state.ready_timeout_elapsed();
        assert_eq!(state.status(), ShardStatus::Connected);
        let pending = emitted_ready(&actions).expect("ready emitted");
        assert_eq!(pending.len(), 1);
        assert!(pending.contains("A"));

        // Late arrival is still reported as available, but ready does not fire again
        let actions = guild_create(&mut state, 3, "A");
        assert!(matches!(actions[0], ShardAction::Emit(ShardEvent::GuildAvailable { .. })));
        assert!(emitted_ready(&actions).is_none());
        assert!(state.ready_timeout_elapsed().is_empty());
    }

    #[test]
    fn test_unknown_guild_create_is_plain_dispatch() {
        let mut state = ShardState::new(0, 1, config());
        hello(&mut state);
        ready(&mut state, &[]);
        let actions = guild_create(&mut state, 2, "new-guild");
        assert!(matches!(
            &actions[0],
            ShardAction::Emit(ShardEvent::Dispatch { event, .. }) if event == "GUILD_CREATE"
        ));
    }

    #[test]
    fn test_guild_outage_round_trip() {
        let mut state = ShardState::new(0, 1, config());
        hello(&mut state);
        ready(&mut state, &[]);

        let actions = state.handle(
            Envelope::dispatch("GUILD_DELETE", 2, json!({"id": "G", "unavailable": true})),
            Instant::now(),
        );
        assert!(matches!(
            &actions[0],
            ShardAction::Emit(ShardEvent::GuildUnavailable { guild_id, .. }) if guild_id == "G"
        ));
        assert!(state.unavailable_guilds().contains("G"));

        let actions = guild_create(&mut state, 3, "G");
        assert!(matches!(actions[0], ShardAction::Emit(ShardEvent::GuildAvailable { .. })));
        assert!(state.unavailable_guilds().is_empty());
    }

    #[test]
    fn test_hard_reset_then_identify() {
        let mut state = ShardState::new(0, 1, config());
        hello(&mut state);
        ready(&mut state, &[]);
        assert!(state.session_id().is_some());

        assert_eq!(state.disconnect(false), DisconnectPlan::Stop);
        assert_eq!(state.session_id(), None);
        assert_eq!(state.sequence(), -1);
        assert_eq!(state.status(), ShardStatus::Dead);

        let actions = hello(&mut state);
        let ops: Vec<_> = sends(&actions).iter().map(|e| e.opcode()).collect();
        assert!(ops.contains(&Some(OpCode::Identify)));
        assert!(!ops.contains(&Some(OpCode::Resume)));
    }

    #[test]
    fn test_backoff_grows_until_cap_and_resets_on_ready() {
        let mut state = ShardState::new(0, 1, config());
        let mut last = Duration::ZERO;
        let mut delays = Vec::new();

        for _ in 0..20 {
            state.begin_connect();
            match state.disconnect(true) {
                DisconnectPlan::RetryAfter(delay) => {
                    assert!(delay >= last);
                    assert!(delay <= Duration::from_millis(30_000));
                    last = delay;
                    delays.push(delay);
                }
                other => panic!("expected retry, got {:?}", other),
            }
        }
        assert_eq!(delays[0], Duration::from_millis(7_000));
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(30_000));

        hello(&mut state);
        ready(&mut state, &[]);
        assert_eq!(state.reconnect_backoff(), Duration::from_millis(7_000));
        assert_eq!(state.reconnect_attempts(), 0);
    }

    #[test]
    fn test_reconnect_limit() {
        let config = GatewayConfig::builder("test-token-123456")
            .connection(ConnectionConfig {
                max_reconnect_attempts: Some(2),
                ..Default::default()
            })
            .build()
            .unwrap();
        let mut state = ShardState::new(0, 1, Arc::new(config));

        assert!(matches!(state.disconnect(true), DisconnectPlan::RetryAfter(_)));
        assert!(matches!(state.disconnect(true), DisconnectPlan::RetryAfter(_)));
        assert_eq!(state.disconnect(true), DisconnectPlan::GiveUp { attempts: 2 });
    }

    #[test]
    fn test_unrecoverable_close() {
        let mut state = ShardState::new(0, 1, config());
        hello(&mut state);
        ready(&mut state, &[]);

        let actions = state.handle_close(Some(4004));
        assert_eq!(state.session_id(), None);
        assert!(matches!(
            &actions[0],
            ShardAction::Emit(ShardEvent::Error { error, .. }) if error.is_fatal()
        ));
        assert!(matches!(
            actions[1],
            ShardAction::Disconnect { reconnect: false, .. }
        ));
        assert!(state.handle_close(Some(4004)).is_empty());
    }

    #[test]
    fn test_invalid_sequence_close_resets() {
        let mut state = ShardState::new(0, 1, config());
        hello(&mut state);
        ready(&mut state, &[]);

        let actions = state.handle_close(Some(4007));
        assert!(matches!(
            &actions[0],
            ShardAction::Disconnect { reconnect: true, error: Some(Error::Closed { code: 4007, .. }), .. }
        ));
        assert_eq!(state.sequence(), 0);
        assert_eq!(state.session_id(), Some("abc"));
        assert_eq!(state.disconnect(true), DisconnectPlan::Resume);

        let actions = hello(&mut state);
        let resume = sends(&actions)[0];
        assert_eq!(resume.opcode(), Some(OpCode::Resume));
        assert_eq!(resume.d["seq"], json!(0));
    }

    #[test]
    fn test_failed_resumes_wait_for_backoff() {
        let mut state = ShardState::new(0, 1, config());
        hello(&mut state);
        ready(&mut state, &[]);
        assert_eq!(state.disconnect(true), DisconnectPlan::Resume);

        // Each attempt dies before RESUMED, e.g. the transport never opens
        let mut last = Duration::ZERO;
        for _ in 0..3 {
            state.begin_connect();
            match state.disconnect(true) {
                DisconnectPlan::RetryAfter(delay) => {
                    assert!(delay >= Duration::from_millis(7_000));
                    assert!(delay >= last);
                    last = delay;
                }
                other => panic!("expected backoff, got {:?}", other),
            }
        }
        assert_eq!(state.session_id(), Some("abc"));
        assert!(state.reconnect_backoff() >= last);

        hello(&mut state);
        let actions = state.handle(Envelope::dispatch("RESUMED", 2, json!({})), Instant::now());
        assert!(matches!(actions[1], ShardAction::Emit(ShardEvent::Resumed { shard_id: 0 })));
        assert_eq!(state.disconnect(true), DisconnectPlan::Resume);
    }

    #[test]
    fn test_recoverable_close_keeps_session() {
        let mut state = ShardState::new(0, 1, config());
        hello(&mut state);
        ready(&mut state, &[]);

        let actions = state.handle_close(Some(RESUMABLE_CLOSE_CODE));
        assert!(matches!(actions[0], ShardAction::Disconnect { reconnect: true, .. }));
        assert_eq!(state.session_id(), Some("abc"));
        assert_eq!(state.disconnect(true), DisconnectPlan::Resume);

        let normal = {
            state.begin_connect();
            state.handle_close(Some(NORMAL_CLOSE_CODE))
        };
        assert!(matches!(normal[0], ShardAction::Disconnect { error: None, .. }));
    }

    #[test]
    fn test_invalid_session_reidentifies() {
        let mut state = ShardState::new(0, 1, config());
        hello(&mut state);
        ready(&mut state, &[]);

        let actions = state.handle(Envelope::new(OpCode::InvalidSession, json!(true)), Instant::now());
        assert_eq!(sends(&actions)[0].opcode(), Some(OpCode::Resume));

        let actions = state.handle(Envelope::new(OpCode::InvalidSession, json!(false)), Instant::now());
        assert_eq!(state.session_id(), None);
        assert!(matches!(
            &actions[0],
            ShardAction::Emit(ShardEvent::Error { error: Error::SessionInvalid { .. }, .. })
        ));
        assert_eq!(sends(&actions)[0].opcode(), Some(OpCode::Identify));
    }

    #[test]
    fn test_server_heartbeat_request_and_reconnect() {
        let mut state = ShardState::new(0, 1, config());
        hello(&mut state);
        state.heartbeat_tick(Instant::now());

        let actions = state.handle(Envelope::new(OpCode::Heartbeat, Value::Null), Instant::now());
        assert_eq!(sends(&actions)[0].opcode(), Some(OpCode::Heartbeat));

        let actions = state.handle(Envelope::new(OpCode::Reconnect, Value::Null), Instant::now());
        assert!(matches!(actions[0], ShardAction::Disconnect { reconnect: true, code: None, .. }));
    }

    #[test]
    fn test_handshake_timeout_only_before_ready() {
        let mut state = ShardState::new(0, 1, config());
        state.begin_connect();
        let actions = state.handshake_timed_out();
        assert!(matches!(
            &actions[0],
            ShardAction::Disconnect { error: Some(Error::HandshakeTimeout { .. }), .. }
        ));

        state.disconnect(true);
        hello(&mut state);
        ready(&mut state, &[]);
        assert!(state.handshake_timed_out().is_empty());
    }

    #[test]
    fn test_begin_connect_is_noop_when_connected() {
        let mut state = ShardState::new(0, 1, config());
        assert!(state.begin_connect());
        hello(&mut state);
        ready(&mut state, &[]);
        assert!(!state.begin_connect());
        assert_eq!(state.status(), ShardStatus::Connected);
    }

    #[test]
    fn test_presence_is_used_in_next_identify() {
        let mut state = ShardState::new(0, 1, config());
        let update = state.set_presence(json!({"status": "idle"}));
        assert_eq!(update.opcode(), Some(OpCode::StatusUpdate));

        let identify = state.identify_envelope().unwrap();
        assert_eq!(identify.d["presence"]["status"], json!("idle"));
    }
}
