//! Gateway wire protocol: op codes, the frame envelope, handshake payloads
//! and the close-code table that drives recovery.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Close code sent when the previous heartbeat was never acknowledged.
pub const ZOMBIE_CLOSE_CODE: u16 = 1012;

/// Close code used when disconnecting with intent to resume the session.
pub const RESUMABLE_CLOSE_CODE: u16 = 4901;

/// Close code used for a clean disconnect that discards the session.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Close code assumed when the transport ends without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Gateway op codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Event dispatch (receive)
    Dispatch = 0,
    /// Heartbeat (send, or server request)
    Heartbeat = 1,
    /// Start a new session (send)
    Identify = 2,
    /// Update presence (send)
    StatusUpdate = 3,
    /// Join/leave/move voice channels (send)
    VoiceStateUpdate = 4,
    /// Resume a previous session (send)
    Resume = 6,
    /// Server asks the client to reconnect (receive)
    Reconnect = 7,
    /// Request offline guild members (send)
    RequestGuildMembers = 8,
    /// Session was invalidated (receive)
    InvalidSession = 9,
    /// First frame on a new connection, carries the heartbeat interval (receive)
    Hello = 10,
    /// Heartbeat acknowledged (receive)
    HeartbeatAck = 11,
}

impl OpCode {
    /// Look up an op code by its wire value
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => OpCode::Dispatch,
            1 => OpCode::Heartbeat,
            2 => OpCode::Identify,
            3 => OpCode::StatusUpdate,
            4 => OpCode::VoiceStateUpdate,
            6 => OpCode::Resume,
            7 => OpCode::Reconnect,
            8 => OpCode::RequestGuildMembers,
            9 => OpCode::InvalidSession,
            10 => OpCode::Hello,
            11 => OpCode::HeartbeatAck,
            _ => return None,
        })
    }

    /// Wire value
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// The frame envelope shared by every gateway message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Op code (raw, so unknown values survive decoding)
    pub op: u8,
    /// Payload
    #[serde(default)]
    pub d: Value,
    /// Sequence number (dispatch only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    /// Event name (dispatch only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl Envelope {
    /// Build an outbound envelope
    pub fn new(op: OpCode, d: Value) -> Self {
        Self {
            op: op.as_u8(),
            d,
            s: None,
            t: None,
        }
    }

    /// Build an outbound envelope from a typed payload
    pub fn from_payload<T: Serialize>(op: OpCode, payload: &T) -> Result<Self, crate::Error> {
        let d = serde_json::to_value(payload).map_err(|e| crate::Error::Encode(e.to_string()))?;
        Ok(Self::new(op, d))
    }

    /// Build an inbound dispatch envelope
    pub fn dispatch(event: impl Into<String>, sequence: u64, d: Value) -> Self {
        Self {
            op: OpCode::Dispatch.as_u8(),
            d,
            s: Some(sequence),
            t: Some(event.into()),
        }
    }

    /// Typed op code, if known
    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u8(self.op)
    }
}

/// Connection properties reported in identify
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Identify payload (op 2)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub properties: IdentifyProperties,
    pub compress: bool,
    pub large_threshold: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
    pub intents: u64,
    pub guild_subscriptions: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,
}

/// Resume payload (op 6)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// Hello payload (op 10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HelloPayload {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
}

/// The parts of the READY dispatch the shard cares about
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    #[serde(default)]
    pub guilds: Vec<GuildStub>,
}

/// Guild reference carried by READY and GUILD_DELETE
#[derive(Debug, Clone, Deserialize)]
pub struct GuildStub {
    pub id: String,
    #[serde(default)]
    pub unavailable: bool,
}

/// How a close code affects the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    /// Human-readable reason
    pub message: &'static str,
    /// Whether reconnecting is allowed at all
    pub recoverable: bool,
    /// Whether the session can no longer be resumed
    pub invalidates_session: bool,
    /// Whether the sequence counter must restart at 0
    pub resets_sequence: bool,
}

/// Classify a close code into a message and recovery policy.
pub fn classify_close(code: u16) -> CloseInfo {
    let (message, recoverable, invalidates_session, resets_sequence) = match code {
        1000 => ("Connection closed normally", true, false, false),
        1001 => ("Server going away", true, false, false),
        1006 => ("Connection reset by peer", true, false, false),
        1012 => ("Heartbeat not acknowledged", true, false, false),
        4000 => ("Unknown gateway error", true, false, false),
        4001 => ("Invalid op code sent", true, false, false),
        4002 => ("Invalid message sent", true, false, false),
        4003 => ("Not authenticated", true, true, false),
        4004 => ("Authentication failed", false, true, false),
        4005 => ("Already authenticated", true, false, false),
        4007 => ("Invalid sequence number", true, false, true),
        4008 => ("Gateway rate limit exceeded", true, false, false),
        4009 => ("Session timed out", true, true, false),
        4010 => ("Invalid shard key", false, true, false),
        4011 => ("Shard has too many guilds (>2500)", false, true, false),
        4012 => ("Invalid gateway version", false, true, false),
        4013 => ("Invalid intents", false, true, false),
        4014 => ("Disallowed intents", false, true, false),
        RESUMABLE_CLOSE_CODE => ("Client reconnect", true, false, false),
        _ => ("Unknown close code", true, false, false),
    };
    CloseInfo {
        code,
        message,
        recoverable,
        invalidates_session,
        resets_sequence,
    }
}

/// Shard index that owns an entity: `(id >> 22) mod total`.
pub fn shard_for_entity(entity_id: u64, total_shards: u32) -> u32 {
    ((entity_id >> 22) % u64::from(total_shards.max(1))) as u32
}
