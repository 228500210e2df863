use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Categorizes errors for handler decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that can be passed around without owning the underlying error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket-level failure (connect refused, reset, TLS, protocol)
    Transport,
    /// A single inbound frame could not be decoded
    Decode,
    /// An outbound frame could not be encoded
    Encode,
    /// Transport never opened, or the session never became ready, in time
    HandshakeTimeout,
    /// Previous heartbeat was never acknowledged (zombied connection)
    HeartbeatTimeout,
    /// Server rejected the session; a full identify follows
    SessionInvalid,
    /// Server closed the connection with a recoverable code
    Closed,
    /// Server closed the connection with a code that forbids reconnecting
    UnrecoverableClose,
    /// Shard gave up after too many reconnect attempts
    ReconnectLimit,
    /// Caller tried to connect a shard that is already live
    AlreadyConnected,
    /// Caller addressed a shard that does not exist
    NotConnected,
    /// REST bootstrap failure
    Rest,
    /// Invalid configuration
    Config,
    /// Client is shutting down or already running
    Lifecycle,
}

/// Errors that can occur in the gateway client
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket protocol or I/O error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Transport could not be established
    #[error("Shard {shard_id} connection failed: {reason}")]
    ConnectionFailed { shard_id: u32, reason: String },

    /// Inbound frame could not be decoded (frame dropped)
    #[error("Decode error: {0}")]
    Decode(String),

    /// Outbound frame could not be encoded (frame dropped)
    #[error("Encode error: {0}")]
    Encode(String),

    /// Connect/handshake did not complete within the timeout
    #[error("Shard {shard_id} handshake timed out after {timeout:?}")]
    HandshakeTimeout { shard_id: u32, timeout: Duration },

    /// Heartbeat was not acknowledged before the next tick
    #[error("Shard {shard_id} did not receive a heartbeat ACK, possible zombied connection")]
    HeartbeatTimeout { shard_id: u32 },

    /// Server invalidated the session
    #[error("Shard {shard_id} session was invalidated, re-identifying")]
    SessionInvalid { shard_id: u32 },

    /// Connection closed with a recoverable close code
    #[error("Shard {shard_id} closed with code {code}: {message}")]
    Closed {
        shard_id: u32,
        code: u16,
        message: &'static str,
    },

    /// Connection closed with a code that forbids reconnecting
    #[error("Shard {shard_id} closed with unrecoverable code {code}: {message}")]
    UnrecoverableClose {
        shard_id: u32,
        code: u16,
        message: &'static str,
    },

    /// Shard stopped reconnecting
    #[error("Shard {shard_id} reached the reconnect limit after {attempts} attempts")]
    ReconnectLimit { shard_id: u32, attempts: u32 },

    /// Shard is already live
    #[error("Shard {shard_id} is already connected")]
    AlreadyConnected { shard_id: u32 },

    /// Shard does not exist
    #[error("Shard {shard_id} is not connected")]
    NotConnected { shard_id: u32 },

    /// Gateway client already started
    #[error("Gateway client is already running")]
    AlreadyRunning,

    /// HTTP transport error during REST bootstrap
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// REST endpoint answered with a non-success status
    #[error("REST request to {endpoint} failed with status {status}: {body}")]
    Rest {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// No identify sessions left for the current window
    #[error("Session start limit reached, resets in {reset_after:?}")]
    SessionStartLimit { reset_after: Duration },

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Manager or shard task is shutting down
    #[error("Gateway is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) | Error::ConnectionFailed { .. } => ErrorKind::Transport,
            Error::Decode(_) => ErrorKind::Decode,
            Error::Encode(_) => ErrorKind::Encode,
            Error::HandshakeTimeout { .. } => ErrorKind::HandshakeTimeout,
            Error::HeartbeatTimeout { .. } => ErrorKind::HeartbeatTimeout,
            Error::SessionInvalid { .. } => ErrorKind::SessionInvalid,
            Error::Closed { .. } => ErrorKind::Closed,
            Error::UnrecoverableClose { .. } => ErrorKind::UnrecoverableClose,
            Error::ReconnectLimit { .. } => ErrorKind::ReconnectLimit,
            Error::AlreadyConnected { .. } => ErrorKind::AlreadyConnected,
            Error::NotConnected { .. } => ErrorKind::NotConnected,
            Error::Http(_) | Error::Rest { .. } | Error::SessionStartLimit { .. } => ErrorKind::Rest,
            Error::Config(_) => ErrorKind::Config,
            Error::AlreadyRunning | Error::ShuttingDown => ErrorKind::Lifecycle,
        }
    }

    /// Whether the shard stopped for good and needs the application to step in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::UnrecoverableClose | ErrorKind::ReconnectLimit
        )
    }

    /// Shard this error belongs to, when it is shard-scoped.
    pub fn shard_id(&self) -> Option<u32> {
        match self {
            Error::ConnectionFailed { shard_id, .. }
            | Error::HandshakeTimeout { shard_id, .. }
            | Error::HeartbeatTimeout { shard_id }
            | Error::SessionInvalid { shard_id }
            | Error::Closed { shard_id, .. }
            | Error::UnrecoverableClose { shard_id, .. }
            | Error::ReconnectLimit { shard_id, .. }
            | Error::AlreadyConnected { shard_id }
            | Error::NotConnected { shard_id } => Some(*shard_id),
            _ => None,
        }
    }
}
