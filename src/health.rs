use std::time::{Duration, Instant};

/// Heartbeat bookkeeping for a single connection.
///
/// A connection is considered zombied when the heartbeat timer fires while
/// the previous normal heartbeat is still unacknowledged.
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    /// Whether the last normal heartbeat was acknowledged
    acked: bool,

    /// Time the last heartbeat was sent
    last_sent: Option<Instant>,

    /// Time the last ACK arrived
    last_ack: Option<Instant>,

    /// Time any frame was last received
    last_received: Option<Instant>,

    /// Round-trip time of the most recent acknowledged heartbeat
    latency: Option<Duration>,
}

impl Default for HeartbeatTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatTracker {
    /// Fresh tracker; starts acknowledged so the first tick sends
    pub fn new() -> Self {
        Self {
            acked: true,
            last_sent: None,
            last_ack: None,
            last_received: None,
            latency: None,
        }
    }

    /// Record a heartbeat going out.
    ///
    /// Only normal (timer-driven) heartbeats clear the acknowledged flag;
    /// heartbeats answering a server request do not.
    pub fn record_sent(&mut self, now: Instant, normal: bool) {
        self.last_sent = Some(now);
        if normal {
            self.acked = false;
        }
    }

    /// Record an ACK; latency is measured against the last send
    pub fn record_ack(&mut self, now: Instant) {
        self.acked = true;
        self.last_ack = Some(now);
        if let Some(sent) = self.last_sent {
            self.latency = Some(now.saturating_duration_since(sent));
        }
    }

    /// Record that a frame arrived
    pub fn record_received(&mut self, now: Instant) {
        self.last_received = Some(now);
    }

    /// Whether the previous normal heartbeat was acknowledged
    pub fn is_acked(&self) -> bool {
        self.acked
    }

    /// Latest measured heartbeat round-trip
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }

    pub fn last_received(&self) -> Option<Instant> {
        self.last_received
    }

    /// Forget per-connection state. Latency survives so it can still be
    /// reported while reconnecting.
    pub fn reset(&mut self) {
        self.acked = true;
        self.last_sent = None;
        self.last_ack = None;
        self.last_received = None;
    }
}
