use crate::lifecycle::ShardStatus;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Gateway counters and per-shard gauges.
///
/// Counters are lock-free; per-shard gauges sit behind one `RwLock` keyed by
/// shard ID (shard ranges need not start at 0). Use `snapshot()` for a
/// consistent point-in-time view.
///
/// # Example
/// ```ignore
/// let metrics = manager.metrics();
/// println!("Frames received: {}", metrics.frames_received());
///
/// let snapshot = metrics.snapshot();
/// for shard in &snapshot.shards {
///     println!("shard {} {:?} latency={:?}", shard.shard_id, shard.status, shard.latency);
/// }
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    frames_received_total: AtomicU64,
    frames_sent_total: AtomicU64,
    frames_dropped_total: AtomicU64,
    decode_errors_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
    heartbeats_acked_total: AtomicU64,
    zombie_disconnects_total: AtomicU64,
    identifies_total: AtomicU64,
    resumes_total: AtomicU64,
    errors_total: AtomicU64,

    shard_metrics: RwLock<BTreeMap<u32, ShardMetrics>>,
}

/// Gauges for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    pub shard_id: u32,
    pub status: ShardStatus,
    /// Last heartbeat round-trip
    pub latency: Option<Duration>,
    /// Last sequence number seen
    pub sequence: i64,
    /// Consecutive reconnect attempts since the last READY/RESUMED
    pub reconnect_attempts: u32,
    /// Time since the last inbound frame
    pub time_since_last_frame: Option<Duration>,
    #[doc(hidden)]
    pub(crate) last_frame_at: Option<Instant>,
}

impl ShardMetrics {
    fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            status: ShardStatus::Dead,
            latency: None,
            sequence: -1,
            reconnect_attempts: 0,
            time_since_last_frame: None,
            last_frame_at: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ShardStatus::Connected
    }

    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_last_frame: self.last_frame_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Transports opened
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Reconnects scheduled (resume or retry)
    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received_total.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent_total.load(Ordering::Relaxed)
    }

    /// Outbound frames dropped because the shard was not connected or encoding failed
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped_total.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors_total.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    pub fn heartbeats_acked(&self) -> u64 {
        self.heartbeats_acked_total.load(Ordering::Relaxed)
    }

    /// Connections closed because a heartbeat went unacknowledged
    pub fn zombie_disconnects(&self) -> u64 {
        self.zombie_disconnects_total.load(Ordering::Relaxed)
    }

    pub fn identifies(&self) -> u64 {
        self.identifies_total.load(Ordering::Relaxed)
    }

    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_received(&self, shard_id: u32) {
        self.frames_received_total.fetch_add(1, Ordering::Relaxed);
        self.update_shard(shard_id, |s| s.last_frame_at = Some(Instant::now()));
    }

    pub(crate) fn record_frame_sent(&self) {
        self.frames_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_dropped(&self) {
        self.frames_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_error(&self) {
        self.decode_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_sent(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_acked(&self) {
        self.heartbeats_acked_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_zombie_disconnect(&self) {
        self.zombie_disconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_identify(&self) {
        self.identifies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resume(&self) {
        self.resumes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Update gauges for a specific shard, creating the entry on first use
    pub(crate) fn update_shard(&self, shard_id: u32, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();
        let entry = shards
            .entry(shard_id)
            .or_insert_with(|| ShardMetrics::new(shard_id));
        update_fn(entry);
    }

    /// Per-shard gauges, ordered by shard ID
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().values().map(|s| s.snapshot()).collect()
    }

    /// Shards currently Connected
    pub fn active_connections(&self) -> usize {
        self.shard_metrics
            .read()
            .values()
            .filter(|s| s.is_connected())
            .count()
    }

    /// Mean heartbeat latency across shards that have one
    pub fn average_latency(&self) -> Option<Duration> {
        let shards = self.shard_metrics.read();
        let latencies: Vec<Duration> = shards.values().filter_map(|s| s.latency).collect();
        if latencies.is_empty() {
            return None;
        }
        Some(latencies.iter().sum::<Duration>() / latencies.len() as u32)
    }

    /// Point-in-time snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.values().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            frames_received_total: self.frames_received_total.load(Ordering::Acquire),
            frames_sent_total: self.frames_sent_total.load(Ordering::Acquire),
            frames_dropped_total: self.frames_dropped_total.load(Ordering::Acquire),
            decode_errors_total: self.decode_errors_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeats_acked_total: self.heartbeats_acked_total.load(Ordering::Acquire),
            zombie_disconnects_total: self.zombie_disconnects_total.load(Ordering::Acquire),
            identifies_total: self.identifies_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            active_connections: shard_snapshots.iter().filter(|s| s.is_connected()).count(),
            shards: shard_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub frames_received_total: u64,
    pub frames_sent_total: u64,
    pub frames_dropped_total: u64,
    pub decode_errors_total: u64,
    pub heartbeats_sent_total: u64,
    pub heartbeats_acked_total: u64,
    pub zombie_disconnects_total: u64,
    pub identifies_total: u64,
    pub resumes_total: u64,
    pub errors_total: u64,
    pub active_connections: usize,
    pub shards: Vec<ShardMetrics>,
}
