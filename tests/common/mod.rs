//! Shared helpers for gateway integration tests
//!
//! `MockGateway` speaks just enough of the gateway protocol to drive a shard
//! through Hello, Identify/Resume, READY, guild drain and server closes.

#![allow(dead_code)]

use flate2::{Compress, Compression, FlushCompress};
use futures_util::{SinkExt, StreamExt};
use gateway_shard_manager::{EventHandler, Error};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

pub const SESSION_ID: &str = "mock-session";

/// How long helpers wait for something to show up before failing the test
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scripted server behaviour
#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// Guilds listed as unavailable in READY, each followed by a GUILD_CREATE
    pub guilds: Vec<&'static str>,
    /// Close the first session with this code right after the guild drain
    pub close_first_session_with: Option<u16>,
    /// Send zlib-stream compressed binary frames
    pub compress: bool,
}

/// A mock gateway; every client frame (and close code) is recorded
pub struct MockGateway {
    pub addr: SocketAddr,
    frames: mpsc::UnboundedReceiver<Value>,
    sessions: Arc<AtomicUsize>,
    shutdown: Arc<Notify>,
}

impl MockGateway {
    pub async fn start(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let sessions = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(Notify::new());

        let accept_sessions = sessions.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, _)) => {
                            let session = accept_sessions.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(serve(
                                stream,
                                session,
                                options.clone(),
                                frames_tx.clone(),
                                accept_shutdown.clone(),
                            ));
                        }
                        Err(e) => {
                            eprintln!("Accept error: {}", e);
                            break;
                        }
                    },
                    _ = accept_shutdown.notified() => break,
                }
            }
        });

        Self {
            addr,
            frames,
            sessions,
            shutdown,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Transports accepted so far
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Next client frame with the given op, skipping others
    pub async fn expect_op(&mut self, op: u64) -> Value {
        tokio::time::timeout(WAIT, async {
            loop {
                let frame = self.frames.recv().await.expect("mock gateway stopped");
                if frame["op"].as_u64() == Some(op) {
                    return frame;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no op {} frame within {:?}", op, WAIT))
    }

    /// Next close code sent by the client, skipping other frames
    pub async fn expect_close(&mut self) -> Option<u64> {
        tokio::time::timeout(WAIT, async {
            loop {
                let frame = self.frames.recv().await.expect("mock gateway stopped");
                if let Some(close) = frame.get("close") {
                    return close.as_u64();
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no close frame within {:?}", WAIT))
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Server-side frame encoder, optionally sharing one zlib context per connection
struct Outbound {
    compressor: Option<Compress>,
}

impl Outbound {
    fn encode(&mut self, value: &Value) -> Message {
        let text = value.to_string();
        match &mut self.compressor {
            Some(compressor) => {
                let mut out = Vec::with_capacity(text.len() * 2 + 256);
                compressor
                    .compress_vec(text.as_bytes(), &mut out, FlushCompress::Sync)
                    .unwrap();
                Message::Binary(out)
            }
            None => Message::Text(text),
        }
    }
}

fn dispatch(event: &str, seq: u64, d: Value) -> Value {
    json!({"op": 0, "t": event, "s": seq, "d": d})
}

async fn serve(
    stream: TcpStream,
    session: usize,
    options: MockOptions,
    frames: mpsc::UnboundedSender<Value>,
    shutdown: Arc<Notify>,
) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();
    let mut out = Outbound {
        compressor: options
            .compress
            .then(|| Compress::new(Compression::default(), true)),
    };
    let mut seq = 0u64;

    let hello = json!({"op": 10, "d": {"heartbeat_interval": 60_000}});
    if write.send(out.encode(&hello)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(_) => continue,
                    };
                    let _ = frames.send(frame.clone());

                    let mut replies = Vec::new();
                    let mut close = None;
                    match frame["op"].as_u64() {
                        Some(1) => replies.push(json!({"op": 11})),
                        Some(2) => {
                            let guilds: Vec<Value> = options
                                .guilds
                                .iter()
                                .map(|id| json!({"id": id, "unavailable": true}))
                                .collect();
                            seq += 1;
                            replies.push(dispatch(
                                "READY",
                                seq,
                                json!({"session_id": SESSION_ID, "guilds": guilds}),
                            ));
                            for id in &options.guilds {
                                seq += 1;
                                replies.push(dispatch(
                                    "GUILD_CREATE",
                                    seq,
                                    json!({"id": id, "name": format!("guild {}", id)}),
                                ));
                            }
                            if session == 0 {
                                close = options.close_first_session_with;
                            }
                        }
                        Some(6) => {
                            seq = frame["d"]["seq"].as_u64().unwrap_or(0) + 1;
                            replies.push(dispatch("RESUMED", seq, Value::Null));
                        }
                        _ => {}
                    }

                    for reply in replies {
                        if write.send(out.encode(&reply)).await.is_err() {
                            return;
                        }
                    }
                    if let Some(code) = close {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: "".into(),
                        };
                        let _ = write.send(Message::Close(Some(frame))).await;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    let _ = frames.send(json!({"close": code}));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
            _ = shutdown.notified() => break,
        }
    }
}

/// Handler that forwards lifecycle callbacks as short strings
pub struct RecordingHandler {
    events: mpsc::UnboundedSender<String>,
}

impl RecordingHandler {
    pub fn channel() -> (Self, EventLog) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, EventLog { rx })
    }

    fn record(&self, event: String) {
        let _ = self.events.send(event);
    }
}

impl EventHandler for RecordingHandler {
    async fn on_ready(&self) {
        self.record("ready".to_string());
    }

    async fn on_disconnect(&self) {
        self.record("all_disconnected".to_string());
    }

    async fn on_connect(&self, shard_id: u32) {
        self.record(format!("connect:{}", shard_id));
    }

    async fn on_shard_ready(&self, shard_id: u32, unavailable_guilds: &HashSet<String>) {
        self.record(format!("shard_ready:{}:{}", shard_id, unavailable_guilds.len()));
    }

    async fn on_shard_resume(&self, shard_id: u32) {
        self.record(format!("resume:{}", shard_id));
    }

    async fn on_shard_disconnect(&self, shard_id: u32, _error: Option<&Error>) {
        self.record(format!("disconnect:{}", shard_id));
    }

    async fn on_guild_available(&self, shard_id: u32, data: Value) {
        self.record(format!(
            "guild:{}:{}",
            shard_id,
            data["id"].as_str().unwrap_or_default()
        ));
    }
}

/// Receiving side of a `RecordingHandler`
pub struct EventLog {
    rx: mpsc::UnboundedReceiver<String>,
}

impl EventLog {
    /// Wait for `event`, returning everything seen before it (inclusive)
    pub async fn wait_for(&mut self, event: &str) -> Vec<String> {
        let mut seen = Vec::new();
        let found = tokio::time::timeout(WAIT, async {
            loop {
                let next = self.rx.recv().await.expect("handler dropped");
                let done = next == event;
                seen.push(next);
                if done {
                    return;
                }
            }
        })
        .await;
        if found.is_err() {
            panic!("event {:?} not seen within {:?}; got {:?}", event, WAIT, seen);
        }
        seen
    }
}
