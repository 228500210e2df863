use crate::codec::{FrameCodec, FrameDecoder};
use crate::config::{Encoding, GatewayConfig};
use crate::error::Error;
use crate::lifecycle::{DisconnectPlan, ShardAction, ShardEvent, ShardState};
use crate::metrics::Metrics;
use crate::protocol::{
    Envelope, OpCode, NORMAL_CLOSE_CODE, RESUMABLE_CLOSE_CODE, ZOMBIE_CLOSE_CODE,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use http::{header, HeaderValue};
use parking_lot::RwLock;
use std::future::pending;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, Duration, Interval, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Commands the shard handle sends to its connection task
#[derive(Debug)]
pub enum ShardCommand {
    /// Connect now; wakes a task waiting out its backoff
    Connect(Option<oneshot::Sender<Result<(), Error>>>),
    /// Write a frame (dropped unless a transport is open)
    Send(Envelope),
    /// Tear down the transport
    Disconnect { reconnect: bool, code: Option<u16> },
}

/// Shared pieces every connection task needs
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub config: Arc<GatewayConfig>,
    pub metrics: Arc<Metrics>,
    pub events: mpsc::UnboundedSender<ShardEvent>,
    pub gateway_url: Arc<RwLock<String>>,
    pub codec: FrameCodec,
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Why a connection ended
#[derive(Debug)]
struct SessionEnd {
    reconnect: bool,
    error: Option<Error>,
}

/// Timers owned by one connection; dropping this cancels all of them
#[derive(Default)]
struct Timers {
    heartbeat: Option<Interval>,
    ready: Option<Pin<Box<Sleep>>>,
    handshake: Option<Pin<Box<Sleep>>>,
}

/// Drives one shard: connects, runs the session, reconnects per the state machine
pub(crate) struct Connection {
    shard_id: u32,
    state: Arc<RwLock<ShardState>>,
    ctx: ConnectionContext,
    /// Shared with the shard handle; true between upgrade and teardown
    open: Arc<AtomicBool>,
    command_rx: mpsc::Receiver<ShardCommand>,
    /// Caller waiting for the transport to open
    opener: Option<oneshot::Sender<Result<(), Error>>>,
}

impl Connection {
    pub fn new(
        shard_id: u32,
        state: Arc<RwLock<ShardState>>,
        ctx: ConnectionContext,
        open: Arc<AtomicBool>,
        command_rx: mpsc::Receiver<ShardCommand>,
        opener: Option<oneshot::Sender<Result<(), Error>>>,
    ) -> Self {
        Self {
            shard_id,
            state,
            ctx,
            open,
            command_rx,
            opener,
        }
    }

    /// Run until told to stop or the reconnect limit is hit.
    ///
    /// A `pending` plan is followed before the first connection attempt.
    pub async fn run(mut self, mut pending: Option<DisconnectPlan>) {
        loop {
            if let Some(plan) = pending.take() {
                if !self.follow(plan).await {
                    return;
                }
            }
            if !self.drain_stale_commands() {
                info!("[SHARD-{}] Stopped before reconnecting", self.shard_id);
                return;
            }

            let resume_url = {
                let mut state = self.state.write();
                if !state.begin_connect() {
                    drop(state);
                    warn!(
                        "[SHARD-{}] Already connected, not opening another transport",
                        self.shard_id
                    );
                    if let Some(tx) = self.opener.take() {
                        let _ = tx.send(Ok(()));
                    }
                    return;
                }
                state.resume_url().map(str::to_owned)
            };
            self.sync_metrics();

            let end = self.connect_and_run(resume_url).await;
            self.open.store(false, Ordering::Release);

            let plan = self.state.write().disconnect(end.reconnect);
            self.sync_metrics();
            self.emit(ShardEvent::Disconnect {
                shard_id: self.shard_id,
                error: end.error,
            });
            pending = Some(plan);
        }
    }

    /// Act on a disconnect plan. Returns `false` once the task should exit.
    async fn follow(&mut self, plan: DisconnectPlan) -> bool {
        match plan {
            DisconnectPlan::Stop => {
                info!("[SHARD-{}] Stopped", self.shard_id);
                false
            }
            DisconnectPlan::GiveUp { attempts } => {
                error!(
                    "[SHARD-{}] Max reconnection attempts ({}) reached",
                    self.shard_id, attempts
                );
                self.emit(ShardEvent::Error {
                    shard_id: self.shard_id,
                    error: Error::ReconnectLimit {
                        shard_id: self.shard_id,
                        attempts,
                    },
                });
                false
            }
            DisconnectPlan::Resume => {
                self.ctx.metrics.record_reconnection();
                debug!("[SHARD-{}] Reconnecting immediately to resume", self.shard_id);
                true
            }
            DisconnectPlan::RetryAfter(delay) => {
                self.ctx.metrics.record_reconnection();
                debug!("[SHARD-{}] Reconnecting in {:?}", self.shard_id, delay);
                let proceed = self.wait_for_retry(delay).await;
                if !proceed {
                    info!("[SHARD-{}] Stopped while waiting to reconnect", self.shard_id);
                }
                proceed
            }
        }
    }

    /// Clear commands queued for a transport that is gone. Sends are dropped.
    /// Returns `false` if a queued disconnect asked the shard to stop.
    fn drain_stale_commands(&mut self) -> bool {
        while let Ok(cmd) = self.command_rx.try_recv() {
            match cmd {
                ShardCommand::Send(envelope) => {
                    debug!(
                        "[SHARD-{}] Dropping op {} queued for a closed transport",
                        self.shard_id, envelope.op
                    );
                    self.ctx.metrics.record_frame_dropped();
                }
                ShardCommand::Connect(opener) => {
                    if let Some(tx) = opener {
                        self.opener = Some(tx);
                    }
                }
                ShardCommand::Disconnect { reconnect: false, .. } => {
                    self.state.write().disconnect(false);
                    self.sync_metrics();
                    return false;
                }
                ShardCommand::Disconnect { .. } => {}
            }
        }
        true
    }

    /// Sleep out the backoff. Returns `false` if the shard should stop instead.
    async fn wait_for_retry(&mut self, delay: Duration) -> bool {
        let backoff = sleep(delay);
        tokio::pin!(backoff);

        loop {
            tokio::select! {
                _ = &mut backoff => return true,
                cmd = self.command_rx.recv() => match cmd {
                    Some(ShardCommand::Connect(opener)) => {
                        debug!("[SHARD-{}] Connect requested, skipping backoff", self.shard_id);
                        if let Some(tx) = opener {
                            self.opener = Some(tx);
                        }
                        return true;
                    }
                    Some(ShardCommand::Disconnect { reconnect: false, .. }) => {
                        self.state.write().hard_reset();
                        return false;
                    }
                    Some(ShardCommand::Disconnect { .. }) => {
                        debug!("[SHARD-{}] Already disconnected, reconnect pending", self.shard_id);
                    }
                    Some(ShardCommand::Send(envelope)) => {
                        debug!(
                            "[SHARD-{}] Dropping op {} while disconnected",
                            self.shard_id, envelope.op
                        );
                        self.ctx.metrics.record_frame_dropped();
                    }
                    None => return false,
                }
            }
        }
    }

    /// One connection: open, handshake, run the session until it ends
    async fn connect_and_run(&mut self, resume_url: Option<String>) -> SessionEnd {
        let base = resume_url.unwrap_or_else(|| self.ctx.gateway_url.read().clone());
        let url = match build_gateway_url(
            self.shard_id,
            &base,
            self.ctx.config.gateway_version,
            self.ctx.codec.encoding(),
            self.ctx.config.compress,
        ) {
            Ok(url) => url,
            Err(e) => return self.fail(e),
        };

        let connect_timeout = self.ctx.config.connection.connect_timeout;
        let mut timers = Timers {
            handshake: Some(Box::pin(sleep(connect_timeout))),
            ..Default::default()
        };

        debug!("[SHARD-{}] Connecting to {}", self.shard_id, url);

        // The connect timeout keeps running after open until READY/RESUMED
        let ws_stream = tokio::select! {
            result = connect_transport(self.shard_id, &url) => match result {
                Ok(stream) => stream,
                Err(e) => return self.fail(e),
            },
            _ = sleep_opt(&mut timers.handshake) => {
                warn!(
                    "[SHARD-{}] Transport did not open within {:?}",
                    self.shard_id, connect_timeout
                );
                return self.fail(Error::HandshakeTimeout {
                    shard_id: self.shard_id,
                    timeout: connect_timeout,
                });
            }
        };

        self.ctx.metrics.record_connection();
        self.open.store(true, Ordering::Release);
        info!("[SHARD-{}] Connected to {}", self.shard_id, url);
        if let Some(tx) = self.opener.take() {
            let _ = tx.send(Ok(()));
        }
        self.emit(ShardEvent::Connect {
            shard_id: self.shard_id,
        });

        let (mut write, mut read) = ws_stream.split();
        let mut decoder = FrameDecoder::new(self.ctx.codec, self.ctx.config.compress);

        loop {
            let actions = tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            warn!("[SHARD-{}] Failed to answer ping: {}", self.shard_id, e);
                            return self.transport_lost(Error::WebSocket(e));
                        }
                        continue;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        debug!("[SHARD-{}] Received close frame {:?}", self.shard_id, frame);
                        self.state.write().handle_close(code)
                    }
                    Some(Ok(message)) => {
                        self.ctx.metrics.record_frame_received(self.shard_id);
                        match decoder.decode(message) {
                            Ok(Some(envelope)) => {
                                if envelope.opcode() == Some(OpCode::HeartbeatAck) {
                                    self.ctx.metrics.record_heartbeat_acked();
                                }
                                self.state.write().handle(envelope, Instant::now())
                            }
                            Ok(None) => continue,
                            Err(e) => {
                                warn!("[SHARD-{}] Dropping undecodable frame: {}", self.shard_id, e);
                                self.ctx.metrics.record_decode_error();
                                vec![ShardAction::Emit(ShardEvent::Error {
                                    shard_id: self.shard_id,
                                    error: e,
                                })]
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!("[SHARD-{}] WebSocket error: {}", self.shard_id, e);
                        return self.transport_lost(Error::WebSocket(e));
                    }
                    None => {
                        info!("[SHARD-{}] WebSocket stream ended", self.shard_id);
                        self.state.write().handle_close(None)
                    }
                },

                cmd = self.command_rx.recv() => match cmd {
                    Some(ShardCommand::Send(envelope)) => vec![ShardAction::Send(envelope)],
                    Some(ShardCommand::Disconnect { reconnect, code }) => {
                        vec![ShardAction::Disconnect { reconnect, code, error: None }]
                    }
                    Some(ShardCommand::Connect(opener)) => {
                        if let Some(tx) = opener {
                            let _ = tx.send(Ok(()));
                        }
                        continue;
                    }
                    None => {
                        info!("[SHARD-{}] Command channel closed", self.shard_id);
                        vec![ShardAction::Disconnect { reconnect: false, code: None, error: None }]
                    }
                },

                _ = tick_opt(&mut timers.heartbeat) => {
                    self.state.write().heartbeat_tick(Instant::now())
                }

                _ = sleep_opt(&mut timers.ready) => {
                    timers.ready = None;
                    self.state.write().ready_timeout_elapsed()
                }

                _ = sleep_opt(&mut timers.handshake) => {
                    timers.handshake = None;
                    self.state.write().handshake_timed_out()
                }
            };

            if let Some(end) = self.apply(actions, &mut write, &mut timers).await {
                self.sync_metrics();
                return end;
            }
            self.sync_metrics();
        }
    }

    /// Execute state machine actions in order. Returns `Some` once the session is over.
    async fn apply(
        &mut self,
        actions: Vec<ShardAction>,
        write: &mut WsSink,
        timers: &mut Timers,
    ) -> Option<SessionEnd> {
        for action in actions {
            match action {
                ShardAction::Send(envelope) => {
                    if let Err(e) = self.send_envelope(write, &envelope).await {
                        warn!("[SHARD-{}] Failed to send frame: {}", self.shard_id, e);
                        return Some(self.transport_lost(e));
                    }
                }
                ShardAction::StartHeartbeat(period) => {
                    let mut heartbeat =
                        interval_at(tokio::time::Instant::now() + period, period);
                    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    timers.heartbeat = Some(heartbeat);
                }
                ShardAction::ArmReadyTimer(after) => {
                    trace!("[SHARD-{}] Guild grace timer armed for {:?}", self.shard_id, after);
                    timers.ready = Some(Box::pin(sleep(after)));
                }
                ShardAction::ClearReadyTimer => timers.ready = None,
                ShardAction::ClearHandshakeTimer => timers.handshake = None,
                ShardAction::Emit(event) => self.emit(event),
                ShardAction::Disconnect {
                    reconnect,
                    code,
                    error,
                } => {
                    let code = code.unwrap_or_else(|| {
                        if reconnect && self.state.read().session_id().is_some() {
                            RESUMABLE_CLOSE_CODE
                        } else {
                            NORMAL_CLOSE_CODE
                        }
                    });
                    if code == ZOMBIE_CLOSE_CODE {
                        self.ctx.metrics.record_zombie_disconnect();
                    }
                    if error.is_some() {
                        self.ctx.metrics.record_error();
                    }
                    debug!(
                        "[SHARD-{}] Closing transport with code {} (reconnect={})",
                        self.shard_id, code, reconnect
                    );
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "".into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    let _ = write.close().await;
                    return Some(SessionEnd { reconnect, error });
                }
            }
        }
        None
    }

    /// Encode and write one envelope. Encoding failures drop the frame.
    async fn send_envelope(&self, write: &mut WsSink, envelope: &Envelope) -> Result<(), Error> {
        let frame = match self.ctx.codec.serialize(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[SHARD-{}] Dropping op {}: {}", self.shard_id, envelope.op, e);
                self.ctx.metrics.record_frame_dropped();
                self.emit(ShardEvent::Error {
                    shard_id: self.shard_id,
                    error: e,
                });
                return Ok(());
            }
        };

        trace!("[SHARD-{}] -> op {}", self.shard_id, envelope.op);
        write.send(frame).await?;
        self.ctx.metrics.record_frame_sent();

        match envelope.opcode() {
            Some(OpCode::Heartbeat) => self.ctx.metrics.record_heartbeat_sent(),
            Some(OpCode::Identify) => self.ctx.metrics.record_identify(),
            Some(OpCode::Resume) => self.ctx.metrics.record_resume(),
            _ => {}
        }
        Ok(())
    }

    /// Connection attempt failed before the transport opened
    fn fail(&mut self, error: Error) -> SessionEnd {
        debug!("[SHARD-{}] Connection attempt failed: {}", self.shard_id, error);
        self.ctx.metrics.record_error();
        let error = match self.opener.take() {
            Some(tx) => {
                let summary = Error::ConnectionFailed {
                    shard_id: self.shard_id,
                    reason: error.to_string(),
                };
                let _ = tx.send(Err(error));
                summary
            }
            None => error,
        };
        SessionEnd {
            reconnect: true,
            error: Some(error),
        }
    }

    /// Open transport failed mid-session
    fn transport_lost(&self, error: Error) -> SessionEnd {
        self.ctx.metrics.record_error();
        SessionEnd {
            reconnect: true,
            error: Some(error),
        }
    }

    fn emit(&self, event: ShardEvent) {
        if self.ctx.events.send(event).is_err() {
            trace!("[SHARD-{}] Event router gone, dropping event", self.shard_id);
        }
    }

    fn sync_metrics(&self) {
        let (status, latency, sequence, attempts) = {
            let state = self.state.read();
            (
                state.status(),
                state.latency(),
                state.sequence(),
                state.reconnect_attempts(),
            )
        };
        self.ctx.metrics.update_shard(self.shard_id, |s| {
            s.status = status;
            s.latency = latency;
            s.sequence = sequence;
            s.reconnect_attempts = attempts;
        });
    }
}

/// Await the next heartbeat tick, or forever when no heartbeat is running
async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn sleep_opt(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending::<()>().await,
    }
}

/// Gateway URL with version, encoding and compression query parameters
pub(crate) fn build_gateway_url(
    shard_id: u32,
    base: &str,
    version: u8,
    encoding: Encoding,
    compress: bool,
) -> Result<String, Error> {
    let mut url = Url::parse(base).map_err(|e| Error::ConnectionFailed {
        shard_id,
        reason: format!("Invalid gateway URL '{}': {}", base, e),
    })?;

    {
        let mut query = url.query_pairs_mut();
        query.clear();
        query.append_pair("v", &version.to_string());
        query.append_pair("encoding", encoding.as_query());
        if compress {
            query.append_pair("compress", "zlib-stream");
        }
    }

    Ok(url.into())
}

/// Open the WebSocket: DNS, TCP with low-latency options, optional TLS, upgrade
async fn connect_transport(shard_id: u32, url: &str) -> Result<WsStream, Error> {
    let failed = |reason: String| Error::ConnectionFailed { shard_id, reason };

    let parsed_url = Url::parse(url).map_err(|e| failed(format!("Invalid URL: {}", e)))?;
    let host = parsed_url
        .host_str()
        .ok_or_else(|| failed("No host in URL".to_string()))?;
    let is_tls = parsed_url.scheme() == "wss";
    let port = parsed_url
        .port_or_known_default()
        .unwrap_or(if is_tls { 443 } else { 80 });

    let mut request = url
        .into_client_request()
        .map_err(|e| failed(format!("Invalid WebSocket request: {}", e)))?;
    request.headers_mut().insert(
        header::USER_AGENT,
        HeaderValue::from_static(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        )),
    );

    let tcp_stream = connect_direct(shard_id, host, port).await?;
    set_tcp_options(&tcp_stream);

    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new().map_err(|e| failed(format!("TLS error: {}", e)))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let (ws_stream, _response) = client_async_tls_with_config(request, tcp_stream, None, connector)
        .await
        .map_err(Error::WebSocket)?;

    Ok(ws_stream)
}

async fn connect_direct(
    shard_id: u32,
    host: &str,
    port: u16,
) -> Result<tokio::net::TcpStream, Error> {
    let failed = |reason: String| Error::ConnectionFailed { shard_id, reason };

    let dest_addr: SocketAddr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| failed(format!("DNS lookup failed: {}", e)))?
        .next()
        .ok_or_else(|| failed(format!("No addresses found for {}", host)))?;

    let socket = if dest_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| failed(format!("Failed to create socket: {}", e)))?;

    socket
        .connect(dest_addr)
        .await
        .map_err(|e| failed(format!("TCP connect to {} failed: {}", dest_addr, e)))
}

fn set_tcp_options(stream: &tokio::net::TcpStream) {
    let sock2 = socket2::SockRef::from(stream);
    let _ = sock2.set_nodelay(true);

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}
