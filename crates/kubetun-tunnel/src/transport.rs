//! Transport lifecycle: connect, demultiplex, heartbeat, control RPC, close.
//!
//! A [`Transport`] owns three background tasks:
//! 1. the reader, which decodes frames and routes them to streams
//! 2. the writer, which drains the outbound frame queue to the socket
//! 3. the heartbeat, which pings the peer and fails the transport when
//!    nothing has been heard for `heartbeat_timeout`
//!
//! The reader never awaits a single stream. Per-stream buffering is bounded
//! by the flow-control window, so a slow stream cannot stall the others.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use kubetun_core::config::{parse_duration, TunnelConfig};
use kubetun_core::protocol::StreamMeta;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::error::TunnelError;
use crate::frame::{Frame, FrameCodec, FrameKind};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::stream::{new_stream, IncomingStream, Stream, StreamEvent, StreamSlot};

/// Queue depth for peer-initiated streams and control requests awaiting a consumer.
const ACCEPT_BACKLOG: usize = 128;

/// Which end of the tunnel this transport is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Daemon,
    Agent,
}

impl Role {
    fn first_stream_id(&self) -> u32 {
        match self {
            Role::Daemon => 1,
            Role::Agent => 2,
        }
    }

    /// Whether `id` is in the range the peer allocates from.
    fn is_peer_id(&self, id: u32) -> bool {
        id != 0 && (id % 2 == 0) == (*self == Role::Daemon)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportState {
    Open,
    /// Closed on request.
    Closed,
    /// Lost: heartbeat silence, I/O error, or the peer went away.
    Failed(String),
}

impl TransportState {
    pub fn is_open(&self) -> bool {
        matches!(self, TransportState::Open)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::Open => write!(f, "open"),
            TransportState::Closed => write!(f, "closed"),
            TransportState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub retry: RetryConfig,
    /// Bound on each TCP connect attempt.
    pub connect_timeout: Duration,
    /// Bound on waiting for OPEN_ACK.
    pub open_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Per-stream flow-control window in bytes.
    pub stream_window: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            connect_timeout: Duration::from_secs(10),
            open_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(6),
            stream_window: 256 * 1024,
        }
    }
}

impl TransportConfig {
    /// Build from the daemon's `[tunnel]` settings.
    pub fn from_settings(settings: &TunnelConfig) -> Result<Self, String> {
        Ok(Self {
            retry: RetryConfig {
                max_attempts: settings.connect_attempts.max(1),
                initial_delay: parse_duration(&settings.initial_backoff)?,
                max_delay: parse_duration(&settings.max_backoff)?,
                backoff_multiplier: 2.0,
            },
            connect_timeout: parse_duration(&settings.connect_timeout)?,
            open_timeout: parse_duration(&settings.open_timeout)?,
            heartbeat_interval: parse_duration(&settings.heartbeat_interval)?,
            heartbeat_timeout: parse_duration(&settings.heartbeat_timeout)?,
            stream_window: settings.stream_window.max(1),
        })
    }
}

/// Shared state behind a [`Transport`] handle.
pub(crate) struct Mux {
    role: Role,
    peer: String,
    config: TransportConfig,
    out_tx: mpsc::UnboundedSender<Frame>,
    streams: Mutex<HashMap<u32, StreamSlot>>,
    pending_opens: Mutex<HashMap<u32, oneshot::Sender<Result<(), String>>>>,
    pending_requests: Mutex<HashMap<u32, oneshot::Sender<Bytes>>>,
    next_stream_id: AtomicU32,
    next_request_id: AtomicU32,
    ping_nonce: AtomicU64,
    last_seen: Mutex<Instant>,
    state_tx: watch::Sender<TransportState>,
    shutdown_tx: watch::Sender<bool>,
    incoming_tx: mpsc::Sender<IncomingStream>,
    requests_tx: mpsc::Sender<IncomingRequest>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Mux {
    fn is_open(&self) -> bool {
        self.state_tx.borrow().is_open()
    }

    /// Queue a frame. Fails when the transport is no longer open.
    pub(crate) fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        if !self.is_open() {
            return Err(TunnelError::Unavailable(self.state_tx.borrow().to_string()));
        }
        self.out_tx
            .send(frame)
            .map_err(|_| TunnelError::Unavailable("writer stopped".to_string()))
    }

    pub(crate) fn send_best_effort(&self, frame: Frame) {
        let _ = self.send(frame);
    }

    /// Forget a stream once both sides have finished with it.
    pub(crate) fn reap(&self, id: u32) {
        let mut streams = lock(&self.streams);
        let closed = streams
            .get(&id)
            .map(|s| s.shared.state() == crate::stream::StreamState::Closed)
            .unwrap_or(false);
        if closed {
            streams.remove(&id);
            debug!(stream = id, "stream closed");
        }
    }

    pub(crate) fn remove_stream(&self, id: u32) {
        lock(&self.streams).remove(&id);
    }

    fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    fn silent_for(&self) -> Duration {
        lock(&self.last_seen).elapsed()
    }

    /// Move to a terminal state and release everything waiting on the transport.
    fn terminate(&self, state: TransportState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if current.is_open() {
                *current = state.clone();
                true
            } else {
                false
            }
        });
        if !changed {
            return;
        }

        match &state {
            TransportState::Failed(reason) => warn!(peer = %self.peer, %reason, "tunnel failed"),
            _ => info!(peer = %self.peer, "tunnel closed"),
        }

        let reason = state.to_string();
        let slots: Vec<StreamSlot> = lock(&self.streams).drain().map(|(_, s)| s).collect();
        for slot in slots {
            slot.shared.mark_reset();
            let _ = slot.events.send(StreamEvent::Reset(reason.clone()));
        }
        for (_, tx) in lock(&self.pending_opens).drain() {
            let _ = tx.send(Err(reason.clone()));
        }
        lock(&self.pending_requests).clear();
        let _ = self.shutdown_tx.send(true);
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<(), TunnelError> {
        self.touch();
        match frame.kind {
            FrameKind::Open => self.on_open(frame),
            FrameKind::OpenAck => {
                if let Some(tx) = lock(&self.pending_opens).remove(&frame.id) {
                    if let Some(slot) = lock(&self.streams).get(&frame.id) {
                        slot.shared.mark_open();
                    }
                    let _ = tx.send(Ok(()));
                }
                Ok(())
            }
            FrameKind::OpenRefused => {
                self.remove_stream(frame.id);
                if let Some(tx) = lock(&self.pending_opens).remove(&frame.id) {
                    let _ = tx.send(Err(frame.reason()));
                }
                Ok(())
            }
            FrameKind::Data => {
                let len = frame.payload.len() as u32;
                let mut streams = lock(&self.streams);
                let Some(slot) = streams.get(&frame.id) else {
                    debug!(stream = frame.id, "data for unknown stream");
                    return Ok(());
                };
                if !slot.shared.consume_recv_window(len) {
                    warn!(stream = frame.id, len, "peer exceeded flow-control window, resetting stream");
                    slot.shared.mark_reset();
                    let _ = slot.events.send(StreamEvent::Reset("flow-control violation".to_string()));
                    streams.remove(&frame.id);
                    drop(streams);
                    self.send_best_effort(Frame::reset(frame.id, "flow-control violation"));
                    return Ok(());
                }
                let _ = slot.events.send(StreamEvent::Data(frame.payload));
                Ok(())
            }
            FrameKind::Window => {
                let credit = frame
                    .credit()
                    .ok_or_else(|| TunnelError::Protocol("malformed WINDOW frame".to_string()))?;
                if let Some(slot) = lock(&self.streams).get(&frame.id) {
                    slot.shared.add_send_credit(credit);
                }
                Ok(())
            }
            FrameKind::Fin => {
                if let Some(slot) = lock(&self.streams).get(&frame.id) {
                    slot.shared.mark_remote_fin();
                    let _ = slot.events.send(StreamEvent::Fin);
                }
                Ok(())
            }
            FrameKind::Reset => {
                if let Some(slot) = lock(&self.streams).remove(&frame.id) {
                    slot.shared.mark_reset();
                    let _ = slot.events.send(StreamEvent::Reset(frame.reason()));
                }
                if let Some(tx) = lock(&self.pending_opens).remove(&frame.id) {
                    let _ = tx.send(Err(frame.reason()));
                }
                Ok(())
            }
            FrameKind::Ping => self.send(Frame::new(FrameKind::Pong, 0, frame.payload)),
            FrameKind::Pong => Ok(()),
            FrameKind::Request => {
                let request = IncomingRequest {
                    id: frame.id,
                    body: frame.payload,
                    mux: self.clone(),
                };
                if self.requests_tx.try_send(request).is_err() {
                    debug!(request = frame.id, "no control handler, dropping request");
                }
                Ok(())
            }
            FrameKind::Response => {
                if let Some(tx) = lock(&self.pending_requests).remove(&frame.id) {
                    let _ = tx.send(frame.payload);
                }
                Ok(())
            }
            FrameKind::GoAway => {
                self.terminate(TransportState::Failed("peer closed the tunnel".to_string()));
                Ok(())
            }
        }
    }

    fn on_open(self: &Arc<Self>, frame: Frame) -> Result<(), TunnelError> {
        let id = frame.id;
        if !self.role.is_peer_id(id) {
            return Err(TunnelError::Protocol(format!("peer opened stream {id} outside its range")));
        }
        if lock(&self.streams).contains_key(&id) {
            return Err(TunnelError::Protocol(format!("peer reused stream id {id}")));
        }
        let meta: StreamMeta = match serde_json::from_slice(&frame.payload) {
            Ok(m) => m,
            Err(e) => {
                self.send_best_effort(Frame::new(
                    FrameKind::OpenRefused,
                    id,
                    Bytes::from(format!("bad stream metadata: {e}")),
                ));
                return Ok(());
            }
        };

        let (slot, stream) = new_stream(self.clone(), id, meta, self.config.stream_window);
        lock(&self.streams).insert(id, slot);
        debug!(stream = id, meta = ?stream.meta(), "peer opened stream");

        let incoming = IncomingStream::new(stream, self.clone());
        if let Err(e) = self.incoming_tx.try_send(incoming) {
            // Dropping the IncomingStream refuses it.
            debug!(stream = id, "no acceptor for incoming stream");
            drop(e);
        }
        Ok(())
    }
}

/// Handle to a running tunnel. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    mux: Arc<Mux>,
    incoming_rx: Arc<Mutex<Option<mpsc::Receiver<IncomingStream>>>>,
    requests_rx: Arc<Mutex<Option<mpsc::Receiver<IncomingRequest>>>>,
}

impl Transport {
    /// Dial the agent, retrying with backoff, and start the transport.
    pub async fn connect(addr: &str, role: Role, config: TransportConfig) -> Result<Self, TunnelError> {
        let connect_timeout = config.connect_timeout;
        let socket = retry_with_backoff(&config.retry, "tunnel connect", move || async move {
            match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no answer within {connect_timeout:?}"),
                )),
            }
        })
        .await
        .map_err(|source| TunnelError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        let _ = socket.set_nodelay(true);
        info!(%addr, "tunnel connected");
        Ok(Self::start(socket, addr.to_string(), role, config))
    }

    /// Run a transport on a socket accepted by a listener.
    pub fn accept(socket: TcpStream, role: Role, config: TransportConfig) -> Self {
        let peer = socket
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let _ = socket.set_nodelay(true);
        debug!(%peer, "tunnel accepted");
        Self::start(socket, peer, role, config)
    }

    /// Start a transport over an established byte stream.
    pub fn start<S>(io: S, peer: String, role: Role, config: TransportConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(TransportState::Open);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (requests_tx, requests_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let mux = Arc::new(Mux {
            role,
            peer,
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            config,
            out_tx,
            streams: Mutex::new(HashMap::new()),
            pending_opens: Mutex::new(HashMap::new()),
            pending_requests: Mutex::new(HashMap::new()),
            next_request_id: AtomicU32::new(1),
            ping_nonce: AtomicU64::new(0),
            last_seen: Mutex::new(Instant::now()),
            state_tx,
            shutdown_tx,
            incoming_tx,
            requests_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let reader = tokio::spawn(run_reader(mux.clone(), read_half, shutdown_rx.clone()));
        let writer = tokio::spawn(run_writer(mux.clone(), write_half, out_rx, shutdown_rx.clone()));
        let heartbeat = tokio::spawn(run_heartbeat(mux.clone(), shutdown_rx));
        lock(&mux.tasks).extend([reader, writer, heartbeat]);

        Self {
            mux,
            incoming_rx: Arc::new(Mutex::new(Some(incoming_rx))),
            requests_rx: Arc::new(Mutex::new(Some(requests_rx))),
        }
    }

    pub fn state(&self) -> TransportState {
        self.mux.state_tx.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.mux.is_open()
    }

    /// Watch state changes (Open → Closed / Failed).
    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.mux.state_tx.subscribe()
    }

    /// Open a stream to the peer and wait for it to be accepted.
    pub async fn open_stream(&self, meta: StreamMeta) -> Result<Stream, TunnelError> {
        if !self.is_open() {
            return Err(TunnelError::Unavailable(self.state().to_string()));
        }
        let id = self.mux.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let payload = serde_json::to_vec(&meta).map_err(|e| TunnelError::Serialize(e.to_string()))?;

        let (slot, stream) = new_stream(self.mux.clone(), id, meta, self.mux.config.stream_window);
        let (tx, rx) = oneshot::channel();
        lock(&self.mux.streams).insert(id, slot);
        lock(&self.mux.pending_opens).insert(id, tx);

        if let Err(e) = self.mux.send(Frame::new(FrameKind::Open, id, Bytes::from(payload))) {
            lock(&self.mux.pending_opens).remove(&id);
            self.mux.remove_stream(id);
            return Err(e);
        }

        match tokio::time::timeout(self.mux.config.open_timeout, rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(stream = id, "stream opened");
                Ok(stream)
            }
            Ok(Ok(Err(reason))) => {
                self.mux.remove_stream(id);
                if self.is_open() {
                    Err(TunnelError::Refused(reason))
                } else {
                    Err(TunnelError::Unavailable(reason))
                }
            }
            Ok(Err(_)) => {
                self.mux.remove_stream(id);
                Err(TunnelError::Unavailable("transport closed".to_string()))
            }
            Err(_) => {
                lock(&self.mux.pending_opens).remove(&id);
                let mut stream = stream;
                stream.writer().reset("open timed out");
                Err(TunnelError::Timeout(format!("stream {id} to be accepted")))
            }
        }
    }

    /// Take the receiver of peer-initiated streams. Only the first caller gets it.
    pub fn take_incoming(&self) -> Option<mpsc::Receiver<IncomingStream>> {
        lock(&self.incoming_rx).take()
    }

    /// Take the receiver of control requests. Only the first caller gets it.
    pub fn take_requests(&self) -> Option<mpsc::Receiver<IncomingRequest>> {
        lock(&self.requests_rx).take()
    }

    /// Send a control request and wait up to `timeout` for the response.
    pub async fn request<Req, Resp>(&self, request: &Req, timeout: Duration) -> Result<Resp, TunnelError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request).map_err(|e| TunnelError::Serialize(e.to_string()))?;
        let id = self.mux.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.mux.pending_requests).insert(id, tx);

        if let Err(e) = self.mux.send(Frame::new(FrameKind::Request, id, Bytes::from(body))) {
            lock(&self.mux.pending_requests).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(body)) => serde_json::from_slice(&body).map_err(|e| TunnelError::Serialize(e.to_string())),
            Ok(Err(_)) => Err(TunnelError::Unavailable("transport closed".to_string())),
            Err(_) => {
                lock(&self.mux.pending_requests).remove(&id);
                Err(TunnelError::Timeout(format!("response to control request {id}")))
            }
        }
    }

    pub fn active_streams(&self) -> usize {
        lock(&self.mux.streams).len()
    }

    /// Send GOAWAY, reset every stream, and stop the background tasks.
    pub async fn close(&self) {
        if self.is_open() {
            let _ = self.mux.out_tx.send(Frame::empty(FrameKind::GoAway, 0));
        }
        self.mux.terminate(TransportState::Closed);
        let tasks: Vec<JoinHandle<()>> = lock(&self.mux.tasks).drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                debug!("transport task did not stop in time");
            }
        }
    }

    /// Fail the transport as if the connection had been lost.
    pub fn fail(&self, reason: &str) {
        self.mux.terminate(TransportState::Failed(reason.to_string()));
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("role", &self.mux.role)
            .field("peer", &self.mux.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// A control request from the peer.
pub struct IncomingRequest {
    id: u32,
    body: Bytes,
    mux: Arc<Mux>,
}

impl IncomingRequest {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, TunnelError> {
        serde_json::from_slice(&self.body).map_err(|e| TunnelError::Serialize(e.to_string()))
    }

    pub fn respond<T: Serialize>(self, response: &T) -> Result<(), TunnelError> {
        let body = serde_json::to_vec(response).map_err(|e| TunnelError::Serialize(e.to_string()))?;
        self.mux.send(Frame::new(FrameKind::Response, self.id, Bytes::from(body)))
    }
}

async fn run_reader<R>(mux: Arc<Mux>, read_half: R, mut shutdown: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut frames = FramedRead::new(read_half, FrameCodec);
    loop {
        tokio::select! {
            next = frames.next() => match next {
                Some(Ok(frame)) => {
                    if let Err(e) = mux.handle_frame(frame) {
                        mux.terminate(TransportState::Failed(e.to_string()));
                        break;
                    }
                }
                Some(Err(e)) => {
                    mux.terminate(TransportState::Failed(format!("read error: {e}")));
                    break;
                }
                None => {
                    mux.terminate(TransportState::Failed("connection closed by peer".to_string()));
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn run_writer<W>(
    mux: Arc<Mux>,
    write_half: W,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut sink = FramedWrite::new(write_half, FrameCodec);
    loop {
        tokio::select! {
            frame = out_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        mux.terminate(TransportState::Failed(format!("write error: {e}")));
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => {
                // Flush what was queued before the shutdown (GOAWAY, resets).
                while let Ok(frame) = out_rx.try_recv() {
                    if sink.feed(frame).await.is_err() {
                        break;
                    }
                }
                let _ = tokio::time::timeout(Duration::from_millis(500), sink.flush()).await;
                break;
            }
        }
    }
    let _ = tokio::time::timeout(Duration::from_millis(500), sink.close()).await;
}

async fn run_heartbeat(mux: Arc<Mux>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(mux.config.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let silent = mux.silent_for();
                if silent > mux.config.heartbeat_timeout {
                    mux.terminate(TransportState::Failed(format!(
                        "no heartbeat from peer for {}ms",
                        silent.as_millis()
                    )));
                    break;
                }
                let nonce = mux.ping_nonce.fetch_add(1, Ordering::Relaxed);
                mux.send_best_effort(Frame::ping(nonce));
            }
            _ = shutdown.changed() => break,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> TransportConfig {
        TransportConfig {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(200),
            open_timeout: Duration::from_secs(2),
            stream_window: 64 * 1024,
            ..Default::default()
        }
    }

    fn pair(config: TransportConfig) -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let daemon = Transport::start(a, "agent".into(), Role::Daemon, config.clone());
        let agent = Transport::start(b, "daemon".into(), Role::Agent, config);
        (daemon, agent)
    }

    fn outbound(host: &str) -> StreamMeta {
        StreamMeta::Outbound {
            host: host.to_string(),
            port: 80,
        }
    }

    #[tokio::test]
    async fn open_accept_and_exchange() {
        let (daemon, agent) = pair(fast_config());
        let mut incoming = agent.take_incoming().unwrap();

        let server = tokio::spawn(async move {
            let inc = incoming.recv().await.unwrap();
            assert_eq!(inc.meta(), Some(&outbound("echo")));
            let stream = inc.accept().unwrap();
            let (mut r, mut w) = stream.split();
            while let Some(chunk) = r.read().await.unwrap() {
                w.write_all(&chunk).await.unwrap();
            }
            w.finish();
        });

        let stream = daemon.open_stream(outbound("echo")).await.unwrap();
        assert_eq!(stream.id() % 2, 1);
        assert_eq!(stream.direction(), crate::stream::Direction::Outbound);
        let (mut r, mut w) = stream.split();
        w.write_all(b"hello tunnel").await.unwrap();
        w.finish();

        let mut echoed = Vec::new();
        while let Some(chunk) = r.read().await.unwrap() {
            echoed.extend_from_slice(&chunk);
        }
        assert_eq!(echoed, b"hello tunnel");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn ids_are_disjoint_per_role() {
        let (daemon, agent) = pair(fast_config());
        let mut daemon_in = daemon.take_incoming().unwrap();
        let mut agent_in = agent.take_incoming().unwrap();

        tokio::spawn(async move {
            while let Some(inc) = daemon_in.recv().await {
                let _ = inc.accept();
            }
        });
        tokio::spawn(async move {
            while let Some(inc) = agent_in.recv().await {
                let _ = inc.accept();
            }
        });

        let a = daemon.open_stream(outbound("a")).await.unwrap();
        let b = daemon.open_stream(outbound("b")).await.unwrap();
        let c = agent
            .open_stream(StreamMeta::Intercept {
                workload: "w".into(),
                port: 8080,
                peer: None,
            })
            .await
            .unwrap();
        assert_eq!((a.id(), b.id()), (1, 3));
        assert_eq!(c.id(), 2);
        assert_eq!(c.direction(), crate::stream::Direction::Inbound);
    }

    #[tokio::test]
    async fn closed_stream_is_forgotten_when_unread_fin_is_dropped() {
        let (daemon, agent) = pair(fast_config());
        let mut incoming = agent.take_incoming().unwrap();
        let acceptor = tokio::spawn(async move { incoming.recv().await.unwrap().accept().unwrap() });

        let mut stream = daemon.open_stream(outbound("done")).await.unwrap();
        stream.writer().finish();
        let mut remote = acceptor.await.unwrap();
        remote.writer().finish();

        // Wait for the peer's FIN to land without reading it.
        for _ in 0..100 {
            if stream.stats().state == crate::stream::StreamState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stream.stats().state, crate::stream::StreamState::Closed);
        assert_eq!(daemon.active_streams(), 1);

        drop(stream);
        assert_eq!(daemon.active_streams(), 0);
    }

    #[tokio::test]
    async fn refused_open_surfaces_reason() {
        let (daemon, agent) = pair(fast_config());
        let mut incoming = agent.take_incoming().unwrap();
        tokio::spawn(async move {
            let inc = incoming.recv().await.unwrap();
            inc.refuse("no such host");
        });

        let err = daemon.open_stream(outbound("nowhere")).await.unwrap_err();
        match err {
            TunnelError::Refused(reason) => assert_eq!(reason, "no such host"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(daemon.active_streams(), 0);
    }

    #[tokio::test]
    async fn unconsumed_incoming_is_refused() {
        let (daemon, agent) = pair(fast_config());
        // Nobody takes the agent's incoming receiver; the stream sits in the
        // backlog until dropped together with the receiver.
        drop(agent.take_incoming());
        let err = daemon.open_stream(outbound("x")).await.unwrap_err();
        assert!(matches!(err, TunnelError::Refused(_)));
    }

    #[tokio::test]
    async fn control_request_round_trip() {
        let (daemon, agent) = pair(fast_config());
        let mut requests = agent.take_requests().unwrap();
        tokio::spawn(async move {
            let req = requests.recv().await.unwrap();
            let n: u32 = req.parse().unwrap();
            req.respond(&(n * 2)).unwrap();
        });

        let doubled: u32 = daemon.request(&21u32, Duration::from_secs(1)).await.unwrap();
        assert_eq!(doubled, 42);
    }

    #[tokio::test]
    async fn control_request_times_out() {
        let (daemon, agent) = pair(fast_config());
        let _requests = agent.take_requests().unwrap();
        let err = daemon
            .request::<_, u32>(&1u32, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Timeout(_)));
    }

    #[tokio::test]
    async fn writer_blocks_without_credit() {
        let mut config = fast_config();
        config.stream_window = 8 * 1024;
        let (daemon, agent) = pair(config);
        let mut incoming = agent.take_incoming().unwrap();

        let accepted = tokio::spawn(async move { incoming.recv().await.unwrap().accept().unwrap() });
        let stream = daemon.open_stream(outbound("slow")).await.unwrap();
        let mut remote = accepted.await.unwrap();
        let (_r, mut w) = stream.split();

        // One window fits; the second write has to wait for the reader.
        w.write_all(&[0u8; 8 * 1024]).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(200), w.write_all(&[1u8; 1024])).await;
        assert!(blocked.is_err(), "write should wait for credit");

        let first = remote.reader().read().await.unwrap().unwrap();
        assert_eq!(first.len(), 8 * 1024);
        tokio::time::timeout(Duration::from_secs(1), w.write_all(&[1u8; 1024]))
            .await
            .expect("credit returned")
            .unwrap();
    }

    #[tokio::test]
    async fn slow_stream_does_not_stall_others() {
        let mut config = fast_config();
        config.stream_window = 4 * 1024;
        let (daemon, agent) = pair(config);
        let mut incoming = agent.take_incoming().unwrap();
        let acceptor = tokio::spawn(async move {
            let slow = incoming.recv().await.unwrap().accept().unwrap();
            let fast = incoming.recv().await.unwrap().accept().unwrap();
            (slow, fast)
        });

        let slow = daemon.open_stream(outbound("slow")).await.unwrap();
        let fast = daemon.open_stream(outbound("fast")).await.unwrap();
        let (_slow_remote, mut fast_remote) = acceptor.await.unwrap();

        let (_sr, mut sw) = slow.split();
        sw.write_all(&[0u8; 4 * 1024]).await.unwrap();

        let (_fr, mut fw) = fast.split();
        fw.write_all(b"ping").await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), fast_remote.reader().read())
            .await
            .expect("fast stream delivered")
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], b"ping");
    }

    #[tokio::test]
    async fn heartbeat_silence_fails_transport() {
        let (a, _b) = tokio::io::duplex(1024);
        // The far end never runs a transport, so no PONG ever arrives.
        let config = fast_config();
        let deadline = config.heartbeat_interval + config.heartbeat_timeout + Duration::from_millis(200);
        let transport = Transport::start(a, "silent".into(), Role::Daemon, config);
        let mut state = transport.subscribe();

        tokio::time::timeout(deadline, async {
            while state.borrow().is_open() {
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("transport failed within interval + timeout");
        assert!(matches!(transport.state(), TransportState::Failed(_)));
    }

    #[tokio::test]
    async fn close_resets_streams_and_notifies_peer() {
        let (daemon, agent) = pair(fast_config());
        let mut incoming = agent.take_incoming().unwrap();
        let accepted = tokio::spawn(async move { incoming.recv().await.unwrap().accept().unwrap() });
        let stream = daemon.open_stream(outbound("x")).await.unwrap();
        let mut remote = accepted.await.unwrap();

        let mut agent_state = agent.subscribe();
        daemon.close().await;
        assert_eq!(daemon.state(), TransportState::Closed);

        let (mut r, _w) = stream.split();
        assert!(r.read().await.is_err());

        tokio::time::timeout(Duration::from_secs(1), async {
            while agent_state.borrow().is_open() {
                agent_state.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert!(remote.reader().read().await.is_err());
    }

    #[tokio::test]
    async fn open_on_closed_transport_is_unavailable() {
        let (daemon, _agent) = pair(fast_config());
        daemon.close().await;
        let err = daemon.open_stream(outbound("x")).await.unwrap_err();
        assert!(matches!(err, TunnelError::Unavailable(_)));
    }

    #[tokio::test]
    async fn stats_count_bytes() {
        let (daemon, agent) = pair(fast_config());
        let mut incoming = agent.take_incoming().unwrap();
        let accepted = tokio::spawn(async move { incoming.recv().await.unwrap().accept().unwrap() });
        let mut stream = daemon.open_stream(outbound("x")).await.unwrap();
        let mut remote = accepted.await.unwrap();

        stream.writer().write_all(b"12345").await.unwrap();
        let got = remote.reader().read().await.unwrap().unwrap();
        assert_eq!(got.len(), 5);
        assert_eq!(stream.stats().bytes_sent, 5);
        assert_eq!(remote.stats().bytes_received, 5);
        assert_eq!(stream.stats().state, crate::stream::StreamState::Open);
    }

    #[tokio::test]
    async fn connect_gives_up_after_retries() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut config = fast_config();
        config.retry = RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        };
        let err = Transport::connect(&addr, Role::Daemon, config).await.unwrap_err();
        assert!(matches!(err, TunnelError::Connect { .. }));
        assert_eq!(err.kind(), kubetun_core::ErrorKind::ConnectError);
    }
}
