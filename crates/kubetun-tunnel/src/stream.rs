//! Logical streams multiplexed inside a transport.
//!
//! A [`Stream`] splits into a [`StreamReader`] and a [`StreamWriter`].
//! The writer may only have `stream_window` unacknowledged bytes in flight;
//! it waits on a semaphore of send credit that the peer refills with WINDOW
//! frames as its reader consumes data. Dropping a writer without calling
//! [`StreamWriter::finish`] half-closes the stream; dropping a reader
//! before end-of-stream resets it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use kubetun_core::protocol::StreamMeta;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

use crate::error::TunnelError;
use crate::frame::{Frame, FrameKind, MAX_DATA_CHUNK};
use crate::transport::Mux;

/// Which side opened a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Opened by the daemon (outbound override traffic).
    Outbound,
    /// Opened by the agent (intercepted inbound traffic).
    Inbound,
}

impl Direction {
    /// Daemon streams are odd, agent streams even.
    pub fn of(id: u32) -> Self {
        if id % 2 == 1 {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Opening,
    Open,
    HalfClosed,
    Closed,
}

/// Snapshot of a stream's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStats {
    pub id: u32,
    pub direction: Direction,
    pub state: StreamState,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

pub(crate) enum StreamEvent {
    Data(Bytes),
    Fin,
    Reset(String),
}

pub(crate) struct StreamShared {
    pub(crate) id: u32,
    pub(crate) meta: StreamMeta,
    opened: AtomicBool,
    local_fin: AtomicBool,
    remote_fin: AtomicBool,
    reset: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    /// Credit granted to the peer and not yet used.
    recv_window: AtomicU32,
    /// Credit the peer granted us.
    send_credit: Semaphore,
    window: u32,
}

impl StreamShared {
    pub(crate) fn state(&self) -> StreamState {
        let local = self.local_fin.load(Ordering::Acquire);
        let remote = self.remote_fin.load(Ordering::Acquire);
        if self.reset.load(Ordering::Acquire) || (local && remote) {
            StreamState::Closed
        } else if local || remote {
            StreamState::HalfClosed
        } else if self.opened.load(Ordering::Acquire) {
            StreamState::Open
        } else {
            StreamState::Opening
        }
    }

    pub(crate) fn stats(&self) -> StreamStats {
        StreamStats {
            id: self.id,
            direction: Direction::of(self.id),
            state: self.state(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn mark_open(&self) {
        self.opened.store(true, Ordering::Release);
    }

    pub(crate) fn mark_remote_fin(&self) {
        self.remote_fin.store(true, Ordering::Release);
    }

    /// Mark reset and wake any writer waiting for credit.
    pub(crate) fn mark_reset(&self) {
        self.reset.store(true, Ordering::Release);
        self.send_credit.close();
    }

    pub(crate) fn add_send_credit(&self, credit: u32) {
        self.send_credit.add_permits(credit as usize);
    }

    /// Account for `len` inbound bytes. False when the peer overran its window.
    pub(crate) fn consume_recv_window(&self, len: u32) -> bool {
        self.recv_window
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| w.checked_sub(len))
            .is_ok()
    }
}

/// Demultiplexer-side handle for a stream.
pub(crate) struct StreamSlot {
    pub(crate) shared: Arc<StreamShared>,
    pub(crate) events: mpsc::UnboundedSender<StreamEvent>,
}

/// Build a stream and the slot the demultiplexer keeps for it.
pub(crate) fn new_stream(mux: Arc<Mux>, id: u32, meta: StreamMeta, window: u32) -> (StreamSlot, Stream) {
    let shared = Arc::new(StreamShared {
        id,
        meta,
        opened: AtomicBool::new(false),
        local_fin: AtomicBool::new(false),
        remote_fin: AtomicBool::new(false),
        reset: AtomicBool::new(false),
        bytes_sent: AtomicU64::new(0),
        bytes_received: AtomicU64::new(0),
        recv_window: AtomicU32::new(window),
        send_credit: Semaphore::new(window as usize),
        window,
    });
    let (tx, rx) = mpsc::unbounded_channel();
    let slot = StreamSlot {
        shared: shared.clone(),
        events: tx,
    };
    let stream = Stream {
        reader: StreamReader {
            shared: shared.clone(),
            mux: mux.clone(),
            events: rx,
            done: false,
        },
        writer: StreamWriter {
            shared,
            mux,
            finished: false,
        },
    };
    (slot, stream)
}

/// One logical byte stream inside the tunnel.
pub struct Stream {
    reader: StreamReader,
    writer: StreamWriter,
}

impl Stream {
    pub fn id(&self) -> u32 {
        self.reader.shared.id
    }

    pub fn direction(&self) -> Direction {
        Direction::of(self.id())
    }

    pub fn meta(&self) -> &StreamMeta {
        &self.reader.shared.meta
    }

    pub fn stats(&self) -> StreamStats {
        self.reader.shared.stats()
    }

    pub fn split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }

    pub fn reader(&mut self) -> &mut StreamReader {
        &mut self.reader
    }

    pub fn writer(&mut self) -> &mut StreamWriter {
        &mut self.writer
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("meta", self.meta())
            .field("state", &self.reader.shared.state())
            .finish()
    }
}

/// Receiving half of a stream.
pub struct StreamReader {
    shared: Arc<StreamShared>,
    mux: Arc<Mux>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    done: bool,
}

impl StreamReader {
    /// Next chunk of data, `Ok(None)` once the peer finished sending.
    pub async fn read(&mut self) -> Result<Option<Bytes>, TunnelError> {
        if self.done {
            return Ok(None);
        }
        match self.events.recv().await {
            Some(StreamEvent::Data(bytes)) => {
                let len = bytes.len() as u32;
                self.shared
                    .bytes_received
                    .fetch_add(u64::from(len), Ordering::Relaxed);
                self.shared.recv_window.fetch_add(len, Ordering::AcqRel);
                self.mux.send_best_effort(Frame::window(self.shared.id, len));
                Ok(Some(bytes))
            }
            Some(StreamEvent::Fin) => {
                self.done = true;
                self.mux.reap(self.shared.id);
                Ok(None)
            }
            Some(StreamEvent::Reset(reason)) => {
                self.done = true;
                Err(TunnelError::StreamReset(reason))
            }
            None => {
                self.done = true;
                Err(TunnelError::StreamReset("transport closed".to_string()))
            }
        }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        if self.shared.state() == StreamState::Closed {
            // Both FINs seen, possibly with the last one never read.
            self.mux.reap(self.shared.id);
        } else if !self.done {
            debug!(stream = self.shared.id, "reader dropped before end of stream, resetting");
            self.shared.mark_reset();
            self.mux.send_best_effort(Frame::reset(self.shared.id, "reader closed"));
            self.mux.remove_stream(self.shared.id);
        }
    }
}

/// Sending half of a stream.
pub struct StreamWriter {
    shared: Arc<StreamShared>,
    mux: Arc<Mux>,
    finished: bool,
}

impl StreamWriter {
    /// Send all of `buf`, waiting for flow-control credit as needed.
    pub async fn write_all(&mut self, mut buf: &[u8]) -> Result<(), TunnelError> {
        if self.finished {
            return Err(TunnelError::StreamFinished);
        }
        let max_chunk = MAX_DATA_CHUNK.min(self.shared.window as usize).max(1);
        while !buf.is_empty() {
            let n = buf.len().min(max_chunk);
            let permit = self
                .shared
                .send_credit
                .acquire_many(n as u32)
                .await
                .map_err(|_| TunnelError::StreamReset("stream closed while waiting for credit".to_string()))?;
            permit.forget();

            if self.shared.reset.load(Ordering::Acquire) {
                return Err(TunnelError::StreamReset("stream reset".to_string()));
            }
            self.mux
                .send(Frame::data(self.shared.id, Bytes::copy_from_slice(&buf[..n])))?;
            self.shared.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Half-close: tell the peer no more data follows.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.shared.local_fin.store(true, Ordering::Release);
        self.mux.send_best_effort(Frame::empty(FrameKind::Fin, self.shared.id));
        self.mux.reap(self.shared.id);
    }

    /// Abort the stream in both directions.
    pub fn reset(&mut self, reason: &str) {
        self.finished = true;
        self.shared.mark_reset();
        self.mux.send_best_effort(Frame::reset(self.shared.id, reason));
        self.mux.remove_stream(self.shared.id);
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if !self.finished && !self.shared.reset.load(Ordering::Acquire) {
            self.finish();
        }
    }
}

/// A stream the peer asked to open. Accept or refuse it; dropping it refuses.
pub struct IncomingStream {
    stream: Option<Stream>,
    mux: Arc<Mux>,
}

impl IncomingStream {
    pub(crate) fn new(stream: Stream, mux: Arc<Mux>) -> Self {
        Self {
            stream: Some(stream),
            mux,
        }
    }

    pub fn id(&self) -> u32 {
        self.stream.as_ref().map(|s| s.id()).unwrap_or_default()
    }

    pub fn meta(&self) -> Option<&StreamMeta> {
        self.stream.as_ref().map(|s| s.meta())
    }

    /// Confirm the open and start exchanging data.
    pub fn accept(mut self) -> Result<Stream, TunnelError> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| TunnelError::Protocol("stream already taken".to_string()))?;
        stream.reader.shared.mark_open();
        self.mux.send(Frame::empty(FrameKind::OpenAck, stream.id()))?;
        Ok(stream)
    }

    /// Decline the open.
    pub fn refuse(mut self, reason: &str) {
        if let Some(stream) = self.stream.take() {
            self.refuse_stream(stream, reason);
        }
    }

    fn refuse_stream(&self, mut stream: Stream, reason: &str) {
        let id = stream.id();
        self.mux.send_best_effort(Frame::new(
            FrameKind::OpenRefused,
            id,
            Bytes::copy_from_slice(reason.as_bytes()),
        ));
        // Quietly tear down the halves; the peer already knows.
        stream.reader.done = true;
        stream.writer.finished = true;
        stream.reader.shared.mark_reset();
        self.mux.remove_stream(id);
    }
}

impl Drop for IncomingStream {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.refuse_stream(stream, "not accepted");
        }
    }
}

impl fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingStream")
            .field("id", &self.id())
            .field("meta", &self.meta())
            .finish()
    }
}
