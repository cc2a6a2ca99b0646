//! kubetun-tunnel — the multiplexed channel between daemon and agent.
//!
//! One TCP connection carries many logical streams plus a small JSON
//! control RPC. Both ends run the same [`Transport`]; only the [`Role`]
//! differs, which decides the stream-ID range each side allocates from.
//!
//! # Architecture
//!
//! ```text
//!   StreamWriter ──credit──► writer task ──► socket ──► reader task ──► StreamReader
//!        ▲                                                   │
//!        └──────────────────── WINDOW frames ◄───────────────┘
//!
//!   heartbeat task: PING every interval, Failed after timeout of silence
//! ```
//!
//! # Components
//!
//! - **`frame`** — wire format and the tokio-util codec
//! - **`transport`** — connection lifecycle, demultiplexing, heartbeats, control RPC
//! - **`stream`** — per-stream reader/writer halves with credit-based flow control
//! - **`relay`** — bidirectional copy between a socket and a stream
//! - **`retry`** — exponential backoff with jitter for the initial connect

pub mod error;
pub mod frame;
pub mod relay;
pub mod retry;
pub mod stream;
pub mod transport;

pub use error::TunnelError;
pub use frame::{Frame, FrameCodec, FrameKind};
pub use relay::{relay, RelayStats};
pub use retry::{retry_with_backoff, RetryConfig};
pub use stream::{Direction, IncomingStream, Stream, StreamReader, StreamState, StreamStats, StreamWriter};
pub use transport::{IncomingRequest, Role, Transport, TransportConfig, TransportState};
