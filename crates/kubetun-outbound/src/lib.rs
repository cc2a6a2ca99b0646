//! kubetun-outbound — diverts matching local egress traffic into the cluster.
//!
//! The engine runs a local proxy listener. Every connection that reaches it
//! names a destination, either with an explicit CONNECT preamble or through
//! a transparent redirect. The destination is evaluated against the
//! [`RuleStore`](kubetun_rules::RuleStore): Divert opens an outbound tunnel
//! stream and relays through it, Pass dials the destination directly.
//!
//! # Components
//!
//! - **`engine`** — activation/deactivation, accept loop, per-connection handling
//! - **`preamble`** — CONNECT request/response wire format on the proxy socket
//! - **`installer`** — `OverrideInstaller` seam with no-op, in-memory, and iptables adapters
//! - **`original_dst`** — `SO_ORIGINAL_DST` lookup for transparently redirected sockets

pub mod engine;
pub mod error;
pub mod installer;
pub mod original_dst;
pub mod preamble;

pub use engine::{EngineCounters, EngineSettings, EngineStatus, OutboundEngine};
pub use error::OutboundError;
pub use installer::{
    installer_for, InstallPlan, IptablesInstaller, MemoryInstaller, NoopInstaller, OverrideInstaller,
};
pub use preamble::{ConnectRequest, ConnectResponse, ProxyStatus, TargetAddress};
