//! kubetun-agent — the in-cluster end of the tunnel.
//!
//! Accepts tunnel connections from daemons and, for each one:
//! 1. answers session negotiation with the cluster's DNS domain and subnets
//! 2. installs and uninstalls intercepts in a registry shared by all tunnels
//! 3. dials outbound streams from inside the cluster
//!
//! Every configured workload port gets a front listener. A connection to
//! the front reaches the real workload, or the developer's machine while
//! the port is intercepted.

pub mod config;
pub mod error;
pub mod server;

mod dial;
mod front;
mod registry;

pub use config::{AgentConfig, WorkloadSpec};
pub use error::AgentError;
pub use server::RunningAgent;
