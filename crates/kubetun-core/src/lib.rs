//! kubetun-core — shared types for the kubetun daemon, agent, and CLI.
//!
//! # Modules
//!
//! - **`types`** — session, intercept, and status domain types
//! - **`error`** — the error taxonomy carried across process boundaries
//! - **`protocol`** — control messages and stream metadata exchanged with the agent
//! - **`config`** — `config.toml` parsing for the daemon
//! - **`kubeconfig`** — context lookup in a kubeconfig file
//! - **`ipc`** — newline-delimited JSON protocol on the daemon socket
//! - **`status`** — text rendering of a status report

pub mod config;
pub mod error;
pub mod ipc;
pub mod kubeconfig;
pub mod protocol;
pub mod status;
pub mod types;

pub use config::DaemonConfig;
pub use error::ErrorKind;
pub use types::*;

/// Version of this build, reported by `kubetun version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
