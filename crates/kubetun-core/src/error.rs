//! Error taxonomy shared by every kubetun component.
//!
//! Each library crate has its own `thiserror` enum; all of them map onto
//! an [`ErrorKind`] so callers on the other side of the daemon socket can
//! branch on the category without parsing messages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Category of a failure, stable across the IPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad or missing kubeconfig context. Never retried.
    ConfigError,
    /// Cluster or agent unreachable after bounded retries.
    ConnectError,
    /// The tunnel is not open; diverted traffic cannot flow.
    TunnelUnavailable,
    /// A session already exists (identical or conflicting context).
    AlreadyConnected,
    /// The operation needs a connected session.
    NotConnected,
    /// An intercept for the same workload and port is already active.
    InterceptConflict,
    /// The target workload does not exist in the namespace.
    DeploymentNotFound,
    /// A bounded wait was exceeded.
    Timeout,
    /// The remote agent refused the request.
    Rejected,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ConfigError => "config error",
            ErrorKind::ConnectError => "connect error",
            ErrorKind::TunnelUnavailable => "tunnel unavailable",
            ErrorKind::AlreadyConnected => "already connected",
            ErrorKind::NotConnected => "not connected",
            ErrorKind::InterceptConflict => "intercept conflict",
            ErrorKind::DeploymentNotFound => "deployment not found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(s)
    }
}
