//! Domain types for sessions, intercepts, and status reports.
//!
//! These types are owned by the session and intercept managers; other
//! components only ever see cloned snapshots of them.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Opaque session identifier assigned by the remote agent.
pub type SessionId = String;

// ── Session ────────────────────────────────────────────────────────

/// Lifecycle state of the daemon's single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Disconnected => write!(f, "disconnected"),
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Connected => write!(f, "connected"),
            SessionStatus::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// One daemon-to-cluster connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    /// Kubeconfig context the session was opened against.
    pub context: String,
    pub namespace: String,
    /// Address of the remote agent terminating the tunnel.
    pub agent_addr: String,
    /// Unix timestamp (seconds) when the session was negotiated.
    pub created_at: u64,
}

// ── Intercept ──────────────────────────────────────────────────────

/// Lifecycle state of an intercept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterceptState {
    Requested,
    Active,
    Removing,
    Removed,
    Failed,
}

impl fmt::Display for InterceptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptState::Requested => write!(f, "requested"),
            InterceptState::Active => write!(f, "active"),
            InterceptState::Removing => write!(f, "removing"),
            InterceptState::Removed => write!(f, "removed"),
            InterceptState::Failed => write!(f, "failed"),
        }
    }
}

/// Key identifying an intercept within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterceptKey {
    pub workload: String,
    pub remote_port: u16,
}

impl InterceptKey {
    pub fn new(workload: impl Into<String>, remote_port: u16) -> Self {
        Self {
            workload: workload.into(),
            remote_port,
        }
    }
}

impl fmt::Display for InterceptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.workload, self.remote_port)
    }
}

/// Snapshot of one inbound redirection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterceptInfo {
    pub workload: String,
    pub remote_port: u16,
    /// Local listener the intercepted traffic is delivered to.
    pub local_addr: String,
    pub local_port: u16,
    pub state: InterceptState,
    /// Identifier assigned by the agent once installed.
    pub intercept_id: Option<String>,
    /// Human-readable reason for a failure.
    pub reason: Option<String>,
}

impl InterceptInfo {
    pub fn key(&self) -> InterceptKey {
        InterceptKey::new(self.workload.clone(), self.remote_port)
    }
}

// ── Status ─────────────────────────────────────────────────────────

/// In-memory view of the daemon returned by `status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StatusReport {
    pub status: SessionStatus,
    pub session: Option<SessionInfo>,
    /// True when the override engine is installed with at least one divert rule.
    pub outbound_active: bool,
    pub divert_rules: usize,
    /// Address of the local outbound proxy listener, when active.
    pub proxy_addr: Option<String>,
    pub intercepts: Vec<InterceptInfo>,
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intercept_key_display() {
        let key = InterceptKey::new("echo-easy", 8080);
        assert_eq!(key.to_string(), "echo-easy:8080");
    }

    #[test]
    fn default_status_is_disconnected() {
        let report = StatusReport::default();
        assert_eq!(report.status, SessionStatus::Disconnected);
        assert!(!report.outbound_active);
        assert!(report.intercepts.is_empty());
    }
}
