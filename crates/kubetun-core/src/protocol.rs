//! Control messages exchanged between the daemon and the remote agent.
//!
//! Control requests travel as JSON in REQUEST/RESPONSE tunnel frames.
//! Stream metadata travels as JSON in OPEN frames and tells the receiving
//! side what the new stream is for.

use serde::{Deserialize, Serialize};

/// Requests the daemon sends to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Open a session for a context and namespace.
    Negotiate {
        context: String,
        namespace: String,
        client_version: String,
    },
    /// Redirect inbound traffic for `workload:port` through the tunnel.
    InstallIntercept { workload: String, port: u16 },
    /// Undo a previous `InstallIntercept`.
    UninstallIntercept { workload: String, port: u16 },
}

/// Responses the agent sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentResponse {
    Session(SessionGrant),
    Installed { intercept_id: String },
    Uninstalled,
    Error { kind: AgentErrorKind, message: String },
}

/// What the agent accepted during negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionGrant {
    pub session_id: String,
    pub context: String,
    pub namespace: String,
    /// Cluster DNS domain, usually `cluster.local`.
    pub cluster_domain: String,
    /// Namespaces whose services are reachable through the tunnel.
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub service_subnets: Vec<String>,
    #[serde(default)]
    pub pod_subnets: Vec<String>,
}

/// Failure categories reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    DeploymentNotFound,
    Conflict,
    Rejected,
    BadRequest,
}

/// Purpose of a stream, carried in its OPEN frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMeta {
    /// Daemon-initiated: dial `host:port` from inside the cluster.
    Outbound { host: String, port: u16 },
    /// Agent-initiated: a connection that arrived for an intercepted workload.
    Intercept {
        workload: String,
        port: u16,
        /// Address of the in-cluster client, for logging.
        #[serde(default)]
        peer: Option<String>,
    },
}
