//! Agent configuration.
//!
//! Loaded from TOML by the binary and built directly by tests. Durations
//! in `[tunnel]` use the daemon's syntax.

use std::collections::HashMap;
use std::path::Path;

use kubetun_core::config::TunnelConfig;
use serde::Deserialize;

use crate::error::AgentError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Tunnel listen address.
    pub listen: String,
    pub cluster_domain: String,
    /// Namespaces that exist. Empty accepts any namespace.
    pub namespaces: Vec<String>,
    pub service_subnets: Vec<String>,
    pub pod_subnets: Vec<String>,
    /// Workloads fronted by this agent.
    pub workloads: Vec<WorkloadSpec>,
    /// Name resolution overrides for outbound dials: `host` or `host:port`
    /// → `ip:port`.
    pub resolve: HashMap<String, String>,
    pub tunnel: TunnelConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8022".to_string(),
            cluster_domain: "cluster.local".to_string(),
            namespaces: Vec::new(),
            service_subnets: vec!["10.96.0.0/12".to_string()],
            pod_subnets: vec!["10.244.0.0/16".to_string()],
            workloads: Vec::new(),
            resolve: HashMap::new(),
            tunnel: TunnelConfig::default(),
        }
    }
}

/// A workload port the agent stands in front of.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WorkloadSpec {
    pub name: String,
    pub port: u16,
    /// Where the real workload listens.
    pub target: String,
    /// Where the front listens; port 0 picks a free one.
    #[serde(default = "default_front_addr")]
    pub front: String,
}

fn default_front_addr() -> String {
    "0.0.0.0:0".to_string()
}

impl WorkloadSpec {
    /// Parse `name:port=target`, e.g. `echo-easy:8080=10.244.1.5:8080`.
    pub fn parse(s: &str) -> Result<Self, AgentError> {
        let bad = || AgentError::Config(format!("invalid workload {s:?}, expected name:port=target"));
        let (key, target) = s.split_once('=').ok_or_else(bad)?;
        let (name, port) = key.rsplit_once(':').ok_or_else(bad)?;
        let port = port.parse().map_err(|_| bad())?;
        if name.is_empty() || target.is_empty() {
            return Err(bad());
        }
        Ok(Self {
            name: name.to_string(),
            port,
            target: target.to_string(),
            front: default_front_addr(),
        })
    }
}

impl AgentConfig {
    pub fn from_file(path: &Path) -> Result<Self, AgentError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("read {}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| AgentError::Config(format!("parse {}: {e}", path.display())))
    }

    pub fn workload(&self, name: &str, port: u16) -> Option<&WorkloadSpec> {
        self.workloads.iter().find(|w| w.name == name && w.port == port)
    }

    pub fn has_workload(&self, name: &str) -> bool {
        self.workloads.iter().any(|w| w.name == name)
    }
}
