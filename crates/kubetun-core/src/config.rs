//! `config.toml` parser for the daemon.
//!
//! Every field has a default so an absent or empty file is valid.
//! Durations are written as short strings: `"500ms"`, `"5s"`, `"2m"`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    /// Kubeconfig path; falls back to `$KUBECONFIG`, then `~/.kube/config`.
    pub kubeconfig: Option<PathBuf>,
    pub tunnel: TunnelConfig,
    pub outbound: OutboundConfig,
    pub intercept: InterceptConfig,
    /// Context name → remote agent address (`host:port`).
    pub agents: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub connect_attempts: u32,
    pub initial_backoff: String,
    pub max_backoff: String,
    pub connect_timeout: String,
    pub open_timeout: String,
    pub heartbeat_interval: String,
    pub heartbeat_timeout: String,
    /// Per-stream flow-control window in bytes.
    pub stream_window: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            initial_backoff: "200ms".to_string(),
            max_backoff: "5s".to_string(),
            connect_timeout: "10s".to_string(),
            open_timeout: "10s".to_string(),
            heartbeat_interval: "2s".to_string(),
            heartbeat_timeout: "6s".to_string(),
            stream_window: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    /// Listen address of the local outbound proxy.
    pub proxy_addr: String,
    /// Installer adapter: "none", "memory", or "iptables".
    pub installer: String,
    /// Extra CIDRs to divert.
    pub also_proxy: Vec<String>,
    /// CIDRs that are never diverted, even when inside a cluster subnet.
    pub never_proxy: Vec<String>,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            proxy_addr: "127.0.0.1:0".to_string(),
            installer: "none".to_string(),
            also_proxy: Vec::new(),
            never_proxy: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
    pub ack_timeout: String,
    /// Address intercepted traffic is delivered to.
    pub local_host: String,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            ack_timeout: "10s".to_string(),
            local_host: "127.0.0.1".to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, else from the default location if present,
    /// else defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(p) = path {
            return Self::from_file(p);
        }
        match default_config_path() {
            Some(p) if p.is_file() => Self::from_file(&p),
            _ => Ok(Self::default()),
        }
    }

    /// Check that every duration string parses.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("tunnel.initial_backoff", &self.tunnel.initial_backoff),
            ("tunnel.max_backoff", &self.tunnel.max_backoff),
            ("tunnel.connect_timeout", &self.tunnel.connect_timeout),
            ("tunnel.open_timeout", &self.tunnel.open_timeout),
            ("tunnel.heartbeat_interval", &self.tunnel.heartbeat_interval),
            ("tunnel.heartbeat_timeout", &self.tunnel.heartbeat_timeout),
            ("intercept.ack_timeout", &self.intercept.ack_timeout),
        ] {
            parse_duration(value).map_err(|e| anyhow::anyhow!("{name}: {e}"))?;
        }
        if self.tunnel.connect_attempts == 0 {
            anyhow::bail!("tunnel.connect_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// `$XDG_CONFIG_HOME/kubetun/config.toml` or `~/.config/kubetun/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(dir).join("kubetun").join("config.toml"));
    }
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".config").join("kubetun").join("config.toml"))
}

/// Parse `"250ms"`, `"5s"`, `"2m"`, `"1h"`. A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: u64 = num
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    let secs = |scale: u64| {
        value
            .checked_mul(scale)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration {s:?} is too large"))
    };
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => secs(60),
        "h" => secs(3600),
        other => Err(format!("unknown duration unit {other:?} in {s:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("3d").is_err());
        assert_eq!(parse_duration("3h").unwrap(), Duration::from_secs(10_800));
        let err = parse_duration(&format!("{}h", u64::MAX / 60)).unwrap_err();
        assert!(err.contains("too large"));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config.tunnel.connect_attempts, 5);
        assert_eq!(config.outbound.installer, "none");
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_config() {
        let toml_str = r#"
[tunnel]
heartbeat_interval = "500ms"

[outbound]
never_proxy = ["10.0.5.0/24"]

[agents]
kind-dev = "127.0.0.1:8081"
"#;
        let config: DaemonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.tunnel.heartbeat_interval, "500ms");
        assert_eq!(config.tunnel.heartbeat_timeout, "6s");
        assert_eq!(config.outbound.never_proxy, vec!["10.0.5.0/24"]);
        assert_eq!(config.agents.get("kind-dev").unwrap(), "127.0.0.1:8081");
    }

    #[test]
    fn validate_rejects_bad_duration() {
        let mut config = DaemonConfig::default();
        config.intercept.ack_timeout = "soon".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("intercept.ack_timeout"));
    }

    #[test]
    fn from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, DaemonConfig::default().to_toml_string().unwrap()).unwrap();
        let config = DaemonConfig::from_file(&path).unwrap();
        assert_eq!(config.tunnel.stream_window, 256 * 1024);
    }
}
