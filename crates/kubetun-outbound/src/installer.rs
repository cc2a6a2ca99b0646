//! OS-level override installation.
//!
//! The engine never touches the host's network configuration directly; it
//! hands an [`InstallPlan`] to an [`OverrideInstaller`]. Uninstall must be
//! idempotent so it can double as stale-state cleanup after a crash.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kubetun_rules::Cidr;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::OutboundError;

/// What an installer is asked to put in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    /// Port of the local proxy listener.
    pub proxy_port: u16,
    /// Destinations to redirect to the proxy.
    pub divert_cidrs: Vec<Cidr>,
    /// Destinations exempt from redirection, evaluated first.
    pub pass_cidrs: Vec<Cidr>,
}

#[async_trait]
pub trait OverrideInstaller: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether connections reach the proxy through a transparent redirect
    /// rather than an explicit CONNECT preamble.
    fn transparent(&self) -> bool {
        false
    }

    async fn install(&self, plan: &InstallPlan) -> Result<(), OutboundError>;

    /// Remove everything `install` created. Succeeds when nothing is installed.
    async fn uninstall(&self) -> Result<(), OutboundError>;

    /// Whether state from an earlier run is still in place.
    async fn has_stale_state(&self) -> Result<bool, OutboundError>;
}

/// Build the installer named in `[outbound] installer`.
pub fn installer_for(name: &str) -> Result<Arc<dyn OverrideInstaller>, OutboundError> {
    match name {
        "none" | "" => Ok(Arc::new(NoopInstaller)),
        "memory" => Ok(Arc::new(MemoryInstaller::new())),
        "iptables" => Ok(Arc::new(IptablesInstaller::new())),
        other => Err(OutboundError::UnknownInstaller(other.to_string())),
    }
}

// ── No-op ──────────────────────────────────────────────────────────

/// Explicit-proxy mode: callers connect to the proxy themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstaller;

#[async_trait]
impl OverrideInstaller for NoopInstaller {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn install(&self, plan: &InstallPlan) -> Result<(), OutboundError> {
        debug!(proxy_port = plan.proxy_port, "explicit proxy mode, nothing to install");
        Ok(())
    }

    async fn uninstall(&self) -> Result<(), OutboundError> {
        Ok(())
    }

    async fn has_stale_state(&self) -> Result<bool, OutboundError> {
        Ok(false)
    }
}

// ── In-memory ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryState {
    installed: Option<InstallPlan>,
    installs: u32,
    uninstalls: u32,
    fail_next_install: bool,
}

/// Records what would be installed. Clones share state, so a test can keep
/// a handle while the engine owns another.
#[derive(Debug, Default, Clone)]
pub struct MemoryInstaller {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// The plan currently installed.
    pub fn installed(&self) -> Option<InstallPlan> {
        self.lock().installed.clone()
    }

    pub fn install_count(&self) -> u32 {
        self.lock().installs
    }

    pub fn uninstall_count(&self) -> u32 {
        self.lock().uninstalls
    }

    /// Make the next `install` fail.
    pub fn fail_next_install(&self) {
        self.lock().fail_next_install = true;
    }

    /// Pretend an earlier process left its plan installed.
    pub fn leave_stale(&self, plan: InstallPlan) {
        self.lock().installed = Some(plan);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl OverrideInstaller for MemoryInstaller {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn install(&self, plan: &InstallPlan) -> Result<(), OutboundError> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_install) {
            return Err(OutboundError::Install {
                installer: "memory".to_string(),
                message: "injected failure".to_string(),
            });
        }
        state.installed = Some(plan.clone());
        state.installs += 1;
        Ok(())
    }

    async fn uninstall(&self) -> Result<(), OutboundError> {
        let mut state = self.lock();
        state.installed = None;
        state.uninstalls += 1;
        Ok(())
    }

    async fn has_stale_state(&self) -> Result<bool, OutboundError> {
        Ok(self.lock().installed.is_some())
    }
}

// ── iptables ───────────────────────────────────────────────────────

/// Dedicated nat chain holding every kubetun redirect.
pub const IPTABLES_CHAIN: &str = "KUBETUN-OUTBOUND";

/// Transparent mode on Linux: a nat chain hooked from OUTPUT redirects the
/// divert CIDRs to the proxy port. Requires CAP_NET_ADMIN.
#[derive(Debug, Clone)]
pub struct IptablesInstaller {
    binary: String,
}

impl Default for IptablesInstaller {
    fn default() -> Self {
        Self::new()
    }
}

impl IptablesInstaller {
    pub fn new() -> Self {
        Self::with_binary("iptables")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Argument lists that build the chain for `plan`, in order.
    pub fn install_commands(plan: &InstallPlan) -> Vec<Vec<String>> {
        let mut cmds = vec![args(&["-t", "nat", "-N", IPTABLES_CHAIN])];
        // Pass rules first: RETURN leaves the packet alone.
        for cidr in plan.pass_cidrs.iter().filter(|c| c.network().is_ipv4()) {
            cmds.push(args(&["-t", "nat", "-A", IPTABLES_CHAIN, "-d", &cidr.to_string(), "-j", "RETURN"]));
        }
        // Never redirect the proxy's own loopback traffic.
        cmds.push(args(&["-t", "nat", "-A", IPTABLES_CHAIN, "-d", "127.0.0.0/8", "-j", "RETURN"]));
        let port = plan.proxy_port.to_string();
        for cidr in plan.divert_cidrs.iter().filter(|c| c.network().is_ipv4()) {
            cmds.push(args(&[
                "-t",
                "nat",
                "-A",
                IPTABLES_CHAIN,
                "-p",
                "tcp",
                "-d",
                &cidr.to_string(),
                "-j",
                "REDIRECT",
                "--to-ports",
                &port,
            ]));
        }
        cmds.push(args(&["-t", "nat", "-A", "OUTPUT", "-p", "tcp", "-j", IPTABLES_CHAIN]));
        cmds
    }

    /// Argument lists that tear the chain down. Each may fail harmlessly.
    pub fn uninstall_commands() -> Vec<Vec<String>> {
        vec![
            args(&["-t", "nat", "-D", "OUTPUT", "-p", "tcp", "-j", IPTABLES_CHAIN]),
            args(&["-t", "nat", "-F", IPTABLES_CHAIN]),
            args(&["-t", "nat", "-X", IPTABLES_CHAIN]),
        ]
    }

    async fn run(&self, argv: &[String]) -> Result<std::process::Output, OutboundError> {
        debug!(binary = %self.binary, args = ?argv, "running installer command");
        Command::new(&self.binary)
            .args(argv)
            .output()
            .await
            .map_err(|e| OutboundError::Install {
                installer: "iptables".to_string(),
                message: format!("failed to execute {}: {e}", self.binary),
            })
    }
}

#[async_trait]
impl OverrideInstaller for IptablesInstaller {
    fn name(&self) -> &'static str {
        "iptables"
    }

    fn transparent(&self) -> bool {
        true
    }

    async fn install(&self, plan: &InstallPlan) -> Result<(), OutboundError> {
        let skipped = plan.divert_cidrs.iter().filter(|c| !c.network().is_ipv4()).count();
        if skipped > 0 {
            warn!(skipped, "IPv6 divert CIDRs are not redirected by the iptables installer");
        }
        // Start from a clean chain in case an earlier run left one behind.
        self.uninstall().await?;
        for argv in Self::install_commands(plan) {
            let output = self.run(&argv).await?;
            if !output.status.success() {
                let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let _ = self.uninstall().await;
                return Err(OutboundError::Install {
                    installer: "iptables".to_string(),
                    message: format!("{}: {message}", argv.join(" ")),
                });
            }
        }
        info!(
            chain = IPTABLES_CHAIN,
            proxy_port = plan.proxy_port,
            divert = plan.divert_cidrs.len(),
            "installed iptables redirect"
        );
        Ok(())
    }

    async fn uninstall(&self) -> Result<(), OutboundError> {
        for argv in Self::uninstall_commands() {
            let output = self.run(&argv).await?;
            if !output.status.success() {
                debug!(args = ?argv, "iptables cleanup step had nothing to remove");
            }
        }
        Ok(())
    }

    async fn has_stale_state(&self) -> Result<bool, OutboundError> {
        let output = self.run(&args(&["-t", "nat", "-S", IPTABLES_CHAIN])).await?;
        Ok(output.status.success())
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
