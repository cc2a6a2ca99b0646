//! The intercept table and its lifecycle.
//!
//! ```text
//!  add ──► Requested ──ack──► Active ──remove──► Removing ──► (deleted)
//!              │
//!              └─reject / timeout──► Failed
//! ```
//!
//! The table lock is held only to check and flip states, never across a
//! network round trip. A key that is Requested, Active, or Removing makes
//! a second `add` fail with a conflict, so exactly one concurrent caller
//! wins. Failed entries stay visible for diagnosis but never block a retry.
//!
//! The local target does not have to be listening when the intercept is
//! added. Until it is, the dispatcher refuses inbound streams and the agent
//! falls back to the workload.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kubetun_core::protocol::{AgentErrorKind, AgentRequest, AgentResponse};
use kubetun_core::{InterceptInfo, InterceptKey, InterceptState};
use kubetun_tunnel::{Transport, TunnelError};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::InterceptError;

#[derive(Debug, Clone)]
pub struct InterceptSettings {
    /// Bound on the agent's install/uninstall acknowledgement.
    pub ack_timeout: Duration,
    /// Host intercepted traffic is delivered to.
    pub local_host: String,
    /// Bound on connecting to the local target.
    pub local_connect_timeout: Duration,
}

impl Default for InterceptSettings {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
            local_host: "127.0.0.1".to_string(),
            local_connect_timeout: Duration::from_secs(2),
        }
    }
}

pub struct InterceptManager {
    transport: Transport,
    settings: InterceptSettings,
    table: Mutex<HashMap<InterceptKey, InterceptInfo>>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl InterceptManager {
    pub fn new(transport: Transport, settings: InterceptSettings) -> Arc<Self> {
        Arc::new(Self {
            transport,
            settings,
            table: Mutex::new(HashMap::new()),
            dispatcher: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &InterceptSettings {
        &self.settings
    }

    /// Start handing inbound streams to local listeners.
    pub fn start_dispatcher(self: &Arc<Self>) -> Result<(), InterceptError> {
        let incoming = self.transport.take_incoming().ok_or(InterceptError::DispatcherTaken)?;
        let dispatcher = Dispatcher::spawn(Arc::downgrade(self), incoming);
        *lock(&self.dispatcher) = Some(dispatcher);
        Ok(())
    }

    /// Stop the dispatcher and abort its relays.
    pub async fn stop_dispatcher(&self) {
        let dispatcher = lock(&self.dispatcher).take();
        if let Some(d) = dispatcher {
            d.stop().await;
        }
    }

    /// Redirect `workload:remote_port` in the cluster to `local_port` here.
    pub async fn add_intercept(
        &self,
        workload: &str,
        remote_port: u16,
        local_port: u16,
    ) -> Result<InterceptInfo, InterceptError> {
        let key = InterceptKey::new(workload, remote_port);
        {
            let mut table = lock(&self.table);
            if let Some(existing) = table.get(&key) {
                if existing.state != InterceptState::Failed {
                    return Err(InterceptError::Conflict(key.to_string()));
                }
            }
            table.insert(
                key.clone(),
                InterceptInfo {
                    workload: workload.to_string(),
                    remote_port,
                    local_addr: self.settings.local_host.clone(),
                    local_port,
                    state: InterceptState::Requested,
                    intercept_id: None,
                    reason: None,
                },
            );
        }
        debug!(intercept = %key, local_port, "intercept requested");

        let local = format!("{}:{local_port}", self.settings.local_host);
        if let Err(reason) = self.probe_local(&local).await {
            warn!(intercept = %key, %local, %reason, "local target is not accepting connections yet");
        }

        let request = AgentRequest::InstallIntercept {
            workload: workload.to_string(),
            port: remote_port,
        };
        let response: Result<AgentResponse, TunnelError> =
            self.transport.request(&request, self.settings.ack_timeout).await;

        let err = match response {
            Ok(AgentResponse::Installed { intercept_id }) => {
                let activated = {
                    let mut table = lock(&self.table);
                    match table.get_mut(&key) {
                        Some(entry) if entry.state == InterceptState::Requested => {
                            entry.state = InterceptState::Active;
                            entry.intercept_id = Some(intercept_id.clone());
                            Some(entry.clone())
                        }
                        _ => None,
                    }
                };
                return match activated {
                    Some(info) => {
                        info!(intercept = %key, %intercept_id, %local, "intercept active");
                        Ok(info)
                    }
                    None => {
                        // Removed while the install was in flight.
                        self.uninstall_remote(&key).await;
                        Err(InterceptError::Rejected(format!("{key} was removed while installing")))
                    }
                };
            }
            Ok(AgentResponse::Error { kind, message }) => match kind {
                AgentErrorKind::DeploymentNotFound => InterceptError::DeploymentNotFound(message),
                AgentErrorKind::Conflict => InterceptError::Conflict(message),
                AgentErrorKind::Rejected | AgentErrorKind::BadRequest => InterceptError::Rejected(message),
            },
            Ok(other) => InterceptError::Rejected(format!("unexpected agent response: {other:?}")),
            Err(TunnelError::Timeout(_)) => {
                // A late ack would leave the redirect in place on the agent.
                self.uninstall_remote(&key).await;
                InterceptError::Timeout(key.to_string())
            }
            Err(e) => InterceptError::Tunnel(e),
        };
        self.mark_failed(&key, &err);
        Err(err)
    }

    /// Stop redirecting `workload:remote_port`. Removing an unknown key succeeds.
    pub async fn remove_intercept(&self, workload: &str, remote_port: u16) -> Result<Option<InterceptInfo>, InterceptError> {
        let key = InterceptKey::new(workload, remote_port);
        let installed = {
            let mut table = lock(&self.table);
            let Some(state) = table.get(&key).map(|e| e.state) else {
                return Ok(None);
            };
            match state {
                InterceptState::Failed => {
                    table.remove(&key);
                    return Ok(None);
                }
                InterceptState::Removing | InterceptState::Removed => return Ok(None),
                InterceptState::Requested | InterceptState::Active => {
                    if let Some(entry) = table.get_mut(&key) {
                        entry.state = InterceptState::Removing;
                    }
                    state == InterceptState::Active
                }
            }
        };

        if installed {
            self.uninstall_remote(&key).await;
        }

        let removed = lock(&self.table).remove(&key).map(|mut info| {
            info.state = InterceptState::Removed;
            info
        });
        info!(intercept = %key, "intercept removed");
        Ok(removed)
    }

    /// Remove every intercept of `workload`, whatever its port.
    pub async fn remove_workload(&self, workload: &str) -> Result<Vec<InterceptInfo>, InterceptError> {
        let ports: Vec<u16> = lock(&self.table)
            .keys()
            .filter(|k| k.workload == workload)
            .map(|k| k.remote_port)
            .collect();
        let mut removed = Vec::new();
        for port in ports {
            if let Some(info) = self.remove_intercept(workload, port).await? {
                removed.push(info);
            }
        }
        Ok(removed)
    }

    /// Remove everything. Used by session teardown while the tunnel is still up.
    pub async fn remove_all(&self) {
        let keys: Vec<InterceptKey> = lock(&self.table).keys().cloned().collect();
        for key in keys {
            if let Err(e) = self.remove_intercept(&key.workload, key.remote_port).await {
                warn!(intercept = %key, error = %e, "failed to remove intercept");
            }
        }
        lock(&self.table).clear();
    }

    /// Intercepts that are Requested, Active, or Removing, ordered by key.
    pub fn list(&self) -> Vec<InterceptInfo> {
        let mut list: Vec<InterceptInfo> = lock(&self.table)
            .values()
            .filter(|i| !matches!(i.state, InterceptState::Failed | InterceptState::Removed))
            .cloned()
            .collect();
        list.sort_by_key(|i| i.key());
        list
    }

    pub fn get(&self, workload: &str, remote_port: u16) -> Option<InterceptInfo> {
        lock(&self.table).get(&InterceptKey::new(workload, remote_port)).cloned()
    }

    /// Local target of an Active intercept.
    pub(crate) fn active_target(&self, key: &InterceptKey) -> Option<String> {
        lock(&self.table)
            .get(key)
            .filter(|i| i.state == InterceptState::Active)
            .map(|i| format!("{}:{}", i.local_addr, i.local_port))
    }

    async fn probe_local(&self, addr: &str) -> Result<(), String> {
        match tokio::time::timeout(self.settings.local_connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("connect timed out".to_string()),
        }
    }

    async fn uninstall_remote(&self, key: &InterceptKey) {
        if !self.transport.is_open() {
            debug!(intercept = %key, "tunnel down, skipping remote uninstall");
            return;
        }
        let request = AgentRequest::UninstallIntercept {
            workload: key.workload.clone(),
            port: key.remote_port,
        };
        match self
            .transport
            .request::<_, AgentResponse>(&request, self.settings.ack_timeout)
            .await
        {
            Ok(AgentResponse::Uninstalled) => {}
            Ok(other) => warn!(intercept = %key, response = ?other, "unexpected uninstall response"),
            Err(e) => warn!(intercept = %key, error = %e, "uninstall not confirmed"),
        }
    }

    fn mark_failed(&self, key: &InterceptKey, err: &InterceptError) {
        warn!(intercept = %key, error = %err, "intercept failed");
        if let Some(entry) = lock(&self.table).get_mut(key) {
            if entry.state == InterceptState::Requested {
                entry.state = InterceptState::Failed;
                entry.reason = Some(err.to_string());
            }
        }
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}
