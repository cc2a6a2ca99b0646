//! The session state machine.
//!
//! ```text
//!  Disconnected ──connect──► Connecting ──negotiated──► Connected
//!       ▲                        │                          │
//!       └──────── rollback ──────┘     disconnect / tunnel failure
//!       │                                                   ▼
//!       └──────────────────────────────────────────── Disconnecting
//! ```
//!
//! Mutations (connect, disconnect, intercept changes, the failure cascade)
//! hold the async operation lock for their whole duration. `status` reads a
//! separate snapshot and never waits on the lock or the network.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use kubetun_core::config::parse_duration;
use kubetun_core::protocol::{AgentRequest, AgentResponse, SessionGrant};
use kubetun_core::{DaemonConfig, InterceptInfo, SessionInfo, SessionStatus, StatusReport, epoch_secs};
use kubetun_intercept::{InterceptManager, InterceptSettings};
use kubetun_outbound::{EngineSettings, OutboundEngine, OverrideInstaller};
use kubetun_rules::{RuleSource, RuleStore};
use kubetun_tunnel::{Role, Transport, TransportConfig, TransportState, TunnelError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::resolver::{ConnectTarget, ContextResolver};

/// Everything a session needs from the daemon configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub transport: TransportConfig,
    /// Bound on the negotiate round trip.
    pub negotiate_timeout: Duration,
    pub engine: EngineSettings,
    pub intercept: InterceptSettings,
    pub also_proxy: Vec<String>,
    pub never_proxy: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            negotiate_timeout: Duration::from_secs(10),
            engine: EngineSettings::default(),
            intercept: InterceptSettings::default(),
            also_proxy: Vec::new(),
            never_proxy: Vec::new(),
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &DaemonConfig) -> Result<Self, String> {
        let transport = TransportConfig::from_settings(&config.tunnel)?;
        Ok(Self {
            negotiate_timeout: transport.connect_timeout,
            engine: EngineSettings {
                proxy_addr: config.outbound.proxy_addr.clone(),
                dial_timeout: transport.connect_timeout,
                ..EngineSettings::default()
            },
            intercept: InterceptSettings {
                ack_timeout: parse_duration(&config.intercept.ack_timeout)?,
                local_host: config.intercept.local_host.clone(),
                ..InterceptSettings::default()
            },
            also_proxy: config.outbound.also_proxy.clone(),
            never_proxy: config.outbound.never_proxy.clone(),
            transport,
        })
    }
}

struct ActiveSession {
    info: SessionInfo,
    transport: Transport,
    intercepts: Arc<InterceptManager>,
    /// Distinguishes this session from later ones for the failure watcher.
    epoch: u64,
}

#[derive(Default)]
struct Snapshot {
    status: SessionStatus,
    session: Option<SessionInfo>,
    intercepts: Option<Arc<InterceptManager>>,
}

pub struct SessionManager {
    resolver: Arc<dyn ContextResolver>,
    engine: OutboundEngine,
    settings: SessionSettings,
    op: Mutex<Option<ActiveSession>>,
    snapshot: RwLock<Snapshot>,
    epoch: AtomicU64,
}

impl SessionManager {
    pub fn new(
        resolver: Arc<dyn ContextResolver>,
        installer: Arc<dyn OverrideInstaller>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            engine: OutboundEngine::new(installer),
            settings,
            op: Mutex::new(None),
            snapshot: RwLock::new(Snapshot::default()),
            epoch: AtomicU64::new(0),
        })
    }

    pub fn engine(&self) -> &OutboundEngine {
        &self.engine
    }

    /// Remove override state left behind by a daemon that did not exit cleanly.
    pub async fn recover_stale_state(&self) -> Result<bool, SessionError> {
        let installer = self.engine.installer();
        if !installer.has_stale_state().await? {
            return Ok(false);
        }
        warn!(installer = installer.name(), "removing stale outbound override state");
        installer.uninstall().await?;
        Ok(true)
    }

    /// Open a session. `None` picks the resolver's default.
    ///
    /// The work runs on its own task: a caller that is cancelled part way
    /// leaves either a complete session or none, never a half-built one.
    pub async fn connect(
        self: &Arc<Self>,
        context: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<SessionInfo, SessionError> {
        let manager = self.clone();
        let context = context.map(str::to_owned);
        let namespace = namespace.map(str::to_owned);
        tokio::spawn(async move { manager.connect_locked(context.as_deref(), namespace.as_deref()).await }).await?
    }

    /// Tear the session down. Returns the session that was closed, if any.
    /// Like `connect`, runs to completion even if the caller goes away.
    pub async fn disconnect(self: &Arc<Self>) -> Option<SessionInfo> {
        let manager = self.clone();
        match tokio::spawn(async move { manager.disconnect_locked().await }).await {
            Ok(closed) => closed,
            Err(e) => {
                warn!(error = %e, "disconnect task failed");
                None
            }
        }
    }

    async fn connect_locked(
        self: Arc<Self>,
        context: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<SessionInfo, SessionError> {
        let mut op = self.op.lock().await;
        if let Some(active) = op.as_ref() {
            return Err(already_connected(&active.info, context, namespace));
        }

        let target = self.resolver.resolve(context, namespace).map_err(SessionError::Config)?;
        info!(context = %target.context, namespace = %target.namespace, agent = %target.agent_addr, "connecting");
        self.set_snapshot(SessionStatus::Connecting, None, None);

        let active = match self.establish(&target).await {
            Ok(active) => active,
            Err(e) => {
                warn!(context = %target.context, error = %e, "connect failed");
                self.set_snapshot(SessionStatus::Disconnected, None, None);
                return Err(e);
            }
        };

        self.spawn_watcher(&active.transport, active.epoch);
        self.set_snapshot(
            SessionStatus::Connected,
            Some(active.info.clone()),
            Some(active.intercepts.clone()),
        );
        info!(
            session_id = %active.info.session_id,
            context = %active.info.context,
            namespace = %active.info.namespace,
            "connected"
        );
        let info = active.info.clone();
        *op = Some(active);
        Ok(info)
    }

    async fn disconnect_locked(&self) -> Option<SessionInfo> {
        let mut op = self.op.lock().await;
        let active = op.take()?;
        Some(self.teardown(active, "disconnect requested").await)
    }

    /// In-memory status; never touches the network.
    pub fn status(&self) -> StatusReport {
        let snapshot = self.snapshot.read().unwrap_or_else(|p| p.into_inner());
        let engine = self.engine.status();
        StatusReport {
            status: snapshot.status,
            session: snapshot.session.clone(),
            outbound_active: engine.as_ref().is_some_and(|s| s.divert_rules > 0),
            divert_rules: engine.as_ref().map_or(0, |s| s.divert_rules),
            proxy_addr: engine.map(|s| s.listen_addr.to_string()),
            intercepts: snapshot.intercepts.as_ref().map(|m| m.list()).unwrap_or_default(),
        }
    }

    pub async fn add_intercept(
        &self,
        workload: &str,
        remote_port: u16,
        local_port: u16,
    ) -> Result<InterceptInfo, SessionError> {
        let op = self.op.lock().await;
        let active = op.as_ref().ok_or(SessionError::NotConnected)?;
        Ok(active.intercepts.add_intercept(workload, remote_port, local_port).await?)
    }

    /// Remove one intercept, or every intercept of `workload` when `remote_port` is `None`.
    pub async fn remove_intercept(
        &self,
        workload: &str,
        remote_port: Option<u16>,
    ) -> Result<Vec<InterceptInfo>, SessionError> {
        let op = self.op.lock().await;
        let active = op.as_ref().ok_or(SessionError::NotConnected)?;
        let removed = match remote_port {
            Some(port) => active
                .intercepts
                .remove_intercept(workload, port)
                .await?
                .into_iter()
                .collect(),
            None => active.intercepts.remove_workload(workload).await?,
        };
        Ok(removed)
    }

    /// Connect the tunnel, negotiate, and bring the engine and dispatcher up.
    /// On failure everything started so far is stopped again.
    async fn establish(&self, target: &ConnectTarget) -> Result<ActiveSession, SessionError> {
        let transport = Transport::connect(&target.agent_addr, Role::Daemon, self.settings.transport.clone()).await?;

        let grant = match self.negotiate(&transport, target).await {
            Ok(grant) => grant,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };

        let rules = match RuleStore::from_source(&RuleSource {
            namespace: grant.namespace.clone(),
            namespaces: grant.namespaces.clone(),
            cluster_domain: grant.cluster_domain.clone(),
            service_subnets: grant.service_subnets.clone(),
            pod_subnets: grant.pod_subnets.clone(),
            also_proxy: self.settings.also_proxy.clone(),
            never_proxy: self.settings.never_proxy.clone(),
        }) {
            Ok(rules) => rules,
            Err(e) => {
                transport.close().await;
                return Err(e.into());
            }
        };

        let engine_settings = EngineSettings {
            namespace: grant.namespace.clone(),
            ..self.settings.engine.clone()
        };
        if let Err(e) = self.engine.activate(rules, transport.clone(), engine_settings).await {
            transport.close().await;
            return Err(e.into());
        }

        let intercepts = InterceptManager::new(transport.clone(), self.settings.intercept.clone());
        if let Err(e) = intercepts.start_dispatcher() {
            self.deactivate_engine().await;
            transport.close().await;
            return Err(e.into());
        }

        Ok(ActiveSession {
            info: SessionInfo {
                session_id: grant.session_id,
                context: grant.context,
                namespace: grant.namespace,
                agent_addr: target.agent_addr.clone(),
                created_at: epoch_secs(),
            },
            transport,
            intercepts,
            epoch: self.epoch.fetch_add(1, Ordering::Relaxed) + 1,
        })
    }

    async fn negotiate(&self, transport: &Transport, target: &ConnectTarget) -> Result<SessionGrant, SessionError> {
        let request = AgentRequest::Negotiate {
            context: target.context.clone(),
            namespace: target.namespace.clone(),
            client_version: kubetun_core::VERSION.to_string(),
        };
        let response: AgentResponse = transport.request(&request, self.settings.negotiate_timeout).await?;
        match response {
            AgentResponse::Session(grant) => {
                debug!(session_id = %grant.session_id, cluster_domain = %grant.cluster_domain, "negotiated");
                Ok(grant)
            }
            AgentResponse::Error { kind, message } => Err(SessionError::Agent { kind, message }),
            other => Err(TunnelError::Protocol(format!("unexpected negotiate response: {other:?}")).into()),
        }
    }

    /// Intercepts first while the tunnel can still carry the uninstalls,
    /// then the engine, then the tunnel.
    async fn teardown(&self, active: ActiveSession, reason: &str) -> SessionInfo {
        info!(session_id = %active.info.session_id, %reason, "disconnecting");
        self.set_snapshot(
            SessionStatus::Disconnecting,
            Some(active.info.clone()),
            Some(active.intercepts.clone()),
        );

        active.intercepts.remove_all().await;
        active.intercepts.stop_dispatcher().await;
        self.deactivate_engine().await;
        active.transport.close().await;

        self.set_snapshot(SessionStatus::Disconnected, None, None);
        info!(session_id = %active.info.session_id, "disconnected");
        active.info
    }

    async fn deactivate_engine(&self) {
        if let Err(e) = self.engine.deactivate().await {
            warn!(error = %e, "outbound override deactivation failed");
        }
    }

    fn spawn_watcher(self: &Arc<Self>, transport: &Transport, epoch: u64) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let mut state = transport.subscribe();
        tokio::spawn(async move {
            loop {
                let current = state.borrow_and_update().clone();
                match current {
                    TransportState::Open => {}
                    TransportState::Closed => return,
                    TransportState::Failed(reason) => {
                        if let Some(manager) = manager.upgrade() {
                            manager.handle_failure(epoch, &reason).await;
                        }
                        return;
                    }
                }
                if state.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    async fn handle_failure(&self, epoch: u64, reason: &str) {
        let mut op = self.op.lock().await;
        if op.as_ref().map(|a| a.epoch) != Some(epoch) {
            return;
        }
        if let Some(active) = op.take() {
            warn!(session_id = %active.info.session_id, %reason, "tunnel failed");
            self.teardown(active, reason).await;
        }
    }

    fn set_snapshot(
        &self,
        status: SessionStatus,
        session: Option<SessionInfo>,
        intercepts: Option<Arc<InterceptManager>>,
    ) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(|p| p.into_inner());
        *snapshot = Snapshot {
            status,
            session,
            intercepts,
        };
    }
}

fn already_connected(current: &SessionInfo, context: Option<&str>, namespace: Option<&str>) -> SessionError {
    let identical =
        context.is_none_or(|c| c == current.context) && namespace.is_none_or(|n| n == current.namespace);
    let message = if identical {
        format!(
            "already connected to {} in namespace {}",
            current.context, current.namespace
        )
    } else {
        format!(
            "already connected to {} in namespace {}; requested {} in namespace {}",
            current.context,
            current.namespace,
            context.unwrap_or(&current.context),
            namespace.unwrap_or(&current.namespace),
        )
    };
    SessionError::AlreadyConnected {
        identical,
        session: current.clone(),
        message,
    }
}
