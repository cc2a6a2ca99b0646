//! Tunnel listener and per-tunnel request handling.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kubetun_core::protocol::{AgentErrorKind, AgentRequest, AgentResponse, SessionGrant, StreamMeta};
use kubetun_core::InterceptKey;
use kubetun_tunnel::{relay, IncomingStream, Role, Transport, TransportConfig};
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::dial::dial;
use crate::error::AgentError;
use crate::front;
use crate::registry::Registry;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

struct AgentState {
    config: AgentConfig,
    transport_config: TransportConfig,
    registry: Arc<Registry>,
    next_tunnel: AtomicU64,
    live_tunnels: AtomicUsize,
}

/// A started agent. Dropping it leaves the tasks running; call
/// [`RunningAgent::shutdown`] to stop them.
pub struct RunningAgent {
    tunnel_addr: SocketAddr,
    fronts: HashMap<InterceptKey, SocketAddr>,
    state: Arc<AgentState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningAgent {
    /// Bind the tunnel listener and every workload front, then serve.
    pub async fn start(config: AgentConfig) -> Result<Self, AgentError> {
        let transport_config = TransportConfig::from_settings(&config.tunnel).map_err(AgentError::Config)?;
        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(|source| AgentError::Bind {
                addr: config.listen.clone(),
                source,
            })?;
        let tunnel_addr = listener.local_addr()?;

        let state = Arc::new(AgentState {
            config,
            transport_config,
            registry: Arc::new(Registry::default()),
            next_tunnel: AtomicU64::new(1),
            live_tunnels: AtomicUsize::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let mut fronts = HashMap::new();

        for spec in &state.config.workloads {
            let front_listener = front::bind(spec).await?;
            let addr = front_listener.local_addr()?;
            info!(workload = %spec.name, port = spec.port, front = %addr, target = %spec.target, "workload front listening");
            fronts.insert(InterceptKey::new(spec.name.clone(), spec.port), addr);
            tasks.push(tokio::spawn(front::serve(
                front_listener,
                spec.clone(),
                state.registry.clone(),
                shutdown_rx.clone(),
            )));
        }

        info!(addr = %tunnel_addr, "agent tunnel listener ready");
        tasks.push(tokio::spawn(accept_tunnels(listener, state.clone(), shutdown_rx)));

        Ok(Self {
            tunnel_addr,
            fronts,
            state,
            shutdown_tx,
            tasks,
        })
    }

    pub fn tunnel_addr(&self) -> SocketAddr {
        self.tunnel_addr
    }

    /// Address of the front standing in for `workload:port`.
    pub fn front_addr(&self, workload: &str, port: u16) -> Option<SocketAddr> {
        self.fronts.get(&InterceptKey::new(workload, port)).copied()
    }

    /// Intercepts currently installed, from every tunnel.
    pub fn intercepts(&self) -> Vec<InterceptKey> {
        self.state.registry.keys()
    }

    pub fn live_tunnels(&self) -> usize {
        self.state.live_tunnels.load(Ordering::Relaxed)
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
        info!("agent stopped");
    }
}

async fn accept_tunnels(listener: TcpListener, state: Arc<AgentState>, mut shutdown: watch::Receiver<bool>) {
    let mut tunnels = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let id = state.next_tunnel.fetch_add(1, Ordering::Relaxed);
                    let transport = Transport::accept(socket, Role::Agent, state.transport_config.clone());
                    info!(tunnel = id, %peer, "tunnel opened");
                    tunnels.spawn(serve_tunnel(id, transport, state.clone(), shutdown.clone()));
                }
                Err(e) => warn!(error = %e, "tunnel accept failed"),
            },
            Some(_) = tunnels.join_next(), if !tunnels.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }
    tunnels.shutdown().await;
}

async fn serve_tunnel(id: u64, transport: Transport, state: Arc<AgentState>, mut shutdown: watch::Receiver<bool>) {
    let (Some(mut requests), Some(mut incoming)) = (transport.take_requests(), transport.take_incoming()) else {
        return;
    };
    state.live_tunnels.fetch_add(1, Ordering::Relaxed);
    let mut tunnel_state = transport.subscribe();
    let mut streams = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            Some(req) = requests.recv() => {
                let response = match req.parse::<AgentRequest>() {
                    Ok(request) => handle_request(id, request, &transport, &state),
                    Err(e) => AgentResponse::Error {
                        kind: AgentErrorKind::BadRequest,
                        message: e.to_string(),
                    },
                };
                if let Err(e) = req.respond(&response) {
                    debug!(tunnel = id, error = %e, "could not answer request");
                }
            }
            Some(inc) = incoming.recv() => {
                streams.spawn(serve_outbound(inc, state.clone()));
            }
            Some(_) = streams.join_next(), if !streams.is_empty() => {}
            changed = tunnel_state.changed() => {
                if changed.is_err() || !tunnel_state.borrow().is_open() {
                    break;
                }
            }
            _ = shutdown.changed() => {
                transport.close().await;
                break;
            }
        }
    }

    streams.shutdown().await;
    let released = state.registry.remove_owner(id);
    state.live_tunnels.fetch_sub(1, Ordering::Relaxed);
    info!(tunnel = id, state = %transport.state(), released, "tunnel closed");
}

fn handle_request(id: u64, request: AgentRequest, transport: &Transport, state: &AgentState) -> AgentResponse {
    match request {
        AgentRequest::Negotiate {
            context,
            namespace,
            client_version,
        } => {
            let config = &state.config;
            if !config.namespaces.is_empty() && !config.namespaces.contains(&namespace) {
                return AgentResponse::Error {
                    kind: AgentErrorKind::BadRequest,
                    message: format!("namespace {namespace:?} does not exist"),
                };
            }
            let mut raw = [0u8; 8];
            rand::thread_rng().fill_bytes(&mut raw);
            let session_id = hex::encode(raw);
            info!(tunnel = id, %session_id, %context, %namespace, %client_version, "session negotiated");
            AgentResponse::Session(SessionGrant {
                session_id,
                context,
                namespace,
                cluster_domain: config.cluster_domain.clone(),
                namespaces: config.namespaces.clone(),
                service_subnets: config.service_subnets.clone(),
                pod_subnets: config.pod_subnets.clone(),
            })
        }
        AgentRequest::InstallIntercept { workload, port } => {
            if !state.config.has_workload(&workload) {
                return AgentResponse::Error {
                    kind: AgentErrorKind::DeploymentNotFound,
                    message: format!("deployment {workload:?} not found"),
                };
            }
            if state.config.workload(&workload, port).is_none() {
                return AgentResponse::Error {
                    kind: AgentErrorKind::Rejected,
                    message: format!("{workload} does not expose port {port}"),
                };
            }
            let key = InterceptKey::new(workload, port);
            match state.registry.install(key.clone(), id, transport) {
                Ok(intercept_id) => {
                    info!(tunnel = id, intercept = %key, %intercept_id, "intercept installed");
                    AgentResponse::Installed { intercept_id }
                }
                Err(message) => AgentResponse::Error {
                    kind: AgentErrorKind::Conflict,
                    message,
                },
            }
        }
        AgentRequest::UninstallIntercept { workload, port } => {
            let key = InterceptKey::new(workload, port);
            if state.registry.uninstall(&key, id) {
                info!(tunnel = id, intercept = %key, "intercept uninstalled");
            }
            AgentResponse::Uninstalled
        }
    }
}

/// Dial the destination an outbound stream names and relay to it.
async fn serve_outbound(inc: IncomingStream, state: Arc<AgentState>) {
    let Some(StreamMeta::Outbound { host, port }) = inc.meta().cloned() else {
        inc.refuse("agent only accepts outbound streams");
        return;
    };
    let socket = match dial(&state.config.resolve, &host, port, DIAL_TIMEOUT).await {
        Ok(s) => s,
        Err(reason) => {
            debug!(%host, port, %reason, "outbound dial failed");
            inc.refuse(&reason);
            return;
        }
    };
    let stream = match inc.accept() {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, "outbound accept failed");
            return;
        }
    };
    let stats = relay(socket, stream).await;
    debug!(%host, port, up = stats.bytes_up, down = stats.bytes_down, "outbound connection finished");
}
