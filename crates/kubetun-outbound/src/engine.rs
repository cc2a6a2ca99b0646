//! The outbound override engine.
//!
//! `activate` binds the proxy listener, installs the platform hooks, and
//! starts the accept loop; if any step fails the earlier ones are undone.
//! `deactivate` stops the loop, aborts every relay, and uninstalls.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use kubetun_core::protocol::StreamMeta;
use kubetun_rules::{Action, Destination, RuleStore};
use kubetun_tunnel::{relay, Transport};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::OutboundError;
use crate::installer::{InstallPlan, OverrideInstaller};
use crate::original_dst::original_dst;
use crate::preamble::{ConnectRequest, ConnectResponse, ProxyStatus, TargetAddress};

/// How long a client has to send its CONNECT preamble.
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Listen address of the proxy; port 0 picks a free one.
    pub proxy_addr: String,
    /// Namespace short names are qualified with.
    pub namespace: String,
    /// Bound on direct dials for Pass destinations.
    pub dial_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            proxy_addr: "127.0.0.1:0".to_string(),
            namespace: "default".to_string(),
            dial_timeout: Duration::from_secs(10),
        }
    }
}

/// Connection counters, cumulative over the engine's lifetime.
#[derive(Debug, Default)]
pub struct EngineCounters {
    diverted: AtomicU64,
    passed: AtomicU64,
    failed: AtomicU64,
}

impl EngineCounters {
    pub fn diverted(&self) -> u64 {
        self.diverted.load(Ordering::Relaxed)
    }

    pub fn passed(&self) -> u64 {
        self.passed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Snapshot of an active engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub listen_addr: SocketAddr,
    pub divert_rules: usize,
}

struct Active {
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

pub struct OutboundEngine {
    installer: Arc<dyn OverrideInstaller>,
    active: Mutex<Option<Active>>,
    status: RwLock<Option<EngineStatus>>,
    counters: Arc<EngineCounters>,
}

impl OutboundEngine {
    pub fn new(installer: Arc<dyn OverrideInstaller>) -> Self {
        Self {
            installer,
            active: Mutex::new(None),
            status: RwLock::new(None),
            counters: Arc::new(EngineCounters::default()),
        }
    }

    pub fn installer(&self) -> &Arc<dyn OverrideInstaller> {
        &self.installer
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    /// Current state without waiting on an activation in progress.
    pub fn status(&self) -> Option<EngineStatus> {
        match self.status.read() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status().is_some()
    }

    /// Start diverting traffic matched by `rules` through `transport`.
    pub async fn activate(
        &self,
        rules: RuleStore,
        transport: Transport,
        settings: EngineSettings,
    ) -> Result<SocketAddr, OutboundError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(OutboundError::AlreadyActive);
        }

        let listener = TcpListener::bind(&settings.proxy_addr)
            .await
            .map_err(|source| OutboundError::Bind {
                addr: settings.proxy_addr.clone(),
                source,
            })?;
        let listen_addr = listener.local_addr()?;

        let plan = InstallPlan {
            proxy_port: listen_addr.port(),
            divert_cidrs: rules.divert_cidrs(),
            pass_cidrs: rules.pass_cidrs(),
        };
        // Dropping the listener on failure releases the port.
        self.installer.install(&plan).await?;

        let divert_rules = rules.divert_count();
        let ctx = Arc::new(ConnContext {
            rules,
            transport,
            namespace: settings.namespace,
            dial_timeout: settings.dial_timeout,
            transparent: self.installer.transparent(),
            counters: self.counters.clone(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown_rx));

        *active = Some(Active {
            shutdown_tx,
            accept_task,
        });
        *self.status.write().unwrap_or_else(|p| p.into_inner()) = Some(EngineStatus {
            listen_addr,
            divert_rules,
        });
        info!(
            %listen_addr,
            installer = self.installer.name(),
            divert_rules,
            "outbound override active"
        );
        Ok(listen_addr)
    }

    /// Stop diverting. Safe to call when inactive.
    pub async fn deactivate(&self) -> Result<(), OutboundError> {
        let mut active = self.active.lock().await;
        let Some(state) = active.take() else {
            return Ok(());
        };
        *self.status.write().unwrap_or_else(|p| p.into_inner()) = None;

        let _ = state.shutdown_tx.send(true);
        let mut task = state.accept_task;
        if tokio::time::timeout(Duration::from_secs(2), &mut task).await.is_err() {
            warn!("proxy accept loop did not stop in time, aborting");
            task.abort();
        }
        self.installer.uninstall().await?;
        info!(
            diverted = self.counters.diverted(),
            passed = self.counters.passed(),
            failed = self.counters.failed(),
            "outbound override inactive"
        );
        Ok(())
    }
}

struct ConnContext {
    rules: RuleStore,
    transport: Transport,
    namespace: String,
    dial_timeout: Duration,
    transparent: bool,
    counters: Arc<EngineCounters>,
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ConnContext>, mut shutdown: watch::Receiver<bool>) {
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let ctx = ctx.clone();
                    conns.spawn(async move {
                        if let Err(e) = handle_connection(socket, &ctx).await {
                            debug!(%peer, error = %e, "proxy connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "proxy accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            // Reap finished connections so the set does not grow.
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }
    conns.shutdown().await;
    debug!("proxy accept loop stopped");
}

async fn handle_connection(mut socket: TcpStream, ctx: &ConnContext) -> std::io::Result<()> {
    let (dest, port) = if ctx.transparent {
        let dst = original_dst(&socket)?;
        (Destination::Ip(dst.ip()), dst.port())
    } else {
        let request = tokio::time::timeout(PREAMBLE_TIMEOUT, ConnectRequest::read_from(&mut socket))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no CONNECT preamble"))??;
        let dest = match &request.address {
            TargetAddress::Ip(ip) => Destination::Ip(*ip),
            TargetAddress::Domain(name) => Destination::parse(name),
        };
        (dest, request.port)
    };

    let decision = ctx.rules.evaluate(&dest);
    match decision.action {
        Action::Divert => divert(socket, ctx, &dest, port).await,
        Action::Pass => pass(socket, ctx, &dest, port).await,
    }
}

async fn divert(mut socket: TcpStream, ctx: &ConnContext, dest: &Destination, port: u16) -> std::io::Result<()> {
    let host = match dest {
        Destination::Host(name) if dest.is_short_name() => format!("{name}.{}", ctx.namespace),
        other => other.to_string(),
    };

    if !ctx.transport.is_open() {
        ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
        debug!(%host, port, "tunnel down, refusing divert");
        return reply(&mut socket, ctx, ConnectResponse::failure(ProxyStatus::TunnelUnavailable)).await;
    }

    let meta = StreamMeta::Outbound {
        host: host.clone(),
        port,
    };
    let stream = match ctx.transport.open_stream(meta).await {
        Ok(stream) => stream,
        Err(e) => {
            ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
            debug!(%host, port, error = %e, "divert failed");
            return reply(&mut socket, ctx, ConnectResponse::failure(ProxyStatus::from_tunnel_error(&e))).await;
        }
    };

    ctx.counters.diverted.fetch_add(1, Ordering::Relaxed);
    let bound_port = socket.local_addr().map(|a| a.port()).unwrap_or(0);
    reply(&mut socket, ctx, ConnectResponse::success(bound_port)).await?;
    debug!(%host, port, stream = stream.id(), "diverting through tunnel");
    let stats = relay(socket, stream).await;
    debug!(%host, port, up = stats.bytes_up, down = stats.bytes_down, "divert finished");
    Ok(())
}

async fn pass(mut socket: TcpStream, ctx: &ConnContext, dest: &Destination, port: u16) -> std::io::Result<()> {
    if ctx.transparent {
        // Redirected traffic that no longer matches; dialing it from here
        // would be redirected again.
        ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
        debug!(%dest, port, "dropping redirected connection with no divert rule");
        return Ok(());
    }

    let target = match dest {
        Destination::Ip(ip) => SocketAddr::new(*ip, port).to_string(),
        Destination::Host(name) => format!("{name}:{port}"),
    };
    let upstream = match tokio::time::timeout(ctx.dial_timeout, TcpStream::connect(&target)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
            let status = ProxyStatus::from_io_error(&e);
            debug!(%target, error = %e, "direct dial failed");
            return ConnectResponse::failure(status).write_to(&mut socket).await;
        }
        Err(_) => {
            ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
            return ConnectResponse::failure(ProxyStatus::ConnectionTimeout)
                .write_to(&mut socket)
                .await;
        }
    };

    ctx.counters.passed.fetch_add(1, Ordering::Relaxed);
    let bound_port = upstream.local_addr().map(|a| a.port()).unwrap_or(0);
    ConnectResponse::success(bound_port).write_to(&mut socket).await?;
    debug!(%target, "passing directly");
    let mut upstream = upstream;
    let _ = tokio::io::copy_bidirectional(&mut socket, &mut upstream).await;
    Ok(())
}

/// Answer the preamble; transparent clients never sent one.
async fn reply(socket: &mut TcpStream, ctx: &ConnContext, response: ConnectResponse) -> std::io::Result<()> {
    if ctx.transparent {
        return Ok(());
    }
    response.write_to(socket).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::MemoryInstaller;
    use kubetun_rules::RuleSource;
    use kubetun_tunnel::{Role, TransportConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn rules() -> RuleStore {
        RuleStore::from_source(&RuleSource {
            namespace: "default".into(),
            cluster_domain: "cluster.local".into(),
            service_subnets: vec!["10.96.0.0/12".into()],
            ..Default::default()
        })
        .unwrap()
    }

    /// Daemon-side transport plus an agent that echoes every outbound stream
    /// and reports the host it was asked to dial.
    fn tunnel_with_echo_agent() -> (Transport, Transport, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let daemon = Transport::start(a, "agent".into(), Role::Daemon, TransportConfig::default());
        let agent = Transport::start(b, "daemon".into(), Role::Agent, TransportConfig::default());
        let mut incoming = agent.take_incoming().unwrap();
        let (seen_tx, seen_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(inc) = incoming.recv().await {
                if let Some(StreamMeta::Outbound { host, .. }) = inc.meta() {
                    let _ = seen_tx.send(host.clone());
                }
                let stream = inc.accept().unwrap();
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    while let Ok(Some(chunk)) = r.read().await {
                        if w.write_all(&chunk).await.is_err() {
                            break;
                        }
                    }
                    w.finish();
                });
            }
        });
        (daemon, agent, seen_rx)
    }

    async fn connect_via(proxy: SocketAddr, req: ConnectRequest) -> (TcpStream, ConnectResponse) {
        let mut sock = TcpStream::connect(proxy).await.unwrap();
        req.write_to(&mut sock).await.unwrap();
        let resp = ConnectResponse::read_from(&mut sock).await.unwrap();
        (sock, resp)
    }

    #[tokio::test]
    async fn diverts_short_name_qualified_with_namespace() {
        let (daemon, _agent, mut seen) = tunnel_with_echo_agent();
        let installer = MemoryInstaller::new();
        let engine = OutboundEngine::new(Arc::new(installer.clone()));
        let proxy = engine
            .activate(rules(), daemon, EngineSettings::default())
            .await
            .unwrap();
        assert_eq!(installer.installed().unwrap().proxy_port, proxy.port());

        let (mut sock, resp) = connect_via(proxy, ConnectRequest::domain("echo-easy", 8080)).await;
        assert!(resp.status.is_success());
        assert_eq!(seen.recv().await.unwrap(), "echo-easy.default");

        sock.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 18];
        sock.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(engine.counters().diverted(), 1);
        assert_eq!(engine.status().unwrap().divert_rules, rules().divert_count());
    }

    #[tokio::test]
    async fn passes_unmatched_destination_directly() {
        let (daemon, _agent, mut seen) = tunnel_with_echo_agent();
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = upstream.accept().await.unwrap();
            s.write_all(b"direct").await.unwrap();
        });

        let engine = OutboundEngine::new(Arc::new(MemoryInstaller::new()));
        let proxy = engine
            .activate(rules(), daemon, EngineSettings::default())
            .await
            .unwrap();

        let (mut sock, resp) = connect_via(proxy, ConnectRequest::ip(upstream_addr.ip(), upstream_addr.port())).await;
        assert!(resp.status.is_success());
        let mut buf = [0u8; 6];
        sock.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"direct");
        assert_eq!(engine.counters().passed(), 1);
        assert_eq!(engine.counters().diverted(), 0);
        assert!(seen.try_recv().is_err(), "a Pass decision opens no stream");
    }

    #[tokio::test]
    async fn divert_with_tunnel_down_fails_fast() {
        let (daemon, _agent, _seen) = tunnel_with_echo_agent();
        let engine = OutboundEngine::new(Arc::new(MemoryInstaller::new()));
        let proxy = engine
            .activate(rules(), daemon.clone(), EngineSettings::default())
            .await
            .unwrap();
        daemon.close().await;

        let (_sock, resp) = tokio::time::timeout(
            Duration::from_secs(1),
            connect_via(proxy, ConnectRequest::domain("svc.default.svc.cluster.local", 80)),
        )
        .await
        .expect("reply without blocking");
        assert_eq!(resp.status, ProxyStatus::TunnelUnavailable);
        assert_eq!(engine.counters().failed(), 1);
    }

    #[tokio::test]
    async fn failed_install_leaves_nothing_behind() {
        let (daemon, _agent, _seen) = tunnel_with_echo_agent();
        let installer = MemoryInstaller::new();
        installer.fail_next_install();
        let engine = OutboundEngine::new(Arc::new(installer.clone()));

        let err = engine
            .activate(rules(), daemon.clone(), EngineSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OutboundError::Install { .. }));
        assert!(!engine.is_active());

        // A retry succeeds once the installer recovers.
        engine.activate(rules(), daemon, EngineSettings::default()).await.unwrap();
        assert!(engine.is_active());
    }

    #[tokio::test]
    async fn deactivate_is_idempotent_and_closes_listener() {
        let (daemon, _agent, _seen) = tunnel_with_echo_agent();
        let installer = MemoryInstaller::new();
        let engine = OutboundEngine::new(Arc::new(installer.clone()));
        engine.deactivate().await.unwrap();

        let proxy = engine
            .activate(rules(), daemon.clone(), EngineSettings::default())
            .await
            .unwrap();
        assert!(matches!(
            engine.activate(rules(), daemon, EngineSettings::default()).await,
            Err(OutboundError::AlreadyActive)
        ));

        engine.deactivate().await.unwrap();
        engine.deactivate().await.unwrap();
        assert!(installer.installed().is_none());
        assert!(!engine.is_active());
        assert!(TcpStream::connect(proxy).await.is_err());
    }
}
