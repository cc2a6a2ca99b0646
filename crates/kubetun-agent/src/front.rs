//! Workload fronts.
//!
//! Each front listens in place of one workload port. Connections go to the
//! real workload unless the port is intercepted, in which case they are
//! carried through the owning tunnel to the developer's machine.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kubetun_core::protocol::StreamMeta;
use kubetun_core::InterceptKey;
use kubetun_tunnel::relay;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::WorkloadSpec;
use crate::error::AgentError;
use crate::registry::Registry;

const WORKLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) async fn bind(spec: &WorkloadSpec) -> Result<TcpListener, AgentError> {
    TcpListener::bind(&spec.front).await.map_err(|source| AgentError::Bind {
        addr: spec.front.clone(),
        source,
    })
}

pub(crate) async fn serve(
    listener: TcpListener,
    spec: WorkloadSpec,
    registry: Arc<Registry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    conns.spawn(handle(socket, peer, spec.clone(), registry.clone()));
                }
                Err(e) => warn!(workload = %spec.name, error = %e, "front accept failed"),
            },
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }
    conns.shutdown().await;
}

async fn handle(mut socket: TcpStream, peer: SocketAddr, spec: WorkloadSpec, registry: Arc<Registry>) {
    let key = InterceptKey::new(spec.name.clone(), spec.port);
    if let Some(transport) = registry.route(&key) {
        let meta = StreamMeta::Intercept {
            workload: spec.name.clone(),
            port: spec.port,
            peer: Some(peer.to_string()),
        };
        match transport.open_stream(meta).await {
            Ok(stream) => {
                debug!(intercept = %key, %peer, stream = stream.id(), "routing to intercept");
                relay(socket, stream).await;
                return;
            }
            Err(e) => {
                // The developer side is not taking connections; serve from the workload.
                debug!(intercept = %key, error = %e, "intercept unavailable, falling back to workload");
            }
        }
    }

    let upstream = match tokio::time::timeout(WORKLOAD_CONNECT_TIMEOUT, TcpStream::connect(&spec.target)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            warn!(workload = %spec.name, target = %spec.target, error = %e, "workload unreachable");
            return;
        }
        Err(_) => {
            warn!(workload = %spec.name, target = %spec.target, "workload connect timed out");
            return;
        }
    };
    let mut upstream = upstream;
    let _ = tokio::io::copy_bidirectional(&mut socket, &mut upstream).await;
}
