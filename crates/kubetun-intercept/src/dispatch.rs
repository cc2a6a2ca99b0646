//! Inbound stream dispatch.
//!
//! Consumes agent-initiated streams. A stream for an Active intercept is
//! accepted only once its local target answers, then relayed; anything
//! else is refused at once so the agent can fall back instead of queueing.

use std::sync::Weak;
use std::time::Duration;

use kubetun_core::protocol::StreamMeta;
use kubetun_core::InterceptKey;
use kubetun_tunnel::{relay, IncomingStream};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::manager::InterceptManager;

pub(crate) struct Dispatcher {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Dispatcher {
    pub(crate) fn spawn(manager: Weak<InterceptManager>, incoming: mpsc::Receiver<IncomingStream>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(manager, incoming, shutdown_rx));
        Self { shutdown_tx, task }
    }

    pub(crate) async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let mut task = self.task;
        if tokio::time::timeout(Duration::from_secs(2), &mut task).await.is_err() {
            task.abort();
        }
    }
}

async fn run(
    manager: Weak<InterceptManager>,
    mut incoming: mpsc::Receiver<IncomingStream>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut relays = JoinSet::new();
    loop {
        tokio::select! {
            next = incoming.recv() => {
                let Some(inc) = next else { break };
                let Some(mgr) = manager.upgrade() else {
                    inc.refuse("session closed");
                    break;
                };
                let (target, timeout) = match inc.meta().cloned() {
                    Some(StreamMeta::Intercept { workload, port, peer }) => {
                        let key = InterceptKey::new(workload, port);
                        match mgr.active_target(&key) {
                            Some(target) => {
                                debug!(intercept = %key, peer = ?peer, %target, stream = inc.id(), "inbound connection");
                                (target, mgr.settings().local_connect_timeout)
                            }
                            None => {
                                debug!(intercept = %key, "no active intercept, refusing stream");
                                inc.refuse("not intercepted");
                                continue;
                            }
                        }
                    }
                    other => {
                        warn!(meta = ?other, "unexpected inbound stream");
                        inc.refuse("daemon only accepts intercept streams");
                        continue;
                    }
                };
                relays.spawn(deliver(inc, target, timeout));
            }
            Some(_) = relays.join_next(), if !relays.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }
    relays.shutdown().await;
    debug!("inbound dispatcher stopped");
}

async fn deliver(inc: IncomingStream, target: String, timeout: Duration) {
    let socket = match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!(%target, error = %e, "local target refused connection");
            inc.refuse("local target unreachable");
            return;
        }
        Err(_) => {
            inc.refuse("local target timed out");
            return;
        }
    };
    let stream = match inc.accept() {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, "could not accept inbound stream");
            return;
        }
    };
    let id = stream.id();
    let stats = relay(socket, stream).await;
    debug!(stream = id, up = stats.bytes_up, down = stats.bytes_down, "inbound connection finished");
}
