//! The control socket server.
//!
//! One task per client connection, each reading newline-delimited JSON
//! requests and answering them in order. Requests from different clients
//! run concurrently; the session manager serializes the ones that mutate.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use kubetun_core::DaemonConfig;
use kubetun_core::ErrorKind;
use kubetun_core::ipc::{DaemonRequest, DaemonResponse};
use kubetun_outbound::installer_for;
use kubetun_session::{SessionManager, SessionSettings};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

use crate::handlers::Handlers;
use crate::resolver::KubeconfigResolver;

/// Longest request line accepted from a client.
const MAX_REQUEST_LINE: usize = 64 * 1024;

pub struct Daemon {
    handlers: Arc<Handlers>,
    listener: UnixListener,
    socket_path: PathBuf,
}

impl Daemon {
    /// Build the session manager from `config`, clear stale overrides, and
    /// bind the control socket.
    pub async fn start(config: &DaemonConfig, socket_path: PathBuf) -> anyhow::Result<Self> {
        let resolver = KubeconfigResolver::from_config(config);
        Self::start_with_resolver(config, Arc::new(resolver), socket_path).await
    }

    pub async fn start_with_resolver(
        config: &DaemonConfig,
        resolver: Arc<dyn kubetun_session::ContextResolver>,
        socket_path: PathBuf,
    ) -> anyhow::Result<Self> {
        let settings = SessionSettings::from_config(config).map_err(|e| anyhow::anyhow!("invalid config: {e}"))?;
        let installer = installer_for(&config.outbound.installer)?;
        let session = SessionManager::new(resolver, installer, settings);

        match session.recover_stale_state().await {
            Ok(true) => info!("removed outbound overrides left by a previous daemon"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "could not check for stale outbound overrides"),
        }

        let listener = bind_socket(&socket_path)?;
        info!(socket = %socket_path.display(), version = kubetun_core::VERSION, "kubetun daemon listening");
        Ok(Self {
            handlers: Arc::new(Handlers::new(session)),
            listener,
            socket_path,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        self.handlers.session()
    }

    /// Serve until a client sends `quit` or the process is interrupted.
    /// The session is torn down and the socket removed before returning.
    pub async fn serve(self) -> anyhow::Result<()> {
        let (quit_tx, mut quit_rx) = watch::channel(false);
        let mut clients = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        clients.spawn(serve_client(stream, self.handlers.clone(), quit_tx.clone()));
                    }
                    Err(e) => warn!(error = %e, "control socket accept failed"),
                },
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
                _ = quit_rx.changed() => break,
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, shutting down");
                    break;
                }
            }
        }

        clients.shutdown().await;
        // A connect queued behind `quit` still completes on its own task;
        // this waits for it and takes it down again.
        if let Some(info) = self.handlers.session().disconnect().await {
            info!(session_id = %info.session_id, "session closed on shutdown");
        }
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(error = %e, "socket already removed");
        }
        Ok(())
    }
}

async fn serve_client(stream: UnixStream, handlers: Arc<Handlers>, quit_tx: watch::Sender<bool>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_REQUEST_LINE));

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!(error = %e, "control client read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let (response, quit) = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => {
                let quit = request == DaemonRequest::Quit;
                (handlers.dispatch(request).await, quit)
            }
            Err(e) => (
                DaemonResponse::error(ErrorKind::Internal, format!("invalid request: {e}")),
                false,
            ),
        };

        let mut out = match serde_json::to_string(&response) {
            Ok(out) => out,
            Err(e) => {
                warn!(error = %e, "could not encode response");
                return;
            }
        };
        out.push('\n');
        let written = write_half.write_all(out.as_bytes()).await;
        if quit {
            let _ = write_half.shutdown().await;
            let _ = quit_tx.send(true);
            return;
        }
        if let Err(e) = written {
            debug!(error = %e, "control client went away");
            return;
        }
    }
}

/// Bind the control socket, replacing a socket file nobody answers on.
fn bind_socket(path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    if path.exists() {
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            anyhow::bail!("another kubetun daemon is already listening on {}", path.display());
        }
        debug!(socket = %path.display(), "removing stale socket");
        std::fs::remove_file(path)?;
    }
    Ok(UnixListener::bind(path)?)
}
