//! kubetund — the kubetun daemon.
//!
//! Owns the process's single [`SessionManager`](kubetun_session::SessionManager)
//! and exposes it on a Unix socket:
//! - **`server`** — socket lifecycle, client connections, quit
//! - **`handlers`** — one handler per IPC request
//! - **`resolver`** — kubeconfig-backed context resolution

pub mod handlers;
pub mod resolver;
pub mod server;

pub use handlers::Handlers;
pub use resolver::KubeconfigResolver;
pub use server::Daemon;

use std::path::PathBuf;

use kubetun_core::DaemonConfig;

/// Run a daemon until it is told to quit.
pub async fn run(config: DaemonConfig, socket_path: PathBuf) -> anyhow::Result<()> {
    let daemon = Daemon::start(&config, socket_path).await?;
    daemon.serve().await?;
    println!("Daemon quitting");
    Ok(())
}
