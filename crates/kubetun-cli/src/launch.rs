//! Starting the daemon on demand.
//!
//! The CLI starts the daemon by re-running its own executable with the
//! hidden `daemon` subcommand, detached, with output going to a log file
//! in the runtime directory.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use kubetun_core::DaemonConfig;
use kubetun_core::ipc::{DaemonClient, runtime_dir};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Start the daemon unless one already answers. Returns whether this call
/// started it.
pub fn ensure_daemon(client: &DaemonClient, config: Option<&Path>) -> anyhow::Result<bool> {
    if client.is_running() {
        return Ok(false);
    }
    println!("Launching Kubetun Daemon");

    let log_path = daemon_log_path(client.socket_path());
    if let Some(dir) = log_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let log = std::fs::OpenOptions::new().create(true).append(true).open(&log_path)?;

    let mut cmd = Command::new(std::env::current_exe()?);
    cmd.arg("daemon").arg("--socket").arg(client.socket_path());
    if let Some(config) = config {
        cmd.arg("--config").arg(config);
    }
    cmd.stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log);
    let mut child = cmd.spawn()?;

    let deadline = Instant::now() + STARTUP_TIMEOUT;
    while Instant::now() < deadline {
        if client.is_running() {
            return Ok(true);
        }
        if let Some(status) = child.try_wait()? {
            anyhow::bail!("daemon exited during startup ({status}); see {}", log_path.display());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    anyhow::bail!("daemon did not start within {STARTUP_TIMEOUT:?}; see {}", log_path.display())
}

/// Log next to the socket when the socket has a directory of its own.
fn daemon_log_path(socket: &Path) -> PathBuf {
    socket
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(runtime_dir)
        .join("daemon.log")
}

/// The hidden `daemon` subcommand.
pub fn run_daemon(config: Option<&Path>, socket: PathBuf, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,kubetund=debug,kubetun=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(std::sync::Mutex::new(file)).init();
        }
        None => builder.with_ansi(false).with_writer(std::io::stderr).init(),
    }

    let config = DaemonConfig::load(config)?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(kubetund::run(config, socket))
}
