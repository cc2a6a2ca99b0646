//! kubetund — runs the kubetun daemon in the foreground.
//!
//! # Usage
//!
//! ```text
//! kubetund --config ~/.config/kubetun/config.toml --log-file /tmp/kubetund.log
//! ```

use std::path::PathBuf;

use clap::Parser;
use kubetun_core::DaemonConfig;

#[derive(Parser)]
#[command(name = "kubetund", version, about = "kubetun daemon")]
struct Cli {
    /// Daemon configuration file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control socket path. Defaults to the per-user runtime directory.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Write logs here instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    let config = DaemonConfig::load(cli.config.as_deref())?;
    let socket = cli.socket.unwrap_or_else(kubetun_core::ipc::socket_path);
    kubetund::run(config, socket).await
}

fn init_tracing(log_file: Option<&std::path::Path>) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,kubetund=debug,kubetun=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(std::sync::Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}
