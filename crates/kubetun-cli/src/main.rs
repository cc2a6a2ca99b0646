use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kubetun_core::ipc::DaemonClient;

mod commands;
mod launch;

#[derive(Parser)]
#[command(
    name = "kubetun",
    about = "kubetun — route laptop traffic into a Kubernetes cluster and back",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Daemon configuration file, used when the daemon has to be started.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Control socket of the daemon (default: `$KUBETUN_SOCKET`, then the
    /// per-user runtime directory).
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a cluster, optionally run a command, then disconnect.
    Connect {
        /// Kubeconfig context (default: the current context)
        #[arg(long)]
        context: Option<String>,
        /// Namespace (default: the context's namespace)
        #[arg(short, long)]
        namespace: Option<String>,
        /// Command to run while connected.
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Show the session, outbound override, and intercepts.
    Status,
    /// Redirect a workload's inbound traffic to a local port.
    ///
    /// Connects first when there is no session.
    Intercept {
        workload: String,
        /// `remote:local`, or a single port used for both.
        #[arg(short, long, value_parser = commands::intercept::parse_port_mapping)]
        port: (u16, u16),
        #[arg(long)]
        context: Option<String>,
        #[arg(short, long)]
        namespace: Option<String>,
    },
    /// Stop intercepting a workload.
    Remove {
        workload: String,
        /// Remote port; all of the workload's intercepts when omitted.
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Close the session.
    Disconnect,
    /// Close the session and stop the daemon.
    Quit,
    /// Show client and daemon versions.
    Version,
    /// Run the daemon in the foreground.
    #[command(hide = true)]
    Daemon {
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let socket = cli.socket.clone().unwrap_or_else(kubetun_core::ipc::socket_path);

    if let Commands::Daemon { log_file } = &cli.command {
        return launch::run_daemon(cli.config.as_deref(), socket, log_file.as_deref());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let client = DaemonClient::new(socket);
    let config = cli.config.as_deref();

    let code = match cli.command {
        Commands::Connect {
            context,
            namespace,
            command,
        } => commands::session::connect(&client, config, context, namespace, &command)?,
        Commands::Status => commands::session::status(&client)?,
        Commands::Intercept {
            workload,
            port: (remote, local),
            context,
            namespace,
        } => commands::intercept::intercept(&client, config, context, namespace, &workload, remote, local)?,
        Commands::Remove { workload, port } => commands::intercept::remove(&client, &workload, port)?,
        Commands::Disconnect => commands::session::disconnect(&client)?,
        Commands::Quit => commands::session::quit(&client)?,
        Commands::Version => commands::session::version(&client)?,
        Commands::Daemon { .. } => 0,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
