//! kubetun-agent — runs inside the cluster and terminates daemon tunnels.
//!
//! # Usage
//!
//! ```text
//! kubetun-agent --listen 0.0.0.0:8022 --workload echo-easy:8080=10.244.1.5:8080
//! kubetun-agent --config /etc/kubetun/agent.toml
//! ```

use std::path::PathBuf;

use clap::Parser;
use kubetun_agent::{AgentConfig, RunningAgent, WorkloadSpec};
use tracing::info;

#[derive(Parser)]
#[command(name = "kubetun-agent", version, about = "kubetun in-cluster agent")]
struct Cli {
    /// Agent configuration file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tunnel listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Namespace that exists in the cluster. Repeatable.
    #[arg(long = "namespace")]
    namespaces: Vec<String>,

    /// Workload to front, as `name:port=target`. Repeatable.
    #[arg(long = "workload")]
    workloads: Vec<String>,

    /// Resolution override for outbound dials, as `host=ip:port`. Repeatable.
    #[arg(long = "resolve")]
    resolve: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,kubetun_agent=debug")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    config.namespaces.extend(cli.namespaces);
    for w in &cli.workloads {
        config.workloads.push(WorkloadSpec::parse(w)?);
    }
    for r in &cli.resolve {
        let (host, addr) = r
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid --resolve {r:?}, expected host=ip:port"))?;
        config.resolve.insert(host.to_string(), addr.to_string());
    }

    let agent = RunningAgent::start(config).await?;
    info!(addr = %agent.tunnel_addr(), "kubetun agent running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    agent.shutdown().await;
    Ok(())
}
