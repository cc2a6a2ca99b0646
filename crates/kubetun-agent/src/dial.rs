//! Outbound dialing on behalf of the daemon.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

/// Resolve `host:port`, preferring the configured overrides.
pub(crate) async fn resolve(
    overrides: &HashMap<String, String>,
    host: &str,
    port: u16,
) -> Result<Vec<SocketAddr>, String> {
    let with_port = format!("{host}:{port}");
    if let Some(addr) = overrides.get(&with_port).or_else(|| overrides.get(host)) {
        return addr
            .parse::<SocketAddr>()
            .map(|a| vec![a])
            .map_err(|_| format!("cannot resolve {host}: bad override {addr:?}"));
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| format!("cannot resolve {host}: {e}"))?
        .collect();
    if addrs.is_empty() {
        return Err(format!("cannot resolve {host}: no addresses"));
    }
    Ok(addrs)
}

/// Dial the first reachable address. Error strings name the failure class
/// so the daemon can map them onto proxy statuses.
pub(crate) async fn dial(
    overrides: &HashMap<String, String>,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, String> {
    let addrs = resolve(overrides, host, port).await?;
    let mut last = String::new();
    for addr in addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => return Ok(s),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                last = format!("connection refused by {addr}");
            }
            Ok(Err(e)) => last = format!("{addr}: {e}"),
            Err(_) => last = format!("{addr}: connect timed out"),
        }
    }
    Err(last)
}
