use std::path::Path;

use kubetun_core::SessionStatus;
use kubetun_core::StatusReport;
use kubetun_core::ipc::{DaemonClient, DaemonRequest};

use super::{connect_session, report, send_existing};
use crate::launch::ensure_daemon;

/// Parse `--port`: `remote:local`, or one port for both.
pub fn parse_port_mapping(s: &str) -> Result<(u16, u16), String> {
    let parse = |p: &str| {
        p.parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| format!("invalid port {p:?}"))
    };
    match s.split_once(':') {
        Some((remote, local)) => Ok((parse(remote)?, parse(local)?)),
        None => {
            let port = parse(s)?;
            Ok((port, port))
        }
    }
}

pub fn intercept(
    client: &DaemonClient,
    config: Option<&Path>,
    context: Option<String>,
    namespace: Option<String>,
    workload: &str,
    remote_port: u16,
    local_port: u16,
) -> anyhow::Result<i32> {
    let launched = ensure_daemon(client, config)?;
    if !is_connected(client)? {
        if let Err(code) = connect_session(client, launched, context, namespace)? {
            return Ok(code);
        }
    }
    let response = client.send(&DaemonRequest::AddIntercept {
        workload: workload.to_string(),
        remote_port,
        local_port,
    })?;
    Ok(report(&response))
}

pub fn remove(client: &DaemonClient, workload: &str, remote_port: Option<u16>) -> anyhow::Result<i32> {
    let request = DaemonRequest::RemoveIntercept {
        workload: workload.to_string(),
        remote_port,
    };
    Ok(send_existing(client, &request)?.map_or(0, |r| report(&r)))
}

fn is_connected(client: &DaemonClient) -> anyhow::Result<bool> {
    let response = client.send(&DaemonRequest::Status)?;
    let report: Option<StatusReport> = response.data.and_then(|d| serde_json::from_value(d).ok());
    Ok(report.is_some_and(|r| r.status == SessionStatus::Connected))
}
