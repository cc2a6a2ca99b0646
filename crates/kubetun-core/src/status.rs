//! Text rendering of a [`StatusReport`] for the CLI.

use std::fmt::Write;

use crate::types::{InterceptState, SessionStatus, StatusReport};

/// Shown when no daemon answers on the socket.
pub const DAEMON_NOT_STARTED: &str = "The kubetun daemon has not been started";

/// Render a status report the way `kubetun status` prints it.
pub fn render(report: &StatusReport) -> String {
    let mut out = String::new();

    let session = match (&report.status, &report.session) {
        (SessionStatus::Connected, Some(s)) => s,
        (SessionStatus::Disconnected, _) => return "Not connected\n".to_string(),
        (status, _) => return format!("Session is {status}\n"),
    };

    let _ = writeln!(out, "Connected");
    let _ = writeln!(out, "  Context:    {} ({})", session.context, session.agent_addr);
    let _ = writeln!(out, "  Namespace:  {}", session.namespace);
    let _ = writeln!(out, "  Session:    {}", session.session_id);
    let proxy = if report.outbound_active { "ON" } else { "OFF" };
    let _ = write!(out, "  Proxy:      {proxy} ({} divert rules", report.divert_rules);
    if let (true, Some(addr)) = (report.outbound_active, &report.proxy_addr) {
        let _ = write!(out, ", listening on {addr}");
    }
    let _ = writeln!(out, ")");

    let active: Vec<_> = report
        .intercepts
        .iter()
        .filter(|i| i.state == InterceptState::Active)
        .collect();
    let _ = writeln!(out, "  Intercepts: {} total", active.len());
    for i in active {
        let _ = writeln!(
            out,
            "    {}:{} -> {}:{}",
            i.workload, i.remote_port, i.local_addr, i.local_port
        );
    }
    out
}
