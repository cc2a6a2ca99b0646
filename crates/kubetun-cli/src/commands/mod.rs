pub mod intercept;
pub mod session;

use kubetun_core::ErrorKind;
use kubetun_core::ipc::{DaemonClient, DaemonRequest, DaemonResponse};
use kubetun_core::status::DAEMON_NOT_STARTED;

/// Send `request`, or report that no daemon is running.
pub(crate) fn send_existing(client: &DaemonClient, request: &DaemonRequest) -> anyhow::Result<Option<DaemonResponse>> {
    if !client.is_running() {
        println!("{DAEMON_NOT_STARTED}");
        return Ok(None);
    }
    Ok(Some(client.send(request)?))
}

/// Print a response; returns the process exit code.
pub(crate) fn report(response: &DaemonResponse) -> i32 {
    if response.ok {
        print_message(&response.message);
        0
    } else {
        eprintln!("{}", response.message);
        1
    }
}

fn print_message(message: &str) {
    let message = message.trim_end();
    if !message.is_empty() {
        println!("{message}");
    }
}

/// Connect on behalf of a command that needs a session. When `launched`,
/// a configuration error also stops the daemon that was just started.
pub(crate) fn connect_session(
    client: &DaemonClient,
    launched: bool,
    context: Option<String>,
    namespace: Option<String>,
) -> anyhow::Result<Result<(), i32>> {
    let response = client.send(&DaemonRequest::Connect { context, namespace })?;
    let code = report(&response);
    if code == 0 {
        return Ok(Ok(()));
    }
    if launched && response.error_kind == Some(ErrorKind::ConfigError) {
        report(&client.send(&DaemonRequest::Quit)?);
    }
    Ok(Err(code))
}
