use std::path::Path;
use std::process::Command;

use kubetun_core::VERSION;
use kubetun_core::ipc::{DaemonClient, DaemonRequest};

use super::{connect_session, report, send_existing};
use crate::launch::ensure_daemon;

/// `kubetun connect [-- command]`. With a command, the session only lasts
/// as long as the command, and a daemon started here is stopped afterwards.
pub fn connect(
    client: &DaemonClient,
    config: Option<&Path>,
    context: Option<String>,
    namespace: Option<String>,
    command: &[String],
) -> anyhow::Result<i32> {
    let launched = ensure_daemon(client, config)?;
    if let Err(code) = connect_session(client, launched, context, namespace)? {
        return Ok(code);
    }
    let Some((program, args)) = command.split_first() else {
        return Ok(0);
    };

    let code = match Command::new(program).args(args).status() {
        Ok(status) => status.code().unwrap_or(1),
        Err(e) => {
            eprintln!("failed to run {program}: {e}");
            127
        }
    };
    let teardown = if launched {
        DaemonRequest::Quit
    } else {
        DaemonRequest::Disconnect
    };
    report(&client.send(&teardown)?);
    Ok(code)
}

pub fn status(client: &DaemonClient) -> anyhow::Result<i32> {
    Ok(send_existing(client, &DaemonRequest::Status)?.map_or(0, |r| report(&r)))
}

pub fn disconnect(client: &DaemonClient) -> anyhow::Result<i32> {
    Ok(send_existing(client, &DaemonRequest::Disconnect)?.map_or(0, |r| report(&r)))
}

pub fn quit(client: &DaemonClient) -> anyhow::Result<i32> {
    Ok(send_existing(client, &DaemonRequest::Quit)?.map_or(0, |r| report(&r)))
}

/// Client version always; daemon version when one is running.
pub fn version(client: &DaemonClient) -> anyhow::Result<i32> {
    println!("Client v{VERSION}");
    if client.is_running() {
        return Ok(report(&client.send(&DaemonRequest::Version)?));
    }
    Ok(0)
}
