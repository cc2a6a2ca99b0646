//! Daemon control socket protocol.
//!
//! One JSON-encoded [`DaemonRequest`] per line in, one JSON-encoded
//! [`DaemonResponse`] per line out, over a Unix domain socket at a single
//! well-known path.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Cap on a single response line.
const MAX_RESPONSE_BYTES: u64 = 4 * 1024 * 1024;

/// A request sent to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonRequest {
    /// Open a session. `None` fields fall back to the kubeconfig defaults.
    Connect {
        #[serde(default)]
        context: Option<String>,
        #[serde(default)]
        namespace: Option<String>,
    },
    Disconnect,
    Status,
    AddIntercept {
        workload: String,
        remote_port: u16,
        local_port: u16,
    },
    /// Remove one intercept, or every intercept of the workload when
    /// `remote_port` is `None`.
    RemoveIntercept {
        workload: String,
        #[serde(default)]
        remote_port: Option<u16>,
    },
    Version,
    /// Tear everything down and exit.
    Quit,
}

/// Response to a daemon request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    /// Human-readable message.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl DaemonResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            error_kind: None,
            data: None,
        }
    }

    pub fn ok_with_data(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            ok: true,
            message: message.into(),
            error_kind: None,
            data: Some(data),
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            error_kind: Some(kind),
            data: None,
        }
    }
}

/// Well-known socket path: `$KUBETUN_SOCKET`, else
/// `$XDG_RUNTIME_DIR/kubetun/daemon.sock`, else `/tmp/kubetun-<uid>/daemon.sock`.
pub fn socket_path() -> PathBuf {
    if let Ok(p) = std::env::var("KUBETUN_SOCKET") {
        return PathBuf::from(p);
    }
    runtime_dir().join("daemon.sock")
}

/// Per-user runtime directory holding the socket and daemon state.
pub fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("kubetun");
    }
    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/kubetun-{uid}"))
}

/// Blocking client for the daemon socket.
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Option<Duration>,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Some(Duration::from_secs(60)),
        }
    }

    /// Override the per-request read/write timeout. `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a request and wait for its response.
    pub fn send(&self, request: &DaemonRequest) -> std::io::Result<DaemonResponse> {
        let stream = UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(self.timeout)?;
        stream.set_write_timeout(self.timeout)?;

        let mut writer = stream.try_clone()?;
        let mut line = serde_json::to_string(request).map_err(std::io::Error::other)?;
        line.push('\n');
        writer.write_all(line.as_bytes())?;
        writer.flush()?;

        let mut reader = BufReader::new(stream.take(MAX_RESPONSE_BYTES));
        let mut buf = String::new();
        let n = reader.read_line(&mut buf)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "daemon closed the connection without responding",
            ));
        }
        serde_json::from_str(&buf).map_err(std::io::Error::other)
    }

    /// Whether a daemon answers on the socket.
    pub fn is_running(&self) -> bool {
        self.send(&DaemonRequest::Version).is_ok()
    }
}
