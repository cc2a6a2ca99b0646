//! Error types for the tunnel transport.

use kubetun_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to connect to agent at {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("tunnel unavailable: {0}")]
    Unavailable(String),

    #[error("stream refused by peer: {0}")]
    Refused(String),

    #[error("stream reset: {0}")]
    StreamReset(String),

    #[error("stream already finished")]
    StreamFinished,

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::Connect { .. } => ErrorKind::ConnectError,
            TunnelError::Unavailable(_) => ErrorKind::TunnelUnavailable,
            TunnelError::Timeout(_) => ErrorKind::Timeout,
            TunnelError::Refused(_) => ErrorKind::Rejected,
            _ => ErrorKind::Internal,
        }
    }
}
