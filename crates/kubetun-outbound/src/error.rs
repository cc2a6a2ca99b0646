use kubetun_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("failed to bind proxy listener on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("installer {installer} failed: {message}")]
    Install { installer: String, message: String },

    #[error("unknown installer {0:?} (expected none, memory, or iptables)")]
    UnknownInstaller(String),

    #[error("outbound engine is already active")]
    AlreadyActive,

    #[error("tunnel unavailable: {0}")]
    TunnelUnavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl OutboundError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OutboundError::UnknownInstaller(_) => ErrorKind::ConfigError,
            OutboundError::TunnelUnavailable(_) => ErrorKind::TunnelUnavailable,
            _ => ErrorKind::Internal,
        }
    }
}
