use kubetun_core::ErrorKind;
use kubetun_core::SessionInfo;
use kubetun_core::protocol::AgentErrorKind;
use kubetun_intercept::InterceptError;
use kubetun_outbound::OutboundError;
use kubetun_rules::RuleError;
use kubetun_tunnel::TunnelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// A session exists. `identical` is set when the request named the same
    /// context and namespace, which callers treat as success.
    #[error("{message}")]
    AlreadyConnected {
        identical: bool,
        session: SessionInfo,
        message: String,
    },

    #[error("{0}")]
    Config(String),

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("agent refused the request: {message}")]
    Agent { kind: AgentErrorKind, message: String },

    #[error("invalid override rules: {0}")]
    Rules(#[from] RuleError),

    #[error(transparent)]
    Outbound(#[from] OutboundError),

    #[error(transparent)]
    Intercept(#[from] InterceptError),

    #[error("session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::AlreadyConnected { .. } => ErrorKind::AlreadyConnected,
            SessionError::Config(_) => ErrorKind::ConfigError,
            SessionError::NotConnected => ErrorKind::NotConnected,
            SessionError::Tunnel(e) => e.kind(),
            SessionError::Agent { kind, .. } => match kind {
                AgentErrorKind::BadRequest => ErrorKind::ConfigError,
                AgentErrorKind::DeploymentNotFound => ErrorKind::DeploymentNotFound,
                AgentErrorKind::Conflict => ErrorKind::InterceptConflict,
                AgentErrorKind::Rejected => ErrorKind::Rejected,
            },
            SessionError::Rules(_) => ErrorKind::ConfigError,
            SessionError::Outbound(e) => e.kind(),
            SessionError::Intercept(e) => e.kind(),
            SessionError::Task(_) => ErrorKind::Internal,
        }
    }
}
