use kubetun_core::ErrorKind;
use kubetun_tunnel::TunnelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("an intercept for {0} already exists")]
    Conflict(String),

    #[error("workload not found: {0}")]
    DeploymentNotFound(String),

    #[error("agent did not confirm intercept {0} in time")]
    Timeout(String),

    #[error("agent rejected intercept: {0}")]
    Rejected(String),

    #[error("inbound dispatcher already running for this tunnel")]
    DispatcherTaken,

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

impl InterceptError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InterceptError::Conflict(_) => ErrorKind::InterceptConflict,
            InterceptError::DeploymentNotFound(_) => ErrorKind::DeploymentNotFound,
            InterceptError::Timeout(_) => ErrorKind::Timeout,
            InterceptError::Rejected(_) => ErrorKind::Rejected,
            InterceptError::DispatcherTaken => ErrorKind::Internal,
            InterceptError::Tunnel(e) => e.kind(),
        }
    }
}
