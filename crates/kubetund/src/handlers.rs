//! One handler per [`DaemonRequest`] variant.

use std::sync::Arc;

use kubetun_core::ipc::{DaemonRequest, DaemonResponse};
use kubetun_core::{VERSION, status};
use kubetun_session::{SessionError, SessionManager};
use serde_json::json;
use tracing::{debug, info};

pub struct Handlers {
    session: Arc<SessionManager>,
}

impl Handlers {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub async fn dispatch(&self, request: DaemonRequest) -> DaemonResponse {
        debug!(?request, "handling request");
        match request {
            DaemonRequest::Connect { context, namespace } => self.connect(context.as_deref(), namespace.as_deref()).await,
            DaemonRequest::Disconnect => self.disconnect().await,
            DaemonRequest::Status => self.status(),
            DaemonRequest::AddIntercept {
                workload,
                remote_port,
                local_port,
            } => self.add_intercept(&workload, remote_port, local_port).await,
            DaemonRequest::RemoveIntercept { workload, remote_port } => {
                self.remove_intercept(&workload, remote_port).await
            }
            DaemonRequest::Version => {
                DaemonResponse::ok_with_data(format!("Daemon v{VERSION}"), json!({ "version": VERSION }))
            }
            DaemonRequest::Quit => self.quit().await,
        }
    }

    async fn connect(&self, context: Option<&str>, namespace: Option<&str>) -> DaemonResponse {
        match self.session.connect(context, namespace).await {
            Ok(info) => DaemonResponse::ok_with_data(
                format!(
                    "Connected to context {} ({}), namespace {}",
                    info.context, info.agent_addr, info.namespace
                ),
                to_json(&info),
            ),
            Err(SessionError::AlreadyConnected {
                identical: true,
                session,
                message,
            }) => DaemonResponse::ok_with_data(message, to_json(&session)),
            Err(e) => error_response(e),
        }
    }

    async fn disconnect(&self) -> DaemonResponse {
        match self.session.disconnect().await {
            Some(info) => DaemonResponse::ok(format!("Disconnected from context {}", info.context)),
            None => DaemonResponse::ok("Not connected"),
        }
    }

    fn status(&self) -> DaemonResponse {
        let report = self.session.status();
        DaemonResponse::ok_with_data(status::render(&report), to_json(&report))
    }

    async fn add_intercept(&self, workload: &str, remote_port: u16, local_port: u16) -> DaemonResponse {
        match self.session.add_intercept(workload, remote_port, local_port).await {
            Ok(info) => DaemonResponse::ok_with_data(
                format!(
                    "Using deployment {workload}\n   Intercepting {workload}:{remote_port} -> {}:{local_port}",
                    info.local_addr
                ),
                to_json(&info),
            ),
            Err(e) => error_response(e),
        }
    }

    async fn remove_intercept(&self, workload: &str, remote_port: Option<u16>) -> DaemonResponse {
        match self.session.remove_intercept(workload, remote_port).await {
            // Silent on success, including when there was nothing to remove.
            Ok(removed) => DaemonResponse::ok_with_data("", to_json(&removed)),
            Err(e) => error_response(e),
        }
    }

    async fn quit(&self) -> DaemonResponse {
        self.session.disconnect().await;
        info!("daemon quitting");
        DaemonResponse::ok("Daemon quitting")
    }
}

fn error_response(err: SessionError) -> DaemonResponse {
    DaemonResponse::error(err.kind(), err.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_default()
}
