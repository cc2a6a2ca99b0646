//! Daemon and agent in one process, driven through the control socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kubetun_agent::{AgentConfig, RunningAgent, WorkloadSpec};
use kubetun_core::ipc::{DaemonClient, DaemonRequest, DaemonResponse};
use kubetun_core::{DaemonConfig, ErrorKind, StatusReport};
use kubetun_outbound::{ConnectRequest, ConnectResponse, ProxyStatus};
use kubetund::Daemon;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: kind-dev
clusters:
  - name: kind
    cluster:
      server: https://127.0.0.1:6443
contexts:
  - name: kind-dev
    context:
      cluster: kind
"#;

/// Echo server that prefixes every reply with `tag`.
async fn echo_server(tag: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    let mut reply = tag.as_bytes().to_vec();
                    reply.extend_from_slice(&buf[..n]);
                    if socket.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

struct Harness {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    agent: RunningAgent,
    workload: SocketAddr,
    daemon: JoinHandle<anyhow::Result<()>>,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let workload = echo_server("cluster:").await;

    let mut resolve = HashMap::new();
    resolve.insert("echo-easy.default".to_string(), workload.to_string());
    let agent = RunningAgent::start(AgentConfig {
        listen: "127.0.0.1:0".to_string(),
        namespaces: vec!["default".to_string()],
        workloads: vec![WorkloadSpec {
            front: "127.0.0.1:0".to_string(),
            ..WorkloadSpec::parse(&format!("echo-easy:8080={workload}")).unwrap()
        }],
        resolve,
        ..AgentConfig::default()
    })
    .await
    .unwrap();

    let kubeconfig = dir.path().join("kubeconfig");
    std::fs::write(&kubeconfig, KUBECONFIG).unwrap();
    let mut config = DaemonConfig {
        kubeconfig: Some(kubeconfig),
        ..DaemonConfig::default()
    };
    config.outbound.installer = "memory".to_string();
    config.tunnel.heartbeat_interval = "200ms".to_string();
    config.tunnel.heartbeat_timeout = "1s".to_string();
    config.tunnel.connect_attempts = 2;
    config.intercept.ack_timeout = "2s".to_string();
    config
        .agents
        .insert("kind-dev".to_string(), agent.tunnel_addr().to_string());

    let socket = dir.path().join("daemon.sock");
    let daemon = Daemon::start(&config, socket.clone()).await.unwrap();
    let daemon = tokio::spawn(daemon.serve());

    Harness {
        _dir: dir,
        socket,
        agent,
        workload,
        daemon,
    }
}

async fn send(socket: &Path, request: DaemonRequest) -> DaemonResponse {
    let client = DaemonClient::new(socket).with_timeout(Some(Duration::from_secs(20)));
    tokio::task::spawn_blocking(move || client.send(&request))
        .await
        .unwrap()
        .unwrap()
}

async fn roundtrip(addr: SocketAddr, msg: &[u8]) -> Vec<u8> {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(msg).await.unwrap();
    let mut buf = vec![0u8; 256];
    let n = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf.truncate(n);
    buf
}

fn connect() -> DaemonRequest {
    DaemonRequest::Connect {
        context: None,
        namespace: None,
    }
}

#[tokio::test]
async fn connect_status_and_quit() {
    let h = harness().await;

    let status = send(&h.socket, DaemonRequest::Status).await;
    assert!(status.ok);
    assert_eq!(status.message, "Not connected\n");

    let connected = send(&h.socket, connect()).await;
    assert!(connected.ok, "{}", connected.message);
    assert!(connected.message.contains("Connected to context kind-dev"));

    // Same request again is an idempotent success.
    let again = send(&h.socket, connect()).await;
    assert!(again.ok);
    assert!(again.message.contains("already connected"));

    let status = send(&h.socket, DaemonRequest::Status).await;
    assert!(status.message.contains("Context:    kind-dev"));
    assert!(status.message.contains("Proxy:      ON"));

    let version = send(&h.socket, DaemonRequest::Version).await;
    assert_eq!(version.message, format!("Daemon v{}", kubetun_core::VERSION));

    let quit = send(&h.socket, DaemonRequest::Quit).await;
    assert!(quit.ok);
    assert_eq!(quit.message, "Daemon quitting");
    tokio::time::timeout(Duration::from_secs(5), h.daemon)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!h.socket.exists());
    assert!(!DaemonClient::new(&h.socket).is_running());
    h.agent.shutdown().await;
}

#[tokio::test]
async fn quit_during_connect_leaves_no_tunnel_behind() {
    let h = harness().await;
    let socket = h.socket.clone();
    // Fails with a read error when quit wins the race; only the outcome matters.
    let connecting = tokio::spawn(async move { send(&socket, connect()).await });

    let quit = send(&h.socket, DaemonRequest::Quit).await;
    assert!(quit.ok);
    tokio::time::timeout(Duration::from_secs(10), h.daemon)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let _ = connecting.await;

    for _ in 0..100 {
        if h.agent.live_tunnels() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.agent.live_tunnels(), 0);
    h.agent.shutdown().await;
}

#[tokio::test]
async fn bad_context_is_config_error() {
    let h = harness().await;

    let resp = send(
        &h.socket,
        DaemonRequest::Connect {
            context: Some("not-likely-to-exist".into()),
            namespace: None,
        },
    )
    .await;
    assert!(!resp.ok);
    assert_eq!(resp.error_kind, Some(ErrorKind::ConfigError));
    assert!(resp.message.contains(r#""not-likely-to-exist" does not exist"#));

    let status = send(&h.socket, DaemonRequest::Status).await;
    assert_eq!(status.message, "Not connected\n");

    let resp = send(
        &h.socket,
        DaemonRequest::AddIntercept {
            workload: "echo-easy".into(),
            remote_port: 8080,
            local_port: 9000,
        },
    )
    .await;
    assert_eq!(resp.error_kind, Some(ErrorKind::NotConnected));

    send(&h.socket, DaemonRequest::Quit).await;
    h.agent.shutdown().await;
}

#[tokio::test]
async fn intercept_redirects_workload_traffic() {
    let h = harness().await;
    let local = echo_server("local:").await;
    let front = h.agent.front_addr("echo-easy", 8080).unwrap();
    assert!(send(&h.socket, connect()).await.ok);

    let added = send(
        &h.socket,
        DaemonRequest::AddIntercept {
            workload: "echo-easy".into(),
            remote_port: 8080,
            local_port: local.port(),
        },
    )
    .await;
    assert!(added.ok, "{}", added.message);
    assert!(added.message.contains("Using deployment echo-easy"));

    let conflict = send(
        &h.socket,
        DaemonRequest::AddIntercept {
            workload: "echo-easy".into(),
            remote_port: 8080,
            local_port: local.port(),
        },
    )
    .await;
    assert_eq!(conflict.error_kind, Some(ErrorKind::InterceptConflict));

    let status = send(&h.socket, DaemonRequest::Status).await;
    assert!(status.message.contains("Intercepts: 1 total"));
    assert!(status.message.contains(&format!("echo-easy:8080 -> 127.0.0.1:{}", local.port())));

    assert_eq!(roundtrip(front, b"hello").await, b"local:hello");

    let remove = DaemonRequest::RemoveIntercept {
        workload: "echo-easy".into(),
        remote_port: None,
    };
    let removed = send(&h.socket, remove.clone()).await;
    assert!(removed.ok);
    assert!(removed.message.is_empty());
    assert!(send(&h.socket, remove).await.ok);

    assert_eq!(roundtrip(front, b"hello").await, b"cluster:hello");

    send(&h.socket, DaemonRequest::Quit).await;
    h.agent.shutdown().await;
}

#[tokio::test]
async fn outbound_traffic_is_diverted_through_the_tunnel() {
    let h = harness().await;
    assert!(send(&h.socket, connect()).await.ok);

    let status = send(&h.socket, DaemonRequest::Status).await;
    let report: StatusReport = serde_json::from_value(status.data.unwrap()).unwrap();
    let proxy: SocketAddr = report.proxy_addr.unwrap().parse().unwrap();

    // A short cluster name is qualified with the namespace and dialed by the agent.
    let mut socket = TcpStream::connect(proxy).await.unwrap();
    ConnectRequest::domain("echo-easy", h.workload.port())
        .write_to(&mut socket)
        .await
        .unwrap();
    let response = ConnectResponse::read_from(&mut socket).await.unwrap();
    assert_eq!(response.status, ProxyStatus::Success);
    socket.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 64];
    let n = socket.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"cluster:ping");
    drop(socket);

    // After disconnect the proxy is gone with the session.
    assert!(send(&h.socket, DaemonRequest::Disconnect).await.ok);
    let status = send(&h.socket, DaemonRequest::Status).await;
    assert_eq!(status.message, "Not connected\n");
    assert!(TcpStream::connect(proxy).await.is_err());

    send(&h.socket, DaemonRequest::Quit).await;
    h.agent.shutdown().await;
}

#[tokio::test]
async fn second_daemon_on_a_live_socket_fails() {
    let h = harness().await;
    let err = Daemon::start(&DaemonConfig::default(), h.socket.clone()).await;
    assert!(err.is_err());
    send(&h.socket, DaemonRequest::Quit).await;
    h.agent.shutdown().await;
}
