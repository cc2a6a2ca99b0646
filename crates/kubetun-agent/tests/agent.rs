//! Drives a running agent over a real tunnel, the way the daemon does.

use std::time::Duration;

use kubetun_agent::{AgentConfig, RunningAgent, WorkloadSpec};
use kubetun_core::protocol::{AgentErrorKind, AgentRequest, AgentResponse, StreamMeta};
use kubetun_tunnel::{relay, Role, Transport, TransportConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const RPC: Duration = Duration::from_secs(5);

/// Echo server that prefixes replies with `tag`.
async fn echo_server(tag: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { return };
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

async fn start_agent(workload_target: &str) -> RunningAgent {
    let config = AgentConfig {
        listen: "127.0.0.1:0".to_string(),
        namespaces: vec!["default".to_string()],
        workloads: vec![WorkloadSpec {
            front: "127.0.0.1:0".to_string(),
            ..WorkloadSpec::parse(&format!("echo-easy:8080={workload_target}")).unwrap()
        }],
        ..AgentConfig::default()
    };
    RunningAgent::start(config).await.unwrap()
}

async fn connect(agent: &RunningAgent) -> Transport {
    Transport::connect(
        &agent.tunnel_addr().to_string(),
        Role::Daemon,
        TransportConfig::default(),
    )
    .await
    .unwrap()
}

async fn roundtrip(addr: std::net::SocketAddr, msg: &[u8]) -> Vec<u8> {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(msg).await.unwrap();
    let mut buf = vec![0u8; 256];
    let n = tokio::time::timeout(RPC, socket.read(&mut buf)).await.unwrap().unwrap();
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn negotiate_checks_namespace() {
    let agent = start_agent("127.0.0.1:1").await;
    let tunnel = connect(&agent).await;

    let granted: AgentResponse = tunnel
        .request(
            &AgentRequest::Negotiate {
                context: "kind-dev".into(),
                namespace: "default".into(),
                client_version: "test".into(),
            },
            RPC,
        )
        .await
        .unwrap();
    match granted {
        AgentResponse::Session(grant) => {
            assert_eq!(grant.session_id.len(), 16);
            assert_eq!(grant.cluster_domain, "cluster.local");
            assert_eq!(grant.namespace, "default");
        }
        other => panic!("unexpected response: {other:?}"),
    }

    let refused: AgentResponse = tunnel
        .request(
            &AgentRequest::Negotiate {
                context: "kind-dev".into(),
                namespace: "nope".into(),
                client_version: "test".into(),
            },
            RPC,
        )
        .await
        .unwrap();
    assert!(matches!(
        refused,
        AgentResponse::Error {
            kind: AgentErrorKind::BadRequest,
            ..
        }
    ));

    tunnel.close().await;
    agent.shutdown().await;
}

#[tokio::test]
async fn outbound_stream_reaches_destination() {
    let target = echo_server("svc:").await;
    let agent = start_agent("127.0.0.1:1").await;
    let tunnel = connect(&agent).await;

    let (host, port) = target.rsplit_once(':').unwrap();
    let mut stream = tunnel
        .open_stream(StreamMeta::Outbound {
            host: host.to_string(),
            port: port.parse().unwrap(),
        })
        .await
        .unwrap();
    stream.writer().write_all(b"hello").await.unwrap();
    let reply = stream.reader().read().await.unwrap().unwrap();
    assert_eq!(&reply[..], b"svc:hello");

    // Nothing listens on port 1.
    let err = tunnel
        .open_stream(StreamMeta::Outbound {
            host: "127.0.0.1".into(),
            port: 1,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("refused"));

    tunnel.close().await;
    agent.shutdown().await;
}

#[tokio::test]
async fn intercept_routes_front_traffic_until_tunnel_closes() {
    let workload = echo_server("cluster:").await;
    let local = echo_server("local:").await;
    let agent = start_agent(&workload).await;
    let front = agent.front_addr("echo-easy", 8080).unwrap();

    assert_eq!(roundtrip(front, b"a").await, b"cluster:a");

    let tunnel = connect(&agent).await;
    let mut incoming = tunnel.take_incoming().unwrap();
    tokio::spawn(async move {
        while let Some(inc) = incoming.recv().await {
            let socket = TcpStream::connect(&local).await.unwrap();
            let stream = inc.accept().unwrap();
            tokio::spawn(relay(socket, stream));
        }
    });

    let missing: AgentResponse = tunnel
        .request(
            &AgentRequest::InstallIntercept {
                workload: "ghost".into(),
                port: 8080,
            },
            RPC,
        )
        .await
        .unwrap();
    assert!(matches!(
        missing,
        AgentResponse::Error {
            kind: AgentErrorKind::DeploymentNotFound,
            ..
        }
    ));

    let installed: AgentResponse = tunnel
        .request(
            &AgentRequest::InstallIntercept {
                workload: "echo-easy".into(),
                port: 8080,
            },
            RPC,
        )
        .await
        .unwrap();
    assert!(matches!(installed, AgentResponse::Installed { .. }));
    assert_eq!(agent.intercepts().len(), 1);
    assert_eq!(roundtrip(front, b"b").await, b"local:b");

    // A second tunnel cannot take the same intercept.
    let other = connect(&agent).await;
    let conflict: AgentResponse = other
        .request(
            &AgentRequest::InstallIntercept {
                workload: "echo-easy".into(),
                port: 8080,
            },
            RPC,
        )
        .await
        .unwrap();
    assert!(matches!(
        conflict,
        AgentResponse::Error {
            kind: AgentErrorKind::Conflict,
            ..
        }
    ));

    tunnel.close().await;
    for _ in 0..50 {
        if agent.intercepts().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(agent.intercepts().is_empty());
    assert_eq!(roundtrip(front, b"c").await, b"cluster:c");

    other.close().await;
    agent.shutdown().await;
}
