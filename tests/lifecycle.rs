//! Forwarder start/close lifecycle: readiness, idempotent shutdown, idle
//! timeout and status reporting.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, record_status, spawn_echo_server, ScriptedSession, WAIT};
use nodetunnel::{ForwarderConfig, PortForwarder, ProxyTarget, Severity};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn echo_forwarder(echo: std::net::SocketAddr, config: ForwarderConfig) -> PortForwarder {
    PortForwarder::new(
        Arc::new(ScriptedSession::tcp(echo)),
        ProxyTarget::new(77, 5900).via_agent_loopback(),
        config,
    )
}

#[tokio::test]
async fn test_connect_succeeds_immediately_after_start() {
    let echo = spawn_echo_server().await;
    for _ in 0..20 {
        let fwd = echo_forwarder(echo, ForwarderConfig::default());
        let port = fwd.start().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("listener not ready after start()");
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        tokio::time::timeout(WAIT, client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"x");

        fwd.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_close_is_idempotent() {
    let echo = spawn_echo_server().await;
    let fwd = Arc::new(echo_forwarder(echo, ForwarderConfig::default()));
    let status = record_status(&fwd);
    let port = fwd.start().await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    eventually(|| fwd.active_sessions() == 1).await;

    let a = fwd.clone();
    let b = fwd.clone();
    let (first, second) = tokio::time::timeout(WAIT, async {
        tokio::join!(
            tokio::spawn(async move { a.close().await }),
            tokio::spawn(async move { b.close().await })
        )
    })
    .await
    .unwrap();
    first.unwrap();
    second.unwrap();

    // Third close after the fact is a no-op
    tokio::time::timeout(WAIT, fwd.close()).await.unwrap();

    assert!(!fwd.is_running());
    assert_eq!(fwd.active_sessions(), 0);

    let stopped = status
        .lock()
        .iter()
        .filter(|(_, m)| m.contains("Port forwarding stopped"))
        .count();
    assert_eq!(stopped, 1);

    let mut buf = Vec::new();
    let n = tokio::time::timeout(WAIT, client.read_to_end(&mut buf)).await.unwrap();
    assert!(matches!(n, Ok(0) | Err(_)));

    // The port is released once close() returns
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn test_idle_timeout_releases_listener() {
    let echo = spawn_echo_server().await;
    let fwd = echo_forwarder(
        echo,
        ForwarderConfig::default().with_idle_timeout(Duration::from_millis(100)),
    );
    let status = record_status(&fwd);
    let port = fwd.start().await.unwrap();

    eventually(|| !fwd.is_accepting()).await;
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

    {
        let lines = status.lock();
        let (severity, message) = lines
            .iter()
            .find(|(_, m)| m.contains("idle timeout"))
            .expect("idle timeout not reported");
        assert_eq!(*severity, Severity::Info);
        assert!(message.contains(&port.to_string()));
    }

    fwd.close().await;
}

#[tokio::test]
async fn test_idle_timeout_restarts_after_each_connection() {
    let echo = spawn_echo_server().await;
    let fwd = echo_forwarder(
        echo,
        ForwarderConfig::default().with_idle_timeout(Duration::from_millis(300)),
    );
    let port = fwd.start().await.unwrap();

    let mut clients = Vec::new();
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        clients.push(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
    }
    eventually(|| fwd.active_sessions() == 4).await;

    // Established sessions outlive the listener
    eventually(|| !fwd.is_accepting()).await;
    let client = clients.last_mut().unwrap();
    client.write_all(b"alive").await.unwrap();
    let mut buf = [0u8; 5];
    tokio::time::timeout(WAIT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"alive");

    fwd.close().await;
    assert_eq!(fwd.active_sessions(), 0);
}

#[tokio::test]
async fn test_status_lines_follow_lifecycle() {
    let echo = spawn_echo_server().await;
    let fwd = echo_forwarder(echo, ForwarderConfig::default());
    let status = record_status(&fwd);
    let port = fwd.start().await.unwrap();

    let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    eventually(|| fwd.active_sessions() == 1).await;
    let info = fwd.sessions();
    assert_eq!(info[0].id, 1);
    assert_eq!(info[0].peer_addr, client.local_addr().unwrap());

    drop(client);
    eventually(|| fwd.active_sessions() == 0).await;
    fwd.close().await;

    let lines = status.lock();
    assert!(lines.iter().all(|(s, _)| *s == Severity::Info));
    let expected = [
        "Forwarding 127.0.0.1:",
        "Connection #1 from",
        "Connection #1 closed",
        "Listener on local port",
        "Port forwarding stopped",
    ];
    let mut position = 0;
    for needle in expected {
        let found = lines[position..]
            .iter()
            .position(|(_, m)| m.contains(needle))
            .unwrap_or_else(|| panic!("missing status line {:?} in {:?}", needle, &*lines));
        position += found + 1;
    }
    assert!(lines[0].1.contains("test-node-77 port 5900 (agent loopback)"));
}

#[tokio::test]
async fn test_second_forwarder_on_same_port_fails_to_bind() {
    let echo = spawn_echo_server().await;
    let first = echo_forwarder(echo, ForwarderConfig::default());
    let port = first.start().await.unwrap();

    let second = echo_forwarder(echo, ForwarderConfig::default().with_local_port(port));
    let err = second.start().await.unwrap_err();
    assert!(err.to_string().contains("already in use"));

    second.close().await;
    first.close().await;
}
