//! Byte relaying through the coordinator, end to end over loopback

use crate::common::{memory_tunnel, EchoServer, MemoryRelayHost, ResponderServer};
use ezdemo::{CancellationToken, CoordinatorReport, RelayConfig, RelayCoordinator};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

fn start_tunnel(
    local_port: u16,
) -> (
    MemoryRelayHost,
    CancellationToken,
    JoinHandle<ezdemo::Result<CoordinatorReport>>,
) {
    let (source, host) = memory_tunnel();
    let cancel = CancellationToken::new();
    let coordinator = RelayCoordinator::new(
        source,
        "127.0.0.1",
        local_port,
        RelayConfig::with_poll_interval(Duration::from_millis(50)),
        cancel.clone(),
    );
    (host, cancel, tokio::spawn(coordinator.run()))
}

async fn stop_tunnel(
    cancel: CancellationToken,
    task: JoinHandle<ezdemo::Result<CoordinatorReport>>,
) -> CoordinatorReport {
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("coordinator did not stop")
        .expect("coordinator panicked")
        .expect("coordinator failed")
}

#[tokio::test]
async fn test_ping_echo_through_tunnel() {
    let echo = EchoServer::start().await;
    let (host, cancel, task) = start_tunnel(echo.port);

    let mut client = host.connect();
    client.write_all(b"ping").await.unwrap();

    let mut reply = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut reply))
        .await
        .expect("no echo within timeout")
        .unwrap();
    assert_eq!(&reply, b"ping");

    let report = stop_tunnel(cancel, task).await;
    assert_eq!(report.accepted, 1);
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn test_large_payload_preserves_order() {
    let echo = EchoServer::start().await;
    let (host, cancel, task) = start_tunnel(echo.port);

    // Many buffer-sized reads, with a pattern that exposes reordering.
    let payload: Vec<u8> = (0..256 * 1024u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let client = host.connect();
    let (mut reader, mut writer) = tokio::io::split(client);

    let sender = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer
    });

    let mut received = vec![0u8; expected.len()];
    tokio::time::timeout(Duration::from_secs(10), reader.read_exact(&mut received))
        .await
        .expect("payload did not come back in time")
        .unwrap();
    let _writer = sender.await.unwrap();

    assert!(received == expected, "echoed bytes differ from bytes sent");

    stop_tunnel(cancel, task).await;
}

#[tokio::test]
async fn test_response_before_local_close_is_not_truncated() {
    let response: Vec<u8> = (0..100_000u32).map(|i| (i % 97) as u8).collect();
    let responder = ResponderServer::start(response.clone()).await;
    let (host, cancel, task) = start_tunnel(responder.port);

    let mut client = host.connect();
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
        .await
        .expect("channel was not closed after the local service finished")
        .unwrap();

    assert_eq!(received.len(), response.len());
    assert!(received == response);

    let report = stop_tunnel(cancel, task).await;
    assert_eq!(report.completed, 1);
}

#[tokio::test]
async fn test_concurrent_connections_are_independent() {
    let echo = EchoServer::start().await;
    let (host, cancel, task) = start_tunnel(echo.port);

    let mut clients = Vec::new();
    for i in 0..20u8 {
        let mut client = host.connect();
        clients.push(tokio::spawn(async move {
            let message = vec![i; 512];
            client.write_all(&message).await.unwrap();
            let mut reply = vec![0u8; message.len()];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply, message, "connection {} got another connection's bytes", i);
        }));
    }

    for client in clients {
        tokio::time::timeout(Duration::from_secs(5), client)
            .await
            .expect("connection stalled")
            .unwrap();
    }

    let report = stop_tunnel(cancel, task).await;
    assert_eq!(report.accepted, 20);
}

#[tokio::test]
async fn test_client_close_closes_local_connection() {
    let echo = EchoServer::start().await;
    let (host, cancel, task) = start_tunnel(echo.port);

    let mut client = host.connect();
    client.write_all(b"hello").await.unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(echo.open_connections(), 1);

    drop(client);

    assert!(
        crate::common::wait_until(Duration::from_secs(2), || echo.open_connections() == 0
            && host.live_channels() == 0)
        .await,
        "relay kept the local connection open after the channel closed"
    );

    stop_tunnel(cancel, task).await;
}
