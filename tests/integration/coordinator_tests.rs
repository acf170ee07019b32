//! Accept loop, failure isolation and shutdown sequencing

use crate::common::{find_available_port, memory_tunnel, wait_until, EchoServer};
use ezdemo::{CancellationToken, CoordinatorReport, RelayConfig, RelayCoordinator, TunnelError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const POLL: Duration = Duration::from_millis(100);

fn coordinator_for(
    local_port: u16,
) -> (
    RelayCoordinator<crate::common::MemorySource>,
    crate::common::MemoryRelayHost,
    CancellationToken,
) {
    let (source, host) = memory_tunnel();
    let cancel = CancellationToken::new();
    let coordinator = RelayCoordinator::new(
        source,
        "127.0.0.1",
        local_port,
        RelayConfig::with_poll_interval(POLL),
        cancel.clone(),
    );
    (coordinator, host, cancel)
}

#[tokio::test]
async fn test_cancel_closes_every_active_relay_before_session() {
    let echo = EchoServer::start().await;
    let (coordinator, host, cancel) = coordinator_for(echo.port);
    let task = tokio::spawn(coordinator.run());

    let mut clients = Vec::new();
    for _ in 0..10 {
        let mut client = host.connect();
        client.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        clients.push(client);
    }
    assert_eq!(host.live_channels(), 10);

    let started = Instant::now();
    cancel.cancel();
    let report = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("coordinator did not stop")
        .unwrap()
        .unwrap();

    // One poll interval for the accept loop, one for the drain, plus slack.
    assert!(
        started.elapsed() < POLL * 2 + Duration::from_secs(1),
        "shutdown took {:?}",
        started.elapsed()
    );

    assert!(host.is_closed());
    assert_eq!(host.live_at_close(), 0, "session closed under a live relay");
    assert_eq!(report.accepted, 10);
    assert_eq!(report.completed, 10);
    assert_eq!(report.aborted, 0);

    for mut client in clients {
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}

#[tokio::test]
async fn test_hundred_sequential_cycles_leave_nothing_open() {
    let echo = EchoServer::start().await;
    let (coordinator, host, cancel) = coordinator_for(echo.port);
    let task = tokio::spawn(coordinator.run());

    for i in 0..100u32 {
        let mut client = host.connect();
        let message = i.to_be_bytes();
        client.write_all(&message).await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, message);
        client.shutdown().await.unwrap();
        drop(client);
    }

    assert!(
        wait_until(Duration::from_secs(5), || echo.open_connections() == 0
            && host.live_channels() == 0)
        .await,
        "leaked connections: {} local, {} channels",
        echo.open_connections(),
        host.live_channels()
    );

    cancel.cancel();
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.accepted, 100);
    assert_eq!(report.completed, 100);
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn test_local_connect_error_does_not_stop_accepting() {
    let port = find_available_port();
    let (coordinator, host, cancel) = coordinator_for(port);
    let task = tokio::spawn(coordinator.run());

    // Nothing listens yet: the relay fails and closes this channel only.
    let mut refused = host.connect();
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), refused.read_to_end(&mut rest))
        .await
        .expect("failed relay did not close its channel")
        .unwrap();
    assert!(rest.is_empty());

    let echo = EchoServer::start_on(port).await;

    let mut client = host.connect();
    client.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut reply))
        .await
        .expect("second connection was not relayed")
        .unwrap();
    assert_eq!(&reply, b"ping");

    cancel.cancel();
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.accepted, 2);
    assert_eq!(report.failed, 1);
    drop(echo);
}

#[tokio::test]
async fn test_transport_loss_is_fatal() {
    let echo = EchoServer::start().await;
    let (coordinator, host, _cancel) = coordinator_for(echo.port);
    let task = tokio::spawn(coordinator.run());

    let mut client = host.connect();
    client.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();

    host.drop_transport();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("coordinator kept running without a transport")
        .unwrap();

    let err = result.unwrap_err();
    assert!(matches!(err, TunnelError::Channel(_)));
    assert!(err.is_fatal());
    assert!(host.is_closed());
    assert_eq!(host.live_at_close(), 0);

    // The surviving relay was told to stop rather than left running.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_cancel_before_any_connection() {
    let (coordinator, host, cancel) = coordinator_for(find_available_port());
    assert_eq!(coordinator.active_relays(), 0);
    cancel.cancel();

    let report = coordinator.run().await.unwrap();
    assert_eq!(report, CoordinatorReport::default());
    assert!(host.is_closed());
}

#[tokio::test]
async fn test_cancellation_is_shared_with_caller() {
    let (coordinator, host, cancel) = coordinator_for(find_available_port());
    let token = coordinator.cancellation();
    let task = tokio::spawn(coordinator.run());

    token.cancel();
    assert!(cancel.is_cancelled());

    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("coordinator ignored its cancellation token")
        .unwrap()
        .unwrap();
    assert!(host.is_closed());
}
