//! End-to-end relay tests
//!
//! Every test runs a real listener on an ephemeral loopback port in front of
//! a small upstream server and talks to it with plain TCP clients.

use rand::RngCore;
use sluice_relay::{Listener, ListenerStats, RelayConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

/// Upstream that echoes every byte back
async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.into_split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    port
}

/// Upstream that records everything it receives on one connection
async fn spawn_capture_server() -> (u16, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut data = Vec::new();
        let _ = socket.read_to_end(&mut data).await;
        let _ = tx.send(data);
    });
    (port, rx)
}

async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn relay_config(remote_port: u16) -> RelayConfig {
    RelayConfig::new(0, "127.0.0.1", remote_port)
        .with_bind_addr("127.0.0.1".parse().unwrap())
        .with_reap_interval(Duration::from_millis(50))
}

async fn start_relay(config: RelayConfig) -> (SocketAddr, Arc<ListenerStats>) {
    let mut listener = Listener::bind(config).expect("relay should bind");
    let addr = listener.local_addr().unwrap();
    let stats = listener.stats();
    tokio::spawn(async move { listener.run().await });
    (addr, stats)
}

/// Read until EOF or error; a reset counts as closed.
async fn expect_closed(stream: &mut TcpStream, within: Duration) {
    let mut buf = [0u8; 64];
    let result = tokio::time::timeout(within, async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(result.is_ok(), "connection was not closed within {:?}", within);
}

async fn wait_until<F: Fn() -> bool>(within: Duration, condition: F) -> bool {
    tokio::time::timeout(within, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// Send `payload` and read back the same number of bytes concurrently.
async fn echo_through(addr: SocketAddr, payload: Vec<u8>) -> Vec<u8> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut rd, mut wr) = stream.into_split();
    let len = payload.len();

    let writer = tokio::spawn(async move {
        wr.write_all(&payload).await.unwrap();
        wr
    });

    let mut received = vec![0u8; len];
    rd.read_exact(&mut received).await.unwrap();
    let _wr = writer.await.unwrap();
    received
}

#[tokio::test]
async fn test_ping_roundtrip() {
    let echo_port = spawn_echo_server().await;
    let (addr, _stats) = start_relay(relay_config(echo_port)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut reply = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(3), client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"ping");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_payload_is_byte_identical() {
    let echo_port = spawn_echo_server().await;
    let (addr, _stats) = start_relay(relay_config(echo_port)).await;

    // Many times the relay's chunk size
    let payload = random_payload(2 * 1024 * 1024 + 123);
    let received = tokio::time::timeout(Duration::from_secs(30), echo_through(addr, payload.clone()))
        .await
        .unwrap();
    assert_eq!(received, payload);
}

#[tokio::test]
async fn test_outbound_filter_transforms_payload() {
    let (capture_port, captured) = spawn_capture_server().await;
    let (addr, _stats) =
        start_relay(relay_config(capture_port).with_filter_out("tr a-z A-Z")).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    client.shutdown().await.unwrap();

    let observed = tokio::time::timeout(Duration::from_secs(5), captured)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(observed, b"HELLO");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_identity_filters_leave_bytes_unchanged() {
    let echo_port = spawn_echo_server().await;
    let (addr, _stats) = start_relay(
        relay_config(echo_port)
            .with_filter_out("cat")
            .with_filter_in("cat"),
    )
    .await;

    let payload = random_payload(256 * 1024);
    let received = tokio::time::timeout(Duration::from_secs(20), echo_through(addr, payload.clone()))
        .await
        .unwrap();
    assert_eq!(received, payload);
}

#[tokio::test]
async fn test_unreachable_remote_closes_client_and_keeps_serving() {
    let (addr, stats) = start_relay(relay_config(unused_port().await)).await;

    for _ in 0..3 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        expect_closed(&mut client, Duration::from_secs(3)).await;
    }

    assert!(wait_until(Duration::from_secs(3), || stats.accepted() == 3).await);
    assert!(wait_until(Duration::from_secs(3), || stats.active() == 0).await);
}

#[tokio::test]
async fn test_idle_client_is_disconnected() {
    let echo_port = spawn_echo_server().await;
    let idle = Duration::from_millis(200);
    let (addr, stats) = start_relay(relay_config(echo_port).with_idle_timeout(idle)).await;

    let started = Instant::now();
    let mut client = TcpStream::connect(addr).await.unwrap();
    expect_closed(&mut client, Duration::from_secs(3)).await;

    assert!(started.elapsed() >= idle);
    assert!(wait_until(Duration::from_secs(3), || stats.active() == 0).await);
}

#[tokio::test]
async fn test_periodic_activity_keeps_connection_open() {
    let echo_port = spawn_echo_server().await;
    let idle = Duration::from_millis(300);
    let (addr, _stats) = start_relay(relay_config(echo_port).with_idle_timeout(idle)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    // Stay active for well over the idle timeout
    for i in 0..10u8 {
        client.write_all(&[i]).await.unwrap();
        let mut reply = [0u8; 1];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply[0], i);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Then go quiet and get dropped
    expect_closed(&mut client, Duration::from_secs(3)).await;
}

#[tokio::test]
async fn test_remote_close_tears_down_both_sides() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = upstream.accept().await.unwrap();
        socket.write_all(b"goodbye").await.unwrap();
        socket.shutdown().await.unwrap();
        // Hold the read side open; the relay must still finish
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let (addr, stats) = start_relay(relay_config(upstream_port)).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"goodbye");
    assert!(wait_until(Duration::from_secs(3), || stats.active() == 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifty_concurrent_transfers_drain_registry() {
    let echo_port = spawn_echo_server().await;
    let (addr, stats) = start_relay(relay_config(echo_port)).await;

    let mut transfers = Vec::new();
    for _ in 0..50 {
        transfers.push(tokio::spawn(async move {
            let payload = random_payload(1024 * 1024);
            let received = echo_through(addr, payload.clone()).await;
            received == payload
        }));
    }

    for transfer in transfers {
        let matched = tokio::time::timeout(Duration::from_secs(60), transfer)
            .await
            .unwrap()
            .unwrap();
        assert!(matched, "payload corrupted in transit");
    }

    assert_eq!(stats.processed(), 50);
    assert!(
        wait_until(Duration::from_secs(5), || stats.active() == 0).await,
        "registry still holds {} entries",
        stats.active()
    );
}

#[tokio::test]
async fn test_exhausted_registry_rejects_promptly() {
    let echo_port = spawn_echo_server().await;
    let (addr, stats) = start_relay(relay_config(echo_port).with_max_connections(0)).await;

    let started = Instant::now();
    for _ in 0..20 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        expect_closed(&mut client, Duration::from_secs(2)).await;
    }

    assert!(wait_until(Duration::from_secs(3), || stats.rejected() == 20).await);
    assert_eq!(stats.processed(), 0);
    assert_eq!(stats.active(), 0);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_rejection_clears_once_capacity_frees() {
    let echo_port = spawn_echo_server().await;
    let (addr, stats) = start_relay(relay_config(echo_port).with_max_connections(1)).await;

    let mut first = TcpStream::connect(addr).await.unwrap();
    first.write_all(b"a").await.unwrap();
    let mut reply = [0u8; 1];
    first.read_exact(&mut reply).await.unwrap();

    let mut second = TcpStream::connect(addr).await.unwrap();
    expect_closed(&mut second, Duration::from_secs(2)).await;
    assert!(wait_until(Duration::from_secs(2), || stats.rejected() == 1).await);

    drop(first);
    assert!(wait_until(Duration::from_secs(3), || stats.active() == 0).await);

    let mut third = TcpStream::connect(addr).await.unwrap();
    third.write_all(b"b").await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), third.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"b");
}

#[tokio::test]
async fn test_broken_filter_only_affects_its_connection() {
    let echo_port = spawn_echo_server().await;
    let (addr, stats) = start_relay(
        relay_config(echo_port).with_filter_out("sluice-no-such-command-xyz"),
    )
    .await;

    // The shell starts but the command does not; each session ends on its own.
    for _ in 0..2 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let _ = client.write_all(b"data").await;
        expect_closed(&mut client, Duration::from_secs(5)).await;
    }

    assert!(wait_until(Duration::from_secs(3), || stats.processed() == 2).await);
    assert!(wait_until(Duration::from_secs(5), || stats.active() == 0).await);
}
