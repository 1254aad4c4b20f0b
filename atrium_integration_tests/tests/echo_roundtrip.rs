use std::time::{Duration, Instant};

use atrium_integration_tests::common::{
    connect_and_auth, server_tcp_addr, start_server, test_config,
};
use atrium_core::Packet;
use bytes::Bytes;

#[tokio::test]
async fn test_echo_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, _counters) = start_server(test_config("play:echo1")).await;
    let addr = server_tcp_addr(&server);

    let connector = connect_and_auth(addr, "alice", 1).await;

    let started = Instant::now();
    let reply = connector
        .request_async(1, Packet::new("Echo", Bytes::from_static(b"hello")))
        .await
        .expect("echo reply");

    assert_eq!(reply.msg_id, "EchoReply");
    assert_eq!(reply.error_code, 0);
    assert_eq!(reply.payload.as_ref(), b"hello");
    assert!(started.elapsed() < Duration::from_secs(2));

    // Both counter blocks saw the auth and echo round-trips
    let client_metrics = connector.metrics();
    assert!(client_metrics.frames_sent >= 2);
    assert!(client_metrics.frames_received >= 2);
    assert!(client_metrics.bytes_sent > 0);
    assert!(client_metrics.bytes_received > 0);
    assert_eq!(client_metrics.shed_actions, 0);
    let server_metrics = server.metrics();
    assert!(server_metrics.frames_received >= 2);
    assert!(server_metrics.bytes_received > 0);
    assert!(server_metrics.bytes_sent > 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_push_broadcast_reaches_both_clients() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, _counters) = start_server(test_config("play:echo2")).await;
    let addr = server_tcp_addr(&server);

    let alice = connect_and_auth(addr, "alice", 7).await;
    let bob = connect_and_auth(addr, "bob", 7).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    bob.set_on_push(move |stage_id, packet| {
        let _ = tx.send((stage_id, packet));
    });

    alice
        .send(7, Packet::new("Shout", Bytes::from_static(b"hey")))
        .expect("send");

    let (stage_id, packet) =
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("push in time")
            .expect("push delivered");
    assert_eq!(stage_id, 7);
    assert_eq!(packet.msg_id, "Shouted");
    assert_eq!(packet.payload.as_ref(), b"hey");

    server.shutdown().await;
}

#[tokio::test]
async fn test_large_payload_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, _counters) = start_server(test_config("play:echo3")).await;
    let addr = server_tcp_addr(&server);
    let connector = connect_and_auth(addr, "carol", 2).await;

    let payload = Bytes::from(vec![0xA5u8; 512 * 1024]);
    let reply = connector
        .request_async(2, Packet::new("Echo", payload.clone()))
        .await
        .expect("echo reply");
    assert_eq!(reply.payload, payload);

    server.shutdown().await;
}
