use std::time::{Duration, Instant};

use atrium_integration_tests::common::{server_tcp_addr, start_server, RawClient};
use atrium_core::{Frame, Packet};
use atrium_server::config::PlayServerConfig;
use bytes::Bytes;

fn heartbeat_config(nid: &str) -> PlayServerConfig {
    PlayServerConfig::builder()
        .nid(nid)
        .tcp_port(0)
        .authenticate_msg_id("Auth")
        .default_stage_type("Test")
        .heartbeat_interval_ms(200)
        .heartbeat_timeout_ms(1_000)
        .request_timeout_ms(2_000)
        .build()
}

#[tokio::test]
async fn test_heartbeats_keep_session_alive_then_silence_kills_it() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, _counters) = start_server(heartbeat_config("play:hb1")).await;
    let addr = server_tcp_addr(&server);

    let mut raw = RawClient::connect(addr).await;
    raw.send(&Frame::new("Auth", 1, 1, Bytes::from_static(b"alice")))
        .await;
    let reply = raw.recv(Duration::from_secs(2)).await.expect("auth reply");
    assert!(reply.error_code == 0);

    // Heartbeat for over two timeout windows; the session must survive
    let alive_until = Instant::now() + Duration::from_millis(2_500);
    while Instant::now() < alive_until {
        raw.send(&Frame::heartbeat()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert_eq!(server.session_count(), 1, "session died despite heartbeats");

    // Go silent; the server should fire HeartbeatTimeout around 1s later
    let silent_from = Instant::now();
    assert!(
        raw.wait_for_close(Duration::from_millis(2_000)).await,
        "server never closed the silent session"
    );
    let elapsed = silent_from.elapsed();
    assert!(
        elapsed >= Duration::from_millis(800),
        "closed too early: {elapsed:?}"
    );
    assert!(
        elapsed <= Duration::from_millis(1_600),
        "closed too late: {elapsed:?}"
    );
    assert_eq!(server.metrics().heartbeat_timeouts, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_server_answers_heartbeats() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, _counters) = start_server(heartbeat_config("play:hb2")).await;
    let addr = server_tcp_addr(&server);

    let connector = atrium_integration_tests::common::pumped_connector(
        atrium_connector::config::ConnectorConfig::builder()
            .request_timeout_ms(2_000)
            .heartbeat_interval_ms(100)
            .heartbeat_timeout_ms(1_000)
            .build(),
    );
    connector.connect(&addr.to_string()).await.expect("connect");
    let reply = connector
        .authenticate(1, "Auth", Bytes::from_static(b"bob"))
        .await
        .expect("auth");
    assert!(reply.is_ok());

    // With the client heartbeating at 100ms and the server answering, both
    // silence clocks stay fresh across several timeout windows.
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(connector.is_connected());
    assert_eq!(server.session_count(), 1);

    // A request still flows after all that idle time
    let reply = connector
        .request_async(1, Packet::new("Echo", Bytes::from_static(b"ping")))
        .await
        .expect("echo");
    assert_eq!(reply.payload.as_ref(), b"ping");

    server.shutdown().await;
}

#[tokio::test]
async fn test_connector_detects_dead_server() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, _counters) = start_server(heartbeat_config("play:hb3")).await;
    let addr = server_tcp_addr(&server);

    let connector = atrium_integration_tests::common::pumped_connector(
        atrium_connector::config::ConnectorConfig::builder()
            .request_timeout_ms(2_000)
            .heartbeat_interval_ms(100)
            .heartbeat_timeout_ms(600)
            .build(),
    );
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    connector.set_on_disconnected(move |reason| {
        let _ = tx.send(reason);
    });
    connector.connect(&addr.to_string()).await.expect("connect");
    let reply = connector
        .authenticate(1, "Auth", Bytes::from_static(b"carol"))
        .await
        .expect("auth");
    assert!(reply.is_ok());

    // Kill the server; the connector's silence clock must fire
    server.shutdown().await;

    let reason = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("disconnect event in time")
        .expect("disconnect event");
    // Reason depends on whether the close or the silence lands first
    assert!(
        matches!(
            reason,
            atrium_core::ErrorCode::HeartbeatTimeout | atrium_core::ErrorCode::ConnectionClosed
        ),
        "unexpected reason {reason:?}"
    );
    assert!(!connector.is_connected());
}
