use std::time::{Duration, Instant};

use atrium_integration_tests::common::{
    pumped_connector, server_tcp_addr, start_server, test_config,
};
use atrium_connector::config::ConnectorConfig;
use atrium_core::{CoreError, Packet};
use bytes::Bytes;

fn short_timeout_connector() -> atrium_connector::connector::Connector {
    pumped_connector(
        ConnectorConfig::builder()
            .request_timeout_ms(100)
            .heartbeat_interval_ms(0)
            .heartbeat_timeout_ms(0)
            .build(),
    )
}

#[tokio::test]
async fn test_request_timeout_fires_in_window() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, _counters) = start_server(test_config("play:to1")).await;
    let addr = server_tcp_addr(&server);

    let connector = short_timeout_connector();
    connector.connect(&addr.to_string()).await.expect("connect");
    let reply = connector
        .authenticate(1, "Auth", Bytes::from_static(b"alice"))
        .await
        .expect("auth");
    assert!(reply.is_ok());

    let started = Instant::now();
    let result = connector.request_async(1, Packet::empty("NoReply")).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(CoreError::RequestTimeout)));
    assert!(elapsed >= Duration::from_millis(90), "too early: {elapsed:?}");
    // Deadline plus tracker jitter plus one action-pump tick
    assert!(elapsed <= Duration::from_millis(300), "too late: {elapsed:?}");
    assert_eq!(connector.request_timeouts(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_late_reply_dropped_and_counted() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, _counters) = start_server(test_config("play:to2")).await;
    let addr = server_tcp_addr(&server);

    let connector = short_timeout_connector();
    connector.connect(&addr.to_string()).await.expect("connect");
    let reply = connector
        .authenticate(1, "Auth", Bytes::from_static(b"bob"))
        .await
        .expect("auth");
    assert!(reply.is_ok());

    // The handler replies after 300ms; our deadline is 100ms
    let result = connector
        .request_async(1, Packet::new("SlowEcho", Bytes::from_static(b"x")))
        .await;
    assert!(matches!(result, Err(CoreError::RequestTimeout)));

    // Wait for the stale reply to arrive and be discarded
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(connector.late_replies(), 1);

    // The connection is still healthy for the next request
    let reply = connector
        .request_async(1, Packet::new("Echo", Bytes::from_static(b"y")))
        .await
        .expect("echo after late reply");
    assert_eq!(reply.payload.as_ref(), b"y");

    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_fails_pending_requests() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, _counters) = start_server(test_config("play:to3")).await;
    let addr = server_tcp_addr(&server);

    let connector = pumped_connector(
        ConnectorConfig::builder()
            .request_timeout_ms(5_000)
            .build(),
    );
    connector.connect(&addr.to_string()).await.expect("connect");
    let reply = connector
        .authenticate(1, "Auth", Bytes::from_static(b"carol"))
        .await
        .expect("auth");
    assert!(reply.is_ok());

    let pending = {
        let connector = connector.clone();
        tokio::spawn(async move {
            connector.request_async(1, Packet::empty("NoReply")).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    connector.disconnect();

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("pending resolved promptly")
        .expect("task join");
    assert!(matches!(result, Err(CoreError::ConnectionClosed)));

    server.shutdown().await;
}
