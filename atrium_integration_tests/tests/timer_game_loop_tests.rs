use std::sync::atomic::Ordering;
use std::time::Duration;

use atrium_integration_tests::common::{
    connect_and_auth, pumped_connector, server_tcp_addr, start_server, test_config,
};
use atrium_connector::config::ConnectorConfig;
use atrium_core::Packet;
use bytes::Bytes;

#[tokio::test]
async fn test_count_timer_fires_exactly_n_times() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, counters) = start_server(test_config("play:tmr1")).await;
    let addr = server_tcp_addr(&server);
    let connector = connect_and_auth(addr, "alice", 1).await;

    // initial 10ms, period 20ms, 5 firings
    let reply = connector
        .request_async(1, Packet::new("StartTimer", Bytes::from_static(b"10,20,5")))
        .await
        .expect("start timer");
    assert!(reply.is_ok());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(counters.timer_fires.load(Ordering::Relaxed), 5);

    server.shutdown().await;
}

#[tokio::test]
async fn test_cancel_bounds_further_firings() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, counters) = start_server(test_config("play:tmr2")).await;
    let addr = server_tcp_addr(&server);
    let connector = connect_and_auth(addr, "alice", 2).await;

    let reply = connector
        .request_async(2, Packet::new("StartTimer", Bytes::from_static(b"0,30,0")))
        .await
        .expect("start timer");
    assert!(reply.is_ok());
    let timer_id = String::from_utf8(reply.payload.to_vec()).expect("timer id");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let reply = connector
        .request_async(2, Packet::new("CancelTimer", Bytes::from(timer_id)))
        .await
        .expect("cancel");
    assert_eq!(reply.payload.as_ref(), b"true");
    let at_cancel = counters.timer_fires.load(Ordering::Relaxed);
    assert!(at_cancel > 0, "timer never fired before cancel");

    // Anything enqueued at cancel time may still land, nothing more
    tokio::time::sleep(Duration::from_millis(400)).await;
    let after = counters.timer_fires.load(Ordering::Relaxed);
    assert!(
        after <= at_cancel + 2,
        "timer kept firing after cancel: {at_cancel} -> {after}"
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_zero_period_timer_rejected() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, _counters) = start_server(test_config("play:tmr3")).await;
    let addr = server_tcp_addr(&server);
    let connector = connect_and_auth(addr, "alice", 3).await;

    let reply = connector
        .request_async(3, Packet::new("StartTimer", Bytes::from_static(b"0,0,4")))
        .await
        .expect("start timer");
    assert!(!reply.is_ok());

    server.shutdown().await;
}

#[tokio::test]
async fn test_game_loop_ticks_at_fixed_step() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, counters) = start_server(test_config("play:tmr4")).await;
    let addr = server_tcp_addr(&server);
    let connector = connect_and_auth(addr, "alice", 4).await;

    let reply = connector
        .request_async(4, Packet::new("StartLoop", Bytes::from_static(b"50,250")))
        .await
        .expect("start loop");
    assert_eq!(reply.payload.as_ref(), b"true");

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    let reply = connector
        .request_async(4, Packet::empty("StopLoop"))
        .await
        .expect("stop loop");
    assert_eq!(reply.payload.as_ref(), b"true");

    let ticks = counters.ticks.load(Ordering::Relaxed);
    // ~20 ticks over a second at 50ms; allow generous scheduling slack
    assert!((14..=26).contains(&ticks), "tick count off: {ticks}");

    // Starting a second loop after stop works; double-start does not
    let reply = connector
        .request_async(4, Packet::new("StartLoop", Bytes::from_static(b"50,250")))
        .await
        .expect("restart loop");
    assert_eq!(reply.payload.as_ref(), b"true");
    let reply = connector
        .request_async(4, Packet::new("StartLoop", Bytes::from_static(b"50,250")))
        .await
        .expect("double start");
    assert_eq!(reply.payload.as_ref(), b"false");

    server.shutdown().await;
}

#[tokio::test]
async fn test_accumulator_cap_bounds_catch_up_burst() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, counters) = start_server(test_config("play:tmr5")).await;
    let addr = server_tcp_addr(&server);
    // Long timeout: the StopLoop request sits behind the 2s block
    let connector = pumped_connector(
        ConnectorConfig::builder()
            .request_timeout_ms(8_000)
            .heartbeat_interval_ms(0)
            .heartbeat_timeout_ms(0)
            .build(),
    );
    connector.connect(&addr.to_string()).await.expect("connect");
    let reply = connector
        .authenticate(5, "Auth", Bytes::from_static(b"alice"))
        .await
        .expect("auth");
    assert!(reply.is_ok());

    // timestep 50ms, cap 250ms: at most 5 ticks of debt may survive a stall
    let reply = connector
        .request_async(5, Packet::new("StartLoop", Bytes::from_static(b"50,250")))
        .await
        .expect("start loop");
    assert_eq!(reply.payload.as_ref(), b"true");

    let before_block = counters.ticks.load(Ordering::Relaxed);

    // Block the worker for 2 seconds, then stop the loop. The stop request
    // queues behind the capped catch-up burst.
    connector
        .send(5, Packet::new("Block", Bytes::from_static(b"2000")))
        .expect("block");
    let reply = connector
        .request_async(5, Packet::empty("StopLoop"))
        .await
        .expect("stop loop");
    assert_eq!(reply.payload.as_ref(), b"true");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let after = counters.ticks.load(Ordering::Relaxed);
    let burst = after - before_block;
    // 250ms / 50ms = 5 catch-up ticks, plus at most one racing regular tick
    assert!(
        burst <= 6,
        "catch-up burst exceeded the accumulator cap: {burst} ticks"
    );

    server.shutdown().await;
}
