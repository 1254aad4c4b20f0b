use std::sync::atomic::Ordering;
use std::time::Duration;

use atrium_integration_tests::common::{
    connect_and_auth, default_connector, server_tcp_addr, start_server, test_config, RawClient,
};
use atrium_core::{ErrorCode, Frame, Packet};
use bytes::Bytes;

#[tokio::test]
async fn test_no_dispatch_before_authentication() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, counters) = start_server(test_config("play:auth1")).await;
    let addr = server_tcp_addr(&server);

    let mut raw = RawClient::connect(addr).await;
    raw.send(&Frame::new("Echo", 1, 1, Bytes::from_static(b"sneak")))
        .await;

    // The server must close instead of dispatching
    assert!(raw.wait_for_close(Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counters.dispatches.load(Ordering::Relaxed), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_auth_failure_closes_session() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, counters) = start_server(test_config("play:auth2")).await;
    let addr = server_tcp_addr(&server);

    let mut raw = RawClient::connect(addr).await;
    raw.send(&Frame::new("Auth", 1, 1, Bytes::from_static(b"reject")))
        .await;

    let reply = raw.recv(Duration::from_secs(2)).await.expect("auth reply");
    assert_eq!(reply.error_code, ErrorCode::AuthenticationFailed.as_u16());
    assert!(raw.wait_for_close(Duration::from_secs(2)).await);
    assert_eq!(counters.actor_destroys.load(Ordering::Relaxed), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_account_id_not_set_cleanup() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, counters) = start_server(test_config("play:auth3")).await;
    let addr = server_tcp_addr(&server);

    // OnAuthenticate succeeds but never publishes an account id
    let mut raw = RawClient::connect(addr).await;
    raw.send(&Frame::new("Auth", 1, 5, Bytes::from_static(b"noaccount")))
        .await;
    let reply = raw.recv(Duration::from_secs(2)).await.expect("auth reply");
    assert_eq!(reply.error_code, ErrorCode::AccountIdNotSet.as_u16());
    assert_eq!(counters.actor_destroys.load(Ordering::Relaxed), 1);

    // The stage survives and accepts a well-behaved join afterwards
    let connector = connect_and_auth(addr, "alice", 5).await;
    let reply = connector
        .request_async(5, Packet::empty("ActorCount"))
        .await
        .expect("actor count");
    assert_eq!(reply.payload.as_ref(), b"1");

    server.shutdown().await;
}

#[tokio::test]
async fn test_join_rejected_by_stage() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, counters) = start_server(test_config("play:auth4")).await;
    let addr = server_tcp_addr(&server);

    let connector = default_connector();
    connector.connect(&addr.to_string()).await.expect("connect");
    let reply = connector
        .authenticate(9, "Auth", Bytes::from_static(b"nojoin"))
        .await
        .expect("auth transport");
    assert_eq!(
        reply.error_code,
        ErrorCode::JoinStageFailed.as_u16(),
        "stage veto must surface as JoinStageFailed"
    );
    assert!(!connector.is_authenticated());
    assert_eq!(counters.actor_destroys.load(Ordering::Relaxed), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_rebinds_existing_actor() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, counters) = start_server(test_config("play:auth5")).await;
    let addr = server_tcp_addr(&server);

    let first = connect_and_auth(addr, "bob", 11).await;
    first.disconnect();
    tokio::time::sleep(Duration::from_millis(200)).await;
    // Disconnect notifies the stage but keeps the actor
    assert_eq!(counters.disconnected_events.load(Ordering::Relaxed), 1);

    let second = connect_and_auth(addr, "bob", 11).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counters.connected_events.load(Ordering::Relaxed), 1);
    // Still one actor: the probe was discarded, the original rebound
    let reply = second
        .request_async(11, Packet::empty("ActorCount"))
        .await
        .expect("actor count");
    assert_eq!(reply.payload.as_ref(), b"1");
    // Only one real join ever happened
    assert_eq!(counters.joins.load(Ordering::Relaxed), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_leave_stage_destroys_actor() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, counters) = start_server(test_config("play:auth6")).await;
    let addr = server_tcp_addr(&server);

    let alice = connect_and_auth(addr, "alice", 13).await;
    let _bob = connect_and_auth(addr, "bob", 13).await;

    let reply = alice
        .request_async(13, Packet::new("Kick", Bytes::from_static(b"bob")))
        .await
        .expect("kick reply");
    assert!(reply.is_ok());
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(counters.actor_destroys.load(Ordering::Relaxed), 1);
    let reply = alice
        .request_async(13, Packet::empty("ActorCount"))
        .await
        .expect("actor count");
    assert_eq!(reply.payload.as_ref(), b"1");

    server.shutdown().await;
}
