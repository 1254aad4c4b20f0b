use std::sync::Arc;

use atrium_integration_tests::common::{start_server, test_config};
use atrium_core::route::CreateStageReply;
use atrium_core::ErrorCode;
use bytes::Bytes;

#[tokio::test]
async fn test_concurrent_create_has_exactly_one_winner() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, _counters) = start_server(test_config("play:race1")).await;
    let server = Arc::new(server);

    let mut handles = Vec::new();
    for _ in 0..100 {
        let server = Arc::clone(&server);
        handles.push(tokio::spawn(async move {
            server.create_stage("Test", 42, Bytes::new()).await
        }));
    }

    let mut created = 0;
    let mut already_exists = 0;
    for handle in handles {
        let reply = handle.await.expect("join").expect("create reply");
        if reply.is_ok() {
            let body = CreateStageReply::from_bytes(&reply.payload).expect("reply body");
            assert!(body.is_created);
            created += 1;
        } else {
            assert_eq!(reply.error_code, ErrorCode::StageAlreadyExists.as_u16());
            already_exists += 1;
        }
    }

    assert_eq!(created, 1, "exactly one creator must win");
    assert_eq!(already_exists, 99);
    assert!(server.has_stage(42));
    assert_eq!(server.stage_count(), 1);

    match Arc::try_unwrap(server) {
        Ok(server) => server.shutdown().await,
        Err(_) => panic!("server still shared"),
    }
}

#[tokio::test]
async fn test_get_or_create_reports_winner() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, _counters) = start_server(test_config("play:race2")).await;

    let first = server
        .get_or_create_stage("Test", 7, Bytes::new())
        .await
        .expect("first");
    assert!(first.is_ok());
    assert!(CreateStageReply::from_bytes(&first.payload).unwrap().is_created);

    let second = server
        .get_or_create_stage("Test", 7, Bytes::new())
        .await
        .expect("second");
    assert!(second.is_ok());
    assert!(!CreateStageReply::from_bytes(&second.payload).unwrap().is_created);

    assert_eq!(server.stage_count(), 1);
    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_stage_type_rejected() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, _counters) = start_server(test_config("play:race3")).await;
    let err = server
        .create_stage("Nope", 1, Bytes::new())
        .await
        .expect_err("unknown type must fail");
    assert!(matches!(err, atrium_core::CoreError::UnknownStageType(_)));
    assert_eq!(server.stage_count(), 0);
    server.shutdown().await;
}

#[tokio::test]
async fn test_destroy_removes_stage_from_directory() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, counters) = start_server(test_config("play:race4")).await;

    let reply = server
        .create_stage("Test", 9, Bytes::new())
        .await
        .expect("create");
    assert!(reply.is_ok());
    assert!(server.has_stage(9));

    let reply = server.destroy_stage(9).await.expect("destroy");
    assert!(reply.is_ok());
    assert!(!server.has_stage(9));
    assert_eq!(server.stage_count(), 0);
    assert_eq!(
        counters
            .actor_destroys
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );

    server.shutdown().await;
}
