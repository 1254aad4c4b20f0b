use std::time::Duration;

use atrium_integration_tests::common::{start_server, test_config};
use atrium_core::frame::{Direction, Frame, FrameDecoder};
use atrium_core::pool::BufferPool;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

async fn ws_recv_frame<S>(
    ws: &mut S,
    decoder: &mut FrameDecoder,
) -> Frame
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        if let Some(frame) = decoder.next_frame().expect("decode") {
            if frame.is_heartbeat() {
                continue;
            }
            return frame;
        }
        let message = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("message in time")
            .expect("stream open")
            .expect("message ok");
        if let Message::Binary(bytes) = message {
            decoder.feed(&bytes).expect("feed");
        }
    }
}

#[tokio::test]
async fn test_websocket_echo_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut config = test_config("play:ws1");
    config.tcp_port = None;
    config.web_socket_port = Some(0);
    config.web_socket_path = "/play".to_string();
    let (server, _counters) = start_server(config).await;
    let ws_addr = server.ws_addr().expect("ws addr");

    let (mut ws, _response) =
        tokio_tungstenite::connect_async(format!("ws://{ws_addr}/play"))
            .await
            .expect("ws connect");
    let mut decoder = FrameDecoder::new(
        Direction::ServerToClient,
        atrium_core::frame::DEFAULT_MAX_MESSAGE_SIZE,
        BufferPool::new(),
    );

    // Authenticate
    let auth = Frame::new("Auth", 1, 1, Bytes::from_static(b"wsuser"))
        .encode(Direction::ClientToServer)
        .expect("encode");
    ws.send(Message::Binary(auth.to_vec())).await.expect("send auth");
    let reply = ws_recv_frame(&mut ws, &mut decoder).await;
    assert_eq!(reply.msg_seq, 1);
    assert_eq!(reply.error_code, 0);

    // Echo
    let echo = Frame::new("Echo", 2, 1, Bytes::from_static(b"over websocket"))
        .encode(Direction::ClientToServer)
        .expect("encode");
    ws.send(Message::Binary(echo.to_vec())).await.expect("send echo");
    let reply = ws_recv_frame(&mut ws, &mut decoder).await;
    assert_eq!(reply.msg_id, "EchoReply");
    assert_eq!(reply.msg_seq, 2);
    assert_eq!(reply.payload.as_ref(), b"over websocket");

    let _ = ws.close(None).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_websocket_wrong_path_rejected() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut config = test_config("play:ws2");
    config.tcp_port = None;
    config.web_socket_port = Some(0);
    config.web_socket_path = "/play".to_string();
    let (server, _counters) = start_server(config).await;
    let ws_addr = server.ws_addr().expect("ws addr");

    let result =
        tokio_tungstenite::connect_async(format!("ws://{ws_addr}/wrong")).await;
    assert!(result.is_err(), "handshake on a wrong path must fail");

    server.shutdown().await;
}
