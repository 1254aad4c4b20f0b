use atrium_core::error::CoreError;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Read side of a client connection, TCP or WebSocket.
///
/// Both front ends surface the same thing: chunks of framed bytes for the
/// decoder. WebSocket message boundaries are irrelevant to the framing, so
/// binary messages are treated as plain byte chunks.
pub(crate) enum SessionReader {
    Tcp(OwnedReadHalf),
    Ws(SplitStream<WebSocketStream<TcpStream>>),
}

impl SessionReader {
    /// Next chunk of bytes, or `None` on a clean end of stream.
    pub(crate) async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<Option<Bytes>, CoreError> {
        match self {
            SessionReader::Tcp(read_half) => {
                let n = read_half.read(buf).await?;
                if n == 0 {
                    Ok(None)
                } else {
                    Ok(Some(Bytes::copy_from_slice(&buf[..n])))
                }
            }
            SessionReader::Ws(stream) => loop {
                match stream.next().await {
                    None => return Ok(None),
                    Some(Ok(Message::Binary(bytes))) => return Ok(Some(Bytes::from(bytes))),
                    Some(Ok(Message::Close(_))) => return Ok(None),
                    // Text, ping and pong carry nothing for the framing
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(CoreError::ConnectionFailed(e.to_string())),
                }
            },
        }
    }
}

/// Write side of a client connection.
pub(crate) enum SessionWriter {
    Tcp(OwnedWriteHalf),
    Ws(SplitSink<WebSocketStream<TcpStream>, Message>),
}

impl SessionWriter {
    pub(crate) async fn write_chunk(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        match self {
            SessionWriter::Tcp(write_half) => {
                write_half.write_all(bytes).await?;
                Ok(())
            }
            SessionWriter::Ws(sink) => sink
                .send(Message::Binary(bytes.to_vec()))
                .await
                .map_err(|e| CoreError::ConnectionFailed(e.to_string())),
        }
    }

    pub(crate) async fn shutdown(&mut self) {
        match self {
            SessionWriter::Tcp(write_half) => {
                let _ = write_half.shutdown().await;
            }
            SessionWriter::Ws(sink) => {
                let _ = sink.close().await;
            }
        }
    }
}
