use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CoreError;
use crate::pool::BufferPool;
use crate::ring::RingBuffer;

/// Reserved msgId for liveness frames. Zero payload, msgSeq 0.
pub const HEARTBEAT_MSG_ID: &str = "@Heart@Beat@";

/// Maximum payload bytes in one frame.
pub const MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

/// Default cap on total frame bytes (prefix included).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Initial receive ring size; grows on demand up to the message cap.
pub const DEFAULT_DECODE_BUFFER: usize = 64 * 1024;

const LENGTH_PREFIX_LEN: usize = 4;
const MAX_MSG_ID_LEN: usize = 255;

/// Which way the framed bytes travel. Server frames carry a trailing
/// errorCode field that client frames omit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    fn fixed_tail_len(self) -> usize {
        match self {
            // msgSeq (2) + stageId (8)
            Direction::ClientToServer => 10,
            // msgSeq (2) + stageId (8) + errorCode (2)
            Direction::ServerToClient => 12,
        }
    }
}

/// One client wire frame.
///
/// Layout (after the 4-byte big-endian length prefix): 1-byte msgId length,
/// msgId bytes (UTF-8), little-endian u16 msgSeq, little-endian i64 stageId,
/// then — server to client only — a little-endian u16 errorCode, then the
/// payload. The outer length prefix is big-endian; the inner fields are
/// little-endian. Both are load-bearing.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub msg_id: String,
    pub msg_seq: u16,
    pub stage_id: i64,
    pub error_code: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_id: impl Into<String>, msg_seq: u16, stage_id: i64, payload: Bytes) -> Self {
        Self {
            msg_id: msg_id.into(),
            msg_seq,
            stage_id,
            error_code: 0,
            payload,
        }
    }

    pub fn with_error(
        msg_id: impl Into<String>,
        msg_seq: u16,
        stage_id: i64,
        error_code: u16,
        payload: Bytes,
    ) -> Self {
        Self {
            msg_id: msg_id.into(),
            msg_seq,
            stage_id,
            error_code,
            payload,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(HEARTBEAT_MSG_ID, 0, 0, Bytes::new())
    }

    pub fn is_heartbeat(&self) -> bool {
        self.msg_id == HEARTBEAT_MSG_ID
    }

    /// `msgSeq > 0` correlates this frame with a pending request.
    pub fn is_request(&self) -> bool {
        self.msg_seq > 0
    }

    /// Total encoded size including the length prefix.
    pub fn encoded_len(&self, direction: Direction) -> usize {
        LENGTH_PREFIX_LEN + 1 + self.msg_id.len() + direction.fixed_tail_len() + self.payload.len()
    }

    /// Encode into a fresh buffer, validating msgId and payload bounds.
    pub fn encode(&self, direction: Direction) -> Result<BytesMut, CoreError> {
        let id_len = self.msg_id.len();
        if id_len == 0 || id_len > MAX_MSG_ID_LEN {
            return Err(CoreError::FrameFormat(format!(
                "msgId length {} outside 1..={}",
                id_len, MAX_MSG_ID_LEN
            )));
        }
        if self.payload.len() > MAX_BODY_SIZE {
            return Err(CoreError::FrameFormat(format!(
                "payload {} exceeds {} bytes",
                self.payload.len(),
                MAX_BODY_SIZE
            )));
        }

        let body_len = 1 + id_len + direction.fixed_tail_len() + self.payload.len();
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body_len);
        buf.put_u32(body_len as u32);
        buf.put_u8(id_len as u8);
        buf.put_slice(self.msg_id.as_bytes());
        buf.put_u16_le(self.msg_seq);
        buf.put_i64_le(self.stage_id);
        if direction == Direction::ServerToClient {
            buf.put_u16_le(self.error_code);
        }
        buf.put_slice(&self.payload);
        Ok(buf)
    }
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    AwaitLength,
    AwaitBody(usize),
}

/// Incremental frame decoder over a byte stream.
///
/// Feed arbitrary chunks with [`feed`](FrameDecoder::feed), then drain
/// completed frames with [`next_frame`](FrameDecoder::next_frame). A
/// two-state machine: collect the 4-byte length, then the declared body.
/// Any validation failure is fatal for the stream; the caller must close
/// the connection. Single consumer by design.
pub struct FrameDecoder {
    ring: RingBuffer,
    state: DecodeState,
    direction: Direction,
    max_message_size: usize,
    pool: BufferPool,
}

impl FrameDecoder {
    pub fn new(direction: Direction, max_message_size: usize, pool: BufferPool) -> Self {
        Self {
            ring: RingBuffer::with_capacity(DEFAULT_DECODE_BUFFER, max_message_size),
            state: DecodeState::AwaitLength,
            direction,
            max_message_size,
            pool,
        }
    }

    /// Append raw bytes from the transport.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), CoreError> {
        self.ring.write(chunk)
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    /// Decode the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CoreError> {
        loop {
            match self.state {
                DecodeState::AwaitLength => {
                    if self.ring.len() < LENGTH_PREFIX_LEN {
                        return Ok(None);
                    }
                    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
                    self.ring.peek(0, &mut prefix)?;
                    let body_len = u32::from_be_bytes(prefix) as usize;
                    if body_len == 0 {
                        return Err(CoreError::FrameFormat("zero-length frame".into()));
                    }
                    if body_len + LENGTH_PREFIX_LEN > self.max_message_size {
                        return Err(CoreError::FrameFormat(format!(
                            "frame of {} bytes exceeds limit {}",
                            body_len + LENGTH_PREFIX_LEN,
                            self.max_message_size
                        )));
                    }
                    self.ring.consume(LENGTH_PREFIX_LEN);
                    self.state = DecodeState::AwaitBody(body_len);
                }
                DecodeState::AwaitBody(body_len) => {
                    if self.ring.len() < body_len {
                        return Ok(None);
                    }
                    let mut scratch = self.pool.acquire(body_len);
                    scratch.resize(body_len, 0);
                    self.ring.peek(0, &mut scratch[..body_len])?;
                    self.ring.consume(body_len);
                    self.state = DecodeState::AwaitLength;

                    let result = parse_body(&scratch[..body_len], self.direction);
                    self.pool.release(scratch);
                    return result.map(Some);
                }
            }
        }
    }
}

fn parse_body(body: &[u8], direction: Direction) -> Result<Frame, CoreError> {
    let id_len = body[0] as usize;
    if id_len == 0 {
        return Err(CoreError::FrameFormat("zero-length msgId".into()));
    }
    let fixed = direction.fixed_tail_len();
    if body.len() < 1 + id_len + fixed {
        return Err(CoreError::FrameFormat(format!(
            "truncated frame body: {} bytes, header needs {}",
            body.len(),
            1 + id_len + fixed
        )));
    }

    let msg_id = std::str::from_utf8(&body[1..1 + id_len])
        .map_err(|_| CoreError::FrameFormat("msgId is not valid UTF-8".into()))?
        .to_string();

    let mut rest = &body[1 + id_len..];
    let msg_seq = rest.get_u16_le();
    let stage_id = rest.get_i64_le();
    let error_code = match direction {
        Direction::ServerToClient => rest.get_u16_le(),
        Direction::ClientToServer => 0,
    };

    if rest.len() > MAX_BODY_SIZE {
        return Err(CoreError::FrameFormat(format!(
            "payload {} exceeds {} bytes",
            rest.len(),
            MAX_BODY_SIZE
        )));
    }

    Ok(Frame {
        msg_id,
        msg_seq,
        stage_id,
        error_code,
        payload: Bytes::copy_from_slice(rest),
    })
}
