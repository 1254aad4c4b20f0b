use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::packet::Packet;

/// Reserved msgIds used by the routing fabric itself.
pub mod sysmsg {
    /// First envelope on a fresh peer link; `from_nid` identifies the dialer.
    pub const HELLO: &str = "@Hello@";
    pub const CREATE_STAGE: &str = "@Create@Stage@";
    pub const GET_OR_CREATE_STAGE: &str = "@GetOrCreate@Stage@";
    pub const DESTROY_STAGE: &str = "@Destroy@Stage@";
    pub const LEAVE_STAGE: &str = "@Leave@Stage@";
}

/// Numeric service classes stamped into route headers.
pub mod service {
    /// Stage-addressed traffic handled by a play server.
    pub const PLAY: u16 = 1;
    /// Stateless API controllers.
    pub const API: u16 = 2;
}

/// Header of one server-to-server envelope.
///
/// `msg_seq > 0` with `is_reply == false` marks a request that expects a
/// correlated reply; `msg_seq == 0` is fire-and-forget. The encoding is
/// CBOR: any stable binary encoding preserving field identity would do, and
/// CBOR keeps the header self-describing across versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteHeader {
    pub msg_seq: u16,
    pub service_type: u16,
    pub msg_id: String,
    pub from_nid: String,
    pub stage_id: i64,
    pub account_id: String,
    pub is_reply: bool,
    pub error_code: u16,
}

impl RouteHeader {
    pub fn is_request(&self) -> bool {
        self.msg_seq > 0 && !self.is_reply
    }
}

/// One routed envelope: header plus opaque payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutePacket {
    pub header: RouteHeader,
    pub payload: Bytes,
}

impl RoutePacket {
    pub fn new(header: RouteHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Encode as `[u32 BE total][u16 BE header len][CBOR header][payload]`.
    pub fn encode(&self) -> Result<BytesMut, CoreError> {
        let header_bytes =
            serde_cbor::to_vec(&self.header).map_err(|e| CoreError::Codec(e.to_string()))?;
        if header_bytes.len() > u16::MAX as usize {
            return Err(CoreError::Codec("route header too large".into()));
        }
        let total = 2 + header_bytes.len() + self.payload.len();
        let mut buf = BytesMut::with_capacity(4 + total);
        buf.put_u32(total as u32);
        buf.put_u16(header_bytes.len() as u16);
        buf.put_slice(&header_bytes);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decode one envelope body (the bytes after the u32 length prefix).
    pub fn decode(body: &[u8]) -> Result<Self, CoreError> {
        if body.len() < 2 {
            return Err(CoreError::Codec("route envelope shorter than header length".into()));
        }
        let header_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        if body.len() < 2 + header_len {
            return Err(CoreError::Codec("route envelope truncated".into()));
        }
        let header: RouteHeader = serde_cbor::from_slice(&body[2..2 + header_len])
            .map_err(|e| CoreError::Codec(e.to_string()))?;
        let payload = Bytes::copy_from_slice(&body[2 + header_len..]);
        Ok(Self { header, payload })
    }

    /// Strip routing fields down to the user-visible packet.
    pub fn into_packet(self) -> Packet {
        Packet {
            msg_id: self.header.msg_id,
            error_code: self.header.error_code,
            payload: self.payload,
        }
    }
}

/// Payload of a `CREATE_STAGE` / `GET_OR_CREATE_STAGE` envelope. The stage
/// type rides along because first creation needs a factory; subsequent
/// references use the stageId alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateStageRequest {
    pub stage_type: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl CreateStageRequest {
    pub fn to_bytes(&self) -> Result<Bytes, CoreError> {
        serde_cbor::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| CoreError::Codec(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        serde_cbor::from_slice(bytes).map_err(|e| CoreError::Codec(e.to_string()))
    }
}

/// Reply payload for create operations. `is_created == false` means the
/// stage already existed (get-or-create returns the live one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateStageReply {
    pub is_created: bool,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl CreateStageReply {
    pub fn to_bytes(&self) -> Result<Bytes, CoreError> {
        serde_cbor::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| CoreError::Codec(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        serde_cbor::from_slice(bytes).map_err(|e| CoreError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> RouteHeader {
        RouteHeader {
            msg_seq: 99,
            service_type: service::PLAY,
            msg_id: "Shove".into(),
            from_nid: "play:1".into(),
            stage_id: 1234,
            account_id: "acct-7".into(),
            is_reply: false,
            error_code: 0,
        }
    }

    #[test]
    fn test_envelope_round_trip() {
        let packet = RoutePacket::new(sample_header(), Bytes::from_static(b"body"));
        let encoded = packet.encode().unwrap();

        let total = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(total, encoded.len() - 4);

        let decoded = RoutePacket::decode(&encoded[4..]).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.header.is_request());
    }

    #[test]
    fn test_reply_header_not_request() {
        let mut header = sample_header();
        header.is_reply = true;
        assert!(!header.is_request());
        header.is_reply = false;
        header.msg_seq = 0;
        assert!(!header.is_request());
    }

    #[test]
    fn test_truncated_envelope_rejected() {
        let packet = RoutePacket::new(sample_header(), Bytes::new());
        let encoded = packet.encode().unwrap();
        assert!(RoutePacket::decode(&encoded[4..8]).is_err());
        assert!(RoutePacket::decode(&[]).is_err());
    }

    #[test]
    fn test_create_request_round_trip() {
        let req = CreateStageRequest {
            stage_type: "Battle".into(),
            payload: b"opts".to_vec(),
        };
        let bytes = req.to_bytes().unwrap();
        assert_eq!(CreateStageRequest::from_bytes(&bytes).unwrap(), req);

        let reply = CreateStageReply {
            is_created: true,
            payload: vec![],
        };
        let bytes = reply.to_bytes().unwrap();
        assert_eq!(CreateStageReply::from_bytes(&bytes).unwrap(), reply);
    }

    #[test]
    fn test_into_packet_keeps_error_code() {
        let mut header = sample_header();
        header.error_code = 11;
        header.is_reply = true;
        let packet = RoutePacket::new(header, Bytes::from_static(b"p")).into_packet();
        assert_eq!(packet.msg_id, "Shove");
        assert_eq!(packet.error_code, 11);
        assert_eq!(packet.payload.as_ref(), b"p");
    }
}
