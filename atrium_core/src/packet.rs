use bytes::Bytes;

use crate::error::ErrorCode;

/// One message as seen by user code: a msgId, an error code, and an owned
/// payload. Created by the codec or by the application, consumed by exactly
/// one handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub msg_id: String,
    pub error_code: u16,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(msg_id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            msg_id: msg_id.into(),
            error_code: 0,
            payload,
        }
    }

    /// A payload-less packet, typical for acks and simple notifications.
    pub fn empty(msg_id: impl Into<String>) -> Self {
        Self::new(msg_id, Bytes::new())
    }

    /// An error reply carrying `code` and no payload.
    pub fn error(msg_id: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            msg_id: msg_id.into(),
            error_code: code.as_u16(),
            payload: Bytes::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error_code == 0
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u16(self.error_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_constructors() {
        let p = Packet::new("Echo", Bytes::from_static(b"hi"));
        assert!(p.is_ok());
        assert_eq!(p.payload.as_ref(), b"hi");

        let e = Packet::error("Echo", ErrorCode::StageNotFound);
        assert!(!e.is_ok());
        assert_eq!(e.error_code(), Some(ErrorCode::StageNotFound));
        assert!(e.payload.is_empty());
    }
}
