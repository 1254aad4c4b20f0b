use std::fmt;

/// Wire-visible error codes carried in server frames and route envelopes.
///
/// `0` means success; everything else identifies one failure kind. The
/// numeric values are stable: they travel to clients and peer servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Success = 0,

    // Transport / request plumbing
    ConnectionFailed = 1,
    ConnectionClosed = 2,
    HeartbeatTimeout = 3,
    RequestTimeout = 4,
    Backpressure = 5,
    FrameFormat = 6,

    // Stage directory
    StageAlreadyExists = 10,
    StageNotFound = 11,
    StageCreationFailed = 12,
    UnknownStageType = 13,

    // Authentication / actor contract
    AuthenticationFailed = 20,
    AccountIdNotSet = 21,
    JoinStageFailed = 22,
    ActorNotFound = 23,

    // Dispatch
    UncheckedContentsError = 30,
    InternalError = 31,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        let code = match value {
            0 => ErrorCode::Success,
            1 => ErrorCode::ConnectionFailed,
            2 => ErrorCode::ConnectionClosed,
            3 => ErrorCode::HeartbeatTimeout,
            4 => ErrorCode::RequestTimeout,
            5 => ErrorCode::Backpressure,
            6 => ErrorCode::FrameFormat,
            10 => ErrorCode::StageAlreadyExists,
            11 => ErrorCode::StageNotFound,
            12 => ErrorCode::StageCreationFailed,
            13 => ErrorCode::UnknownStageType,
            20 => ErrorCode::AuthenticationFailed,
            21 => ErrorCode::AccountIdNotSet,
            22 => ErrorCode::JoinStageFailed,
            23 => ErrorCode::ActorNotFound,
            30 => ErrorCode::UncheckedContentsError,
            31 => ErrorCode::InternalError,
            _ => return None,
        };
        Some(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Library error type.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("frame format error: {0}")]
    FrameFormat(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("receive buffer overflow: needed {needed} bytes, limit {limit}")]
    BufferOverflow { needed: usize, limit: usize },

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    #[error("request timed out")]
    RequestTimeout,

    #[error("peer send queue full")]
    Backpressure,

    #[error("sequence {0} already pending")]
    SequenceInUse(u16),

    #[error("stage {0} not found")]
    StageNotFound(i64),

    #[error("unknown stage type: {0}")]
    UnknownStageType(String),

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("game loop already running")]
    GameLoopRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Map to the wire error code reported to clients and peers.
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            CoreError::FrameFormat(_) | CoreError::Codec(_) | CoreError::BufferOverflow { .. } => {
                ErrorCode::FrameFormat
            }
            CoreError::ConnectionFailed(_) | CoreError::Io(_) => ErrorCode::ConnectionFailed,
            CoreError::ConnectionClosed => ErrorCode::ConnectionClosed,
            CoreError::HeartbeatTimeout => ErrorCode::HeartbeatTimeout,
            CoreError::RequestTimeout => ErrorCode::RequestTimeout,
            CoreError::Backpressure | CoreError::SequenceInUse(_) => ErrorCode::Backpressure,
            CoreError::StageNotFound(_) => ErrorCode::StageNotFound,
            CoreError::UnknownStageType(_) => ErrorCode::UnknownStageType,
            CoreError::UnknownPeer(_) => ErrorCode::ConnectionFailed,
            CoreError::GameLoopRunning
            | CoreError::InvalidConfig(_)
            | CoreError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_round_trip() {
        for code in [
            ErrorCode::Success,
            ErrorCode::ConnectionClosed,
            ErrorCode::RequestTimeout,
            ErrorCode::StageAlreadyExists,
            ErrorCode::AccountIdNotSet,
            ErrorCode::UncheckedContentsError,
        ] {
            assert_eq!(ErrorCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(ErrorCode::from_u16(9999), None);
    }

    #[test]
    fn test_core_error_maps_to_wire_code() {
        assert_eq!(
            CoreError::RequestTimeout.to_error_code(),
            ErrorCode::RequestTimeout
        );
        assert_eq!(
            CoreError::FrameFormat("bad".into()).to_error_code(),
            ErrorCode::FrameFormat
        );
        assert_eq!(CoreError::Backpressure.to_error_code(), ErrorCode::Backpressure);
    }
}
