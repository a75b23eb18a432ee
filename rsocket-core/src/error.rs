use thiserror::Error;

/// Wire-level error codes carried in ERROR frames.
///
/// Codes below 0x200 pertain to the connection as a whole and terminate it;
/// codes from 0x201 upward are scoped to a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    InvalidSetup = 0x001,
    UnsupportedSetup = 0x002,
    RejectedSetup = 0x003,
    RejectedResume = 0x004,
    ConnectionError = 0x101,
    ConnectionClose = 0x102,
    ApplicationError = 0x201,
    Rejected = 0x202,
    Canceled = 0x203,
    Invalid = 0x204,
}

impl ErrorCode {
    /// Whether an ERROR frame with this code terminates the whole connection.
    pub fn is_connection_level(self) -> bool {
        (self as u32) < 0x200
    }
}

impl TryFrom<u32> for ErrorCode {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0x001 => Ok(ErrorCode::InvalidSetup),
            0x002 => Ok(ErrorCode::UnsupportedSetup),
            0x003 => Ok(ErrorCode::RejectedSetup),
            0x004 => Ok(ErrorCode::RejectedResume),
            0x101 => Ok(ErrorCode::ConnectionError),
            0x102 => Ok(ErrorCode::ConnectionClose),
            0x201 => Ok(ErrorCode::ApplicationError),
            0x202 => Ok(ErrorCode::Rejected),
            0x203 => Ok(ErrorCode::Canceled),
            0x204 => Ok(ErrorCode::Invalid),
            other => Err(ProtocolError::UnknownErrorCode(other)),
        }
    }
}

/// All errors produced by the protocol engine.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("unknown error code: 0x{0:08x}")]
    UnknownErrorCode(u32),

    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("protocol version not yet negotiated")]
    VersionNotNegotiated,

    #[error("stream id space exhausted")]
    StreamIdExhausted,

    #[error("stream {0} not found")]
    StreamNotFound(u32),

    #[error("stream {0} already exists")]
    StreamAlreadyExists(u32),

    #[error("invalid stream id: {0}")]
    InvalidStreamId(u32),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("resume rejected: {0}")]
    ResumeRejected(String),

    #[error("keepalive timeout")]
    KeepaliveTimeout,

    #[error("fragment buffer limit exceeded: {size} bytes exceeds maximum {max}")]
    FragmentLimitExceeded { size: usize, max: usize },

    #[error("resume token too long: {0} bytes exceeds maximum 65535")]
    TokenTooLong(usize),

    #[error("no lease permits remaining")]
    LeaseExhausted,

    #[error("operation not valid for this stream: {0}")]
    InvalidStreamOperation(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_wire_values() {
        assert_eq!(ErrorCode::InvalidSetup as u32, 0x001);
        assert_eq!(ErrorCode::RejectedResume as u32, 0x004);
        assert_eq!(ErrorCode::ConnectionError as u32, 0x101);
        assert_eq!(ErrorCode::ApplicationError as u32, 0x201);
        assert_eq!(ErrorCode::Invalid as u32, 0x204);
    }

    #[test]
    fn error_code_level_split() {
        assert!(ErrorCode::RejectedResume.is_connection_level());
        assert!(ErrorCode::ConnectionClose.is_connection_level());
        assert!(!ErrorCode::ApplicationError.is_connection_level());
        assert!(!ErrorCode::Canceled.is_connection_level());
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert!(ErrorCode::try_from(0x300).is_err());
    }
}
