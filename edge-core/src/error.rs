//! Error taxonomy shared by every entry point. Each variant maps to a stable
//! negative code (see [`EdgeError::code`]) used by the C ABI.

use crate::command::CommandError;

/// Result type alias
pub type Result<T> = std::result::Result<T, EdgeError>;

/// Code for success on the C ABI.
pub const ERROR_NONE: i32 = 0;
/// Null, out-of-range, released object, or wrong event kind.
pub const ERROR_INVALID_PARAMETER: i32 = -22;
/// Allocation refused.
pub const ERROR_OUT_OF_MEMORY: i32 = -12;
/// Socket send/receive/accept/bind failure, or malformed wire data.
pub const ERROR_IO: i32 = -5;
/// Handshake rejected or peer unreachable.
pub const ERROR_CONNECTION_FAILURE: i32 = -111;
/// Backend not available in this build or handle.
pub const ERROR_NOT_SUPPORTED: i32 = -95;
/// Catch-all, e.g. a queue pop that timed out.
pub const ERROR_UNKNOWN: i32 = -0x0100_0000;

#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed data: {0}")]
    Malformed(String),

    #[error("connection failure: {0}")]
    ConnectionFailed(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("timed out")]
    TimedOut,

    /// Returned by an event callback to reject a capability or signal failure.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl EdgeError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EdgeError::InvalidParameter(msg.into())
    }

    /// Negative code for this error, as returned from the C ABI.
    pub fn code(&self) -> i32 {
        match self {
            EdgeError::InvalidParameter(_) => ERROR_INVALID_PARAMETER,
            EdgeError::OutOfMemory => ERROR_OUT_OF_MEMORY,
            EdgeError::Io(_) | EdgeError::Malformed(_) => ERROR_IO,
            EdgeError::ConnectionFailed(_) | EdgeError::Rejected(_) => ERROR_CONNECTION_FAILURE,
            EdgeError::NotSupported(_) => ERROR_NOT_SUPPORTED,
            EdgeError::TimedOut => ERROR_UNKNOWN,
        }
    }
}

impl From<CommandError> for EdgeError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Io(io) => EdgeError::Io(io),
            CommandError::OutOfMemory(_) => EdgeError::OutOfMemory,
            other => EdgeError::Malformed(other.to_string()),
        }
    }
}
