use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A batched response failed its declared-size cross-check.
    #[error("framing error: {0}")]
    Framing(String),

    #[error("request too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("invalid file name for byte store: {0:?}")]
    InvalidName(String),

    #[error("remote error: status={status}, message={message}")]
    Remote { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
