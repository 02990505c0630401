use mdsync_protocol::ProtocolError;

/// Errors from storage backend operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Local filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network, authentication, or connection failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Failure reported by the remote byte-store protocol.
    #[error("byte-store protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Write attempted on a backend that only supports reads.
    #[error("backend {0} is read-only")]
    ReadOnly(String),

    /// URL scheme with no backend behind it.
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// URL that could not be parsed into a backend location.
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A file too large to replace in one request, where a split write
    /// could be cut off half-way.
    #[error("{name} is {size} bytes, more than the {max} one request can replace atomically")]
    TooLarge { name: String, size: usize, max: usize },

    /// A remote shell command exited non-zero.
    #[error("remote command `{command}` failed with status {status}: {stderr}")]
    Remote {
        command: String,
        status: i32,
        stderr: String,
    },
}

/// Result alias for backend operations.
pub type StoreResult<T> = Result<T, StoreError>;
