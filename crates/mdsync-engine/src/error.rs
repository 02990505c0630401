use mdsync_merkle::MerkleError;

/// Errors from talking to the version-control engine and moving its
/// records in and out of a Merkle directory.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A packet from the engine failed its structural check.
    #[error("unexpected or bad packet (wanted {expected}), got: {found}")]
    PacketValidation { expected: String, found: String },

    /// The engine process could not be started or exited with an error.
    #[error("engine process error: {0}")]
    Process(String),

    /// The automate stdio stream was malformed or ended early.
    #[error("automate stdio error: {0}")]
    Stdio(String),

    /// Structured output could not be parsed.
    #[error("basic_io parse error: {0}")]
    BasicIo(String),

    /// The engine rejected a command.
    #[error("engine command `{command}` failed: {message}")]
    Command { command: String, message: String },

    /// A branch pattern that does not compile.
    #[error("invalid branch pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("merkle store error: {0}")]
    Merkle(#[from] MerkleError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
