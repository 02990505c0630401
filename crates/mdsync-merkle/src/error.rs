use mdsync_store::StoreError;
use mdsync_types::RecordId;

/// Errors from Merkle directory operations.
#[derive(Debug, thiserror::Error)]
pub enum MerkleError {
    /// Another writer holds the store's lock. Retry later.
    #[error("{0} is locked by another writer")]
    Locked(String),

    /// A record id was added with content that differs from what the store
    /// already holds (or is about to hold) for it.
    #[error("record {id} added with inconsistent content: {reason}")]
    Consistency { id: RecordId, reason: String },

    /// A write operation was attempted outside `begin`/`commit`.
    #[error("no open transaction")]
    NoTransaction,

    /// The operation needs the store to be outside a transaction.
    #[error("transaction still open on {0}; commit before pushing")]
    TransactionOpen(String),

    /// An append failed part-way; only `rollback` is accepted until then.
    #[error("transaction on {0} failed mid-append; roll back before continuing")]
    Poisoned(String),

    /// An index file could not be parsed, or disagrees with the data log.
    #[error("corrupt index {file}: {reason}")]
    CorruptIndex { file: String, reason: String },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("compression error: {0}")]
    Compression(String),

    /// A new-record callback failed; the transfer was rolled back.
    #[error("record callback failed: {0}")]
    Callback(Box<dyn std::error::Error + Send + Sync>),
}

/// Result alias for Merkle directory operations.
pub type MerkleResult<T> = Result<T, MerkleError>;
