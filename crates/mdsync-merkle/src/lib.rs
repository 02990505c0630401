//! Merkle directory: a content-addressed record store for dumb transports.
//!
//! Records are appended to a single data log. A two-level hash index over
//! their ids lets two stores find what they differ on by comparing one
//! small root file, then only the shards whose digests disagree.
//!
//! # Transactions
//!
//! Writers take an exclusive marker (`_lock`) with [`MerkleDir::begin`],
//! append with [`MerkleDir::add`], and publish with [`MerkleDir::commit`],
//! which rewrites the touched shards and then the root. Readers never
//! lock. Because the root is written last, a reader racing a writer may
//! miss some of the newest records; a later pull picks them up.
//!
//! [`MerkleDir::rollback`] abandons a transaction, or clears a lock left
//! behind by a crashed writer.
//!
//! # Reconciliation
//!
//! [`MerkleDir::push`] copies what the target lacks inside a transaction on
//! the target; [`MerkleDir::pull`] is the mirror image, and
//! [`MerkleDir::sync`] runs a pull followed by a push.

pub mod dir;
pub mod error;
pub mod index;

pub use dir::{Chunks, MerkleDir, SyncReport, TransferReport};
pub use error::{MerkleError, MerkleResult};
pub use index::{RootIndex, ShardIndex, DATA_FILE, LOCK_NAME, ROOT_FILE};
