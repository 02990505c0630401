//! Foundation types for mdsync.
//!
//! Every other mdsync crate depends on `mdsync-types`. The types here are
//! deliberately small: the Merkle directory store treats records as opaque
//! bytes, so the only structure it needs is an identifier, a location in the
//! data log, and the prefix that selects an index shard.
//!
//! # Key Types
//!
//! - [`RecordId`]: 40-hex-character content identifier supplied by callers
//! - [`ShardPrefix`]: the 2-hex-character prefix that selects an index shard
//! - [`ByteRange`]: an `(offset, length)` location inside the data log

pub mod error;
pub mod range;
pub mod record;

pub use error::TypeError;
pub use range::ByteRange;
pub use record::{RecordId, ShardPrefix, RECORD_ID_HEX_LEN};
