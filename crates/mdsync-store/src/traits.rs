use std::collections::BTreeMap;

use mdsync_types::ByteRange;

use crate::error::StoreResult;

/// Ranged reads, produced lazily where the backend allows it.
pub type RangeStream<'a> = Box<dyn Iterator<Item = StoreResult<(ByteRange, Vec<u8>)>> + 'a>;

/// Read side of a named byte store.
///
/// Expected misses are not errors: `fetch` maps absent files to `None` and
/// `exists` answers `false`. Errors are reserved for real backend failures.
pub trait ReadFs {
    /// Whole-file reads. Every requested name appears in the result.
    fn fetch(&self, names: &[String]) -> StoreResult<BTreeMap<String, Option<Vec<u8>>>>;

    /// Byte ranges of one file. Results may come back in any order; each is
    /// tagged with the range it answers.
    fn fetch_ranges<'a>(&'a self, name: &str, ranges: &[ByteRange]) -> StoreResult<RangeStream<'a>>;

    fn exists(&self, name: &str) -> StoreResult<bool>;

    /// Human-readable location, used in logs and errors.
    fn describe(&self) -> String;

    /// Single-file convenience over [`ReadFs::fetch`].
    fn fetch_one(&self, name: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut found = self.fetch(&[name.to_string()])?;
        Ok(found.remove(name).flatten())
    }
}

/// Write side of a named byte store.
pub trait WriteFs: ReadFs {
    /// Open a file for appending, creating it when missing.
    fn open_append(&self, name: &str) -> StoreResult<Box<dyn AppendHandle>>;

    /// File size in bytes; `0` when the file does not exist.
    fn size(&self, name: &str) -> StoreResult<u64>;

    /// Replace each file atomically. A failure leaves every file either at
    /// its old or its new contents, never partially written.
    fn put(&self, files: &[(String, Vec<u8>)]) -> StoreResult<()>;

    /// Undo any `put` of these files that was interrupted half-way.
    fn rollback_interrupted_puts(&self, names: &[String]) -> StoreResult<()>;

    /// Create a marker entry. `Ok(false)` when it already exists.
    fn mkdir(&self, name: &str) -> StoreResult<bool>;

    fn rmdir(&self, name: &str) -> StoreResult<()>;

    /// Create the store's own directory if it is missing.
    fn ensure_dir_exists(&self) -> StoreResult<()>;
}

/// An open append stream. Bytes are durable once `flush` returns.
pub trait AppendHandle: Send {
    fn write_all(&mut self, data: &[u8]) -> StoreResult<()>;

    fn flush(&mut self) -> StoreResult<()>;
}
