use std::collections::BTreeMap;
use std::sync::Arc;

use mdsync_protocol::{ByteStoreClient, Transport};
use mdsync_types::ByteRange;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::traits::{AppendHandle, RangeStream, ReadFs, WriteFs};

type SharedClient = Arc<ByteStoreClient<Box<dyn Transport>>>;

/// A store kept on a remote byte-store server.
///
/// The server replaces a file atomically only when it arrives in one
/// request; a larger write would be split into `put` plus `append`s and
/// could be cut off with the file truncated. [`WriteFs::put`] therefore
/// refuses files over the request limit, and since every accepted put is
/// whole there is nothing for rollback to repair. Appends to the data log
/// are still split, which is harmless: bytes past the indexed end are
/// never read.
///
/// The server has no atomic create either: a marker is an empty file
/// written only after `stat` reports it absent, which leaves a narrow
/// window where two writers can both believe they took the lock.
#[derive(Clone)]
pub struct RemoteFs {
    client: SharedClient,
    label: String,
}

impl RemoteFs {
    pub fn new(client: ByteStoreClient<Box<dyn Transport>>, label: impl Into<String>) -> Self {
        Self {
            client: Arc::new(client),
            label: label.into(),
        }
    }

    pub fn client(&self) -> &ByteStoreClient<Box<dyn Transport>> {
        &self.client
    }
}

impl ReadFs for RemoteFs {
    fn fetch(&self, names: &[String]) -> StoreResult<BTreeMap<String, Option<Vec<u8>>>> {
        Ok(self.client.get_many(names)?)
    }

    fn fetch_ranges<'a>(&'a self, name: &str, ranges: &[ByteRange]) -> StoreResult<RangeStream<'a>> {
        let mut sorted = ranges.to_vec();
        sorted.sort();
        let parts = self.client.get_range(name, &sorted)?;
        Ok(Box::new(parts.into_iter().map(Ok)))
    }

    fn exists(&self, name: &str) -> StoreResult<bool> {
        Ok(self.client.exists(name)?)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

impl WriteFs for RemoteFs {
    fn open_append(&self, name: &str) -> StoreResult<Box<dyn AppendHandle>> {
        Ok(Box::new(RemoteAppender {
            client: Arc::clone(&self.client),
            name: name.to_string(),
            buffer: Vec::new(),
        }))
    }

    fn size(&self, name: &str) -> StoreResult<u64> {
        Ok(self.client.stat(name)?.map_or(0, |s| s.size))
    }

    fn put(&self, files: &[(String, Vec<u8>)]) -> StoreResult<()> {
        let max = self.client.config().max_post;
        if let Some((name, data)) = files.iter().find(|(_, data)| data.len() > max) {
            return Err(StoreError::TooLarge {
                name: name.clone(),
                size: data.len(),
                max,
            });
        }
        Ok(self.client.put_many(files)?)
    }

    fn rollback_interrupted_puts(&self, names: &[String]) -> StoreResult<()> {
        debug!(files = names.len(), "remote puts are never split, nothing to repair");
        Ok(())
    }

    fn mkdir(&self, name: &str) -> StoreResult<bool> {
        if self.client.exists(name)? {
            return Ok(false);
        }
        self.client.put(name, b"")?;
        Ok(true)
    }

    fn rmdir(&self, name: &str) -> StoreResult<()> {
        self.client.delete(name)?;
        Ok(())
    }

    fn ensure_dir_exists(&self) -> StoreResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for RemoteFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFs").field("label", &self.label).finish()
    }
}

struct RemoteAppender {
    client: SharedClient,
    name: String,
    buffer: Vec<u8>,
}

impl AppendHandle for RemoteAppender {
    fn write_all(&mut self, data: &[u8]) -> StoreResult<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> StoreResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.client.append(&self.name, &self.buffer)?;
        self.buffer.clear();
        Ok(())
    }
}
