use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use mdsync_types::ByteRange;

use crate::error::{StoreError, StoreResult};
use crate::traits::{AppendHandle, RangeStream, ReadFs, WriteFs};

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    fail_puts: bool,
    fail_appends: bool,
    ranges_requested: usize,
}

/// In-memory store. Clones share the same contents, so one clone can act
/// as "the remote" while another is handed to a second store instance.
#[derive(Clone, Debug, Default)]
pub struct MemoryFs {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail with a transport error.
    pub fn set_fail_puts(&self, fail: bool) {
        self.state.write().expect("lock poisoned").fail_puts = fail;
    }

    /// Make every subsequent append write half its bytes, then fail.
    pub fn set_fail_appends(&self, fail: bool) {
        self.state.write().expect("lock poisoned").fail_appends = fail;
    }

    /// Total number of ranges asked of `fetch_ranges` so far.
    pub fn ranges_requested(&self) -> usize {
        self.state.read().expect("lock poisoned").ranges_requested
    }

    /// Names of all stored files.
    pub fn file_names(&self) -> Vec<String> {
        self.state
            .read()
            .expect("lock poisoned")
            .files
            .keys()
            .cloned()
            .collect()
    }
}

impl ReadFs for MemoryFs {
    fn fetch(&self, names: &[String]) -> StoreResult<BTreeMap<String, Option<Vec<u8>>>> {
        let state = self.state.read().expect("lock poisoned");
        Ok(names
            .iter()
            .map(|name| (name.clone(), state.files.get(name).cloned()))
            .collect())
    }

    fn fetch_ranges<'a>(&'a self, name: &str, ranges: &[ByteRange]) -> StoreResult<RangeStream<'a>> {
        let mut state = self.state.write().expect("lock poisoned");
        state.ranges_requested += ranges.len();
        let empty = Vec::new();
        let data = state.files.get(name).unwrap_or(&empty);
        let parts = ranges
            .iter()
            .map(|range| {
                let end = range.end() as usize;
                data.get(range.offset as usize..end)
                    .map(|bytes| (*range, bytes.to_vec()))
                    .ok_or_else(|| {
                        StoreError::Transport(format!("range {range} beyond end of {name}"))
                    })
            })
            .collect::<Vec<_>>();
        Ok(Box::new(parts.into_iter()))
    }

    fn exists(&self, name: &str) -> StoreResult<bool> {
        let state = self.state.read().expect("lock poisoned");
        Ok(state.files.contains_key(name) || state.dirs.contains(name))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

impl WriteFs for MemoryFs {
    fn open_append(&self, name: &str) -> StoreResult<Box<dyn AppendHandle>> {
        self.state
            .write()
            .expect("lock poisoned")
            .files
            .entry(name.to_string())
            .or_default();
        Ok(Box::new(MemoryAppender {
            state: Arc::clone(&self.state),
            name: name.to_string(),
            buffer: Vec::new(),
        }))
    }

    fn size(&self, name: &str) -> StoreResult<u64> {
        let state = self.state.read().expect("lock poisoned");
        Ok(state.files.get(name).map_or(0, |d| d.len() as u64))
    }

    fn put(&self, files: &[(String, Vec<u8>)]) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        if state.fail_puts {
            return Err(StoreError::Transport("injected put failure".into()));
        }
        for (name, data) in files {
            state.files.insert(name.clone(), data.clone());
        }
        Ok(())
    }

    fn rollback_interrupted_puts(&self, _names: &[String]) -> StoreResult<()> {
        Ok(())
    }

    fn mkdir(&self, name: &str) -> StoreResult<bool> {
        Ok(self
            .state
            .write()
            .expect("lock poisoned")
            .dirs
            .insert(name.to_string()))
    }

    fn rmdir(&self, name: &str) -> StoreResult<()> {
        self.state.write().expect("lock poisoned").dirs.remove(name);
        Ok(())
    }

    fn ensure_dir_exists(&self) -> StoreResult<()> {
        Ok(())
    }
}

struct MemoryAppender {
    state: Arc<RwLock<MemoryState>>,
    name: String,
    buffer: Vec<u8>,
}

impl AppendHandle for MemoryAppender {
    fn write_all(&mut self, data: &[u8]) -> StoreResult<()> {
        if self.state.read().expect("lock poisoned").fail_appends {
            self.buffer.extend_from_slice(&data[..data.len() / 2]);
            return Err(StoreError::Transport("injected append failure".into()));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> StoreResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().expect("lock poisoned");
        state
            .files
            .entry(self.name.clone())
            .or_default()
            .append(&mut self.buffer);
        Ok(())
    }
}
