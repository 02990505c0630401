use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use crate::codec;
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{FileStat, Request, Response, DEFAULT_MAX_POST};
use crate::transport::Transport;

/// In-process byte-store server.
///
/// Intended for tests and embedding. Enforces the same request-body limit a
/// real server would (`413`, surfaced as `MessageTooLarge`) and keeps a log of the
/// operations it served so callers can observe batching and splitting.
pub struct MemoryServer {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    max_body: usize,
    calls: Mutex<Vec<&'static str>>,
    corrupt_getmany: bool,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_POST)
    }

    pub fn with_max_body(max_body: usize) -> Self {
        Self {
            files: RwLock::new(BTreeMap::new()),
            max_body,
            calls: Mutex::new(Vec::new()),
            corrupt_getmany: false,
        }
    }

    /// Make `getmany` answers declare one byte more than they carry.
    pub fn with_corrupt_getmany(mut self) -> Self {
        self.corrupt_getmany = true;
        self
    }

    /// Operations served so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().expect("lock poisoned").clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().expect("lock poisoned").clear();
    }

    /// Direct read access, bypassing the protocol.
    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.files.read().expect("lock poisoned").get(name).cloned()
    }

    fn check_body(&self, request: &Request) -> ProtocolResult<()> {
        let size = request.body_len();
        if size > self.max_body {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: self.max_body,
            });
        }
        Ok(())
    }
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryServer {
    fn call(&self, request: &Request) -> ProtocolResult<Response> {
        self.calls.lock().expect("lock poisoned").push(request.op());
        self.check_body(request)?;

        match request {
            Request::List => {
                let files = self.files.read().expect("lock poisoned");
                let mut body = Vec::new();
                for name in files.keys() {
                    body.extend_from_slice(name.as_bytes());
                    body.push(b'\n');
                }
                Ok(Response::body(body))
            }
            Request::Stat { name } => {
                let files = self.files.read().expect("lock poisoned");
                let data = files
                    .get(name)
                    .ok_or_else(|| ProtocolError::NotFound(name.clone()))?;
                let stat = FileStat { size: data.len() as u64 };
                Ok(Response::body(codec::encode_stat(&stat)))
            }
            Request::Get { name } => {
                let files = self.files.read().expect("lock poisoned");
                files
                    .get(name)
                    .cloned()
                    .map(Response::body)
                    .ok_or_else(|| ProtocolError::NotFound(name.clone()))
            }
            Request::GetParts { name, ranges } => {
                let files = self.files.read().expect("lock poisoned");
                let data = files
                    .get(name)
                    .ok_or_else(|| ProtocolError::NotFound(name.clone()))?;
                let mut body = Vec::new();
                for range in ranges {
                    let end = range.end() as usize;
                    if end > data.len() {
                        return Err(ProtocolError::Remote {
                            status: 416,
                            message: format!("range {range} beyond end of {name}"),
                        });
                    }
                    body.extend_from_slice(&data[range.offset as usize..end]);
                }
                Ok(Response::body(body))
            }
            Request::Put { name, body } => {
                let mut files = self.files.write().expect("lock poisoned");
                files.insert(name.clone(), body.clone());
                Ok(Response::empty())
            }
            Request::Append { name, body } => {
                let mut files = self.files.write().expect("lock poisoned");
                files.entry(name.clone()).or_default().extend_from_slice(body);
                Ok(Response::empty())
            }
            Request::Delete { name } => {
                let mut files = self.files.write().expect("lock poisoned");
                files
                    .remove(name)
                    .map(|_| Response::empty())
                    .ok_or_else(|| ProtocolError::NotFound(name.clone()))
            }
            Request::PutMany { files: batch } => {
                let mut files = self.files.write().expect("lock poisoned");
                for (name, data) in batch {
                    files.insert(name.clone(), data.clone());
                }
                Ok(Response::empty())
            }
            Request::GetMany { names } => {
                let files = self.files.read().expect("lock poisoned");
                let mut body = Vec::new();
                let mut sizes = Vec::with_capacity(names.len());
                for name in names {
                    match files.get(name) {
                        Some(data) => {
                            sizes.push(data.len() as i64);
                            body.extend_from_slice(data);
                        }
                        None => sizes.push(-1),
                    }
                }
                if self.corrupt_getmany {
                    if let Some(first) = sizes.iter_mut().find(|s| **s >= 0) {
                        *first += 1;
                    }
                }
                Ok(Response {
                    body,
                    sizes: Some(sizes),
                })
            }
        }
    }

    fn max_body(&self) -> Option<usize> {
        Some(self.max_body)
    }
}

impl std::fmt::Debug for MemoryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.files.read().expect("lock poisoned").len();
        f.debug_struct("MemoryServer")
            .field("file_count", &count)
            .field("max_body", &self.max_body)
            .finish()
    }
}
