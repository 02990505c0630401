use std::collections::BTreeMap;

use mdsync_types::ByteRange;
use tracing::{debug, warn};

use crate::codec;
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{FileStat, Request, DEFAULT_MAX_POST};
use crate::transport::Transport;

/// Client-side limits for a byte-store connection.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Largest request body sent in one request.
    pub max_post: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_post: DEFAULT_MAX_POST,
        }
    }
}

/// High-level byte-store client.
///
/// Keeps every request under the server's body limit:
/// - a `put` larger than `max_post` becomes one `put` of the first
///   `max_post` bytes followed by `append`s of the rest;
/// - small files written together are packed into `putmany` requests up to
///   `max_post` bytes each;
/// - a `getmany` answer whose size list does not add up falls back to one
///   `get` per file.
pub struct ByteStoreClient<T> {
    transport: T,
    config: ClientConfig,
}

impl<T: Transport> ByteStoreClient<T> {
    pub fn new(transport: T) -> Self {
        let mut config = ClientConfig::default();
        if let Some(max) = transport.max_body() {
            config.max_post = max;
        }
        Self { transport, config }
    }

    pub fn with_config(transport: T, config: ClientConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn max_post(&self) -> usize {
        self.config.max_post.max(1)
    }

    pub fn list(&self) -> ProtocolResult<Vec<String>> {
        let resp = self.transport.call(&Request::List)?;
        Ok(codec::parse_list(&resp.body))
    }

    /// `Ok(None)` when the file does not exist.
    pub fn stat(&self, name: &str) -> ProtocolResult<Option<FileStat>> {
        match self.transport.call(&Request::Stat { name: name.into() }) {
            Ok(resp) => codec::parse_stat(&resp.body).map(Some),
            Err(ProtocolError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn exists(&self, name: &str) -> ProtocolResult<bool> {
        Ok(self.stat(name)?.is_some())
    }

    /// `Ok(None)` when the file does not exist.
    pub fn get(&self, name: &str) -> ProtocolResult<Option<Vec<u8>>> {
        match self.transport.call(&Request::Get { name: name.into() }) {
            Ok(resp) => Ok(Some(resp.body)),
            Err(ProtocolError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch several byte ranges of one file in a single request.
    pub fn get_range(&self, name: &str, ranges: &[ByteRange]) -> ProtocolResult<Vec<(ByteRange, Vec<u8>)>> {
        if ranges.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self.transport.call(&Request::GetParts {
            name: name.into(),
            ranges: ranges.to_vec(),
        })?;
        codec::split_parts(ranges, &resp.body)
    }

    /// Replace a file, splitting into `put` + `append`s when oversized.
    pub fn put(&self, name: &str, data: &[u8]) -> ProtocolResult<()> {
        let max = self.max_post();
        let (head, tail) = data.split_at(data.len().min(max));
        self.transport.call(&Request::Put {
            name: name.into(),
            body: head.to_vec(),
        })?;
        if !tail.is_empty() {
            debug!(name, total = data.len(), max, "splitting oversized put");
            self.append_chunks(name, tail)?;
        }
        Ok(())
    }

    /// Append to a file (created when missing), chunked to `max_post`.
    pub fn append(&self, name: &str, data: &[u8]) -> ProtocolResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.append_chunks(name, data)
    }

    fn append_chunks(&self, name: &str, data: &[u8]) -> ProtocolResult<()> {
        for chunk in data.chunks(self.max_post()) {
            self.transport.call(&Request::Append {
                name: name.into(),
                body: chunk.to_vec(),
            })?;
        }
        Ok(())
    }

    pub fn delete(&self, name: &str) -> ProtocolResult<bool> {
        match self.transport.call(&Request::Delete { name: name.into() }) {
            Ok(_) => Ok(true),
            Err(ProtocolError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write several files, packing small ones into `putmany` batches.
    pub fn put_many(&self, files: &[(String, Vec<u8>)]) -> ProtocolResult<()> {
        let max = self.max_post();
        let mut batch: Vec<(String, Vec<u8>)> = Vec::new();
        let mut batch_size = 0usize;

        for (name, data) in files {
            codec::validate_name(name)?;
            if data.len() > max {
                self.put(name, data)?;
                continue;
            }
            if batch_size + data.len() > max && !batch.is_empty() {
                self.flush_batch(std::mem::take(&mut batch))?;
                batch_size = 0;
            }
            batch_size += data.len();
            batch.push((name.clone(), data.clone()));
        }
        if !batch.is_empty() {
            self.flush_batch(batch)?;
        }
        Ok(())
    }

    fn flush_batch(&self, mut batch: Vec<(String, Vec<u8>)>) -> ProtocolResult<()> {
        if batch.len() == 1 {
            let (name, data) = batch.remove(0);
            return self.put(&name, &data);
        }
        debug!(files = batch.len(), "putmany batch");
        self.transport.call(&Request::PutMany { files: batch })?;
        Ok(())
    }

    /// Fetch several whole files; missing files map to `None`.
    pub fn get_many(&self, names: &[String]) -> ProtocolResult<BTreeMap<String, Option<Vec<u8>>>> {
        if names.is_empty() {
            return Ok(BTreeMap::new());
        }
        match self.try_get_many(names) {
            Ok(found) => Ok(found),
            Err(ProtocolError::Framing(reason)) => {
                warn!(%reason, "getmany framing mismatch, falling back to single gets");
                names
                    .iter()
                    .map(|name| Ok((name.clone(), self.get(name)?)))
                    .collect()
            }
            Err(e) => Err(e),
        }
    }

    fn try_get_many(&self, names: &[String]) -> ProtocolResult<BTreeMap<String, Option<Vec<u8>>>> {
        let resp = self.transport.call(&Request::GetMany {
            names: names.to_vec(),
        })?;
        let sizes = resp
            .sizes
            .ok_or_else(|| ProtocolError::Framing("getmany response without size list".into()))?;
        let parts = codec::split_many(names.len(), &resp.body, &sizes)?;
        Ok(names.iter().cloned().zip(parts).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryServer;

    fn client(max: usize) -> ByteStoreClient<MemoryServer> {
        ByteStoreClient::new(MemoryServer::with_max_body(max))
    }

    // -----------------------------------------------------------------------
    // Splitting
    // -----------------------------------------------------------------------

    #[test]
    fn oversized_put_splits_into_put_and_append() {
        let c = client(100);
        let data: Vec<u8> = (0..150u32).map(|i| (i % 251) as u8).collect();
        c.put("big", &data).unwrap();
        assert_eq!(c.transport().calls(), vec!["put", "append"]);
        assert_eq!(c.get("big").unwrap().unwrap(), data);
    }

    #[test]
    fn put_within_limit_is_single_request() {
        let c = client(100);
        c.put("small", b"abc").unwrap();
        assert_eq!(c.transport().calls(), vec!["put"]);
    }

    #[test]
    fn large_append_is_chunked() {
        let c = client(3);
        c.append("log", b"abcdefg").unwrap();
        assert_eq!(c.transport().calls(), vec!["append", "append", "append"]);
        assert_eq!(c.get("log").unwrap().unwrap(), b"abcdefg");
    }

    #[test]
    fn empty_put_creates_empty_file() {
        let c = client(10);
        c.put("empty", b"").unwrap();
        assert_eq!(c.get("empty").unwrap().unwrap(), b"");
        assert_eq!(c.stat("empty").unwrap().unwrap().size, 0);
    }

    // -----------------------------------------------------------------------
    // Batching
    // -----------------------------------------------------------------------

    #[test]
    fn small_puts_are_aggregated() {
        let c = client(100);
        let files: Vec<(String, Vec<u8>)> =
            (0..5).map(|i| (format!("f{i}"), vec![i as u8; 10])).collect();
        c.put_many(&files).unwrap();
        assert_eq!(c.transport().calls(), vec!["putmany"]);
        for (name, data) in &files {
            assert_eq!(&c.get(name).unwrap().unwrap(), data);
        }
    }

    #[test]
    fn aggregation_respects_cap() {
        let c = client(25);
        let files: Vec<(String, Vec<u8>)> =
            (0..4).map(|i| (format!("f{i}"), vec![i as u8; 10])).collect();
        c.put_many(&files).unwrap();
        assert_eq!(c.transport().calls(), vec!["putmany", "putmany"]);
    }

    #[test]
    fn oversized_member_of_batch_is_split() {
        let c = client(10);
        let files = vec![
            ("a".to_string(), vec![1u8; 4]),
            ("big".to_string(), vec![2u8; 15]),
        ];
        c.put_many(&files).unwrap();
        assert_eq!(c.get("big").unwrap().unwrap(), vec![2u8; 15]);
        assert_eq!(c.get("a").unwrap().unwrap(), vec![1u8; 4]);
    }

    #[test]
    fn put_many_rejects_bad_name() {
        let c = client(10);
        let err = c.put_many(&[("a,b".into(), vec![])]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidName(_)));
    }

    // -----------------------------------------------------------------------
    // Batched reads
    // -----------------------------------------------------------------------

    #[test]
    fn get_many_reports_missing() {
        let c = client(100);
        c.put("a", b"one").unwrap();
        let got = c.get_many(&["a".into(), "b".into()]).unwrap();
        assert_eq!(got["a"].as_deref(), Some(&b"one"[..]));
        assert!(got["b"].is_none());
    }

    #[test]
    fn get_many_falls_back_on_framing_error() {
        let c = ByteStoreClient::new(MemoryServer::with_max_body(100).with_corrupt_getmany());
        c.put("a", b"one").unwrap();
        c.put("b", b"two").unwrap();
        c.transport().clear_calls();
        let got = c.get_many(&["a".into(), "b".into()]).unwrap();
        assert_eq!(got["a"].as_deref(), Some(&b"one"[..]));
        assert_eq!(got["b"].as_deref(), Some(&b"two"[..]));
        assert_eq!(c.transport().calls(), vec!["getmany", "get", "get"]);
    }

    #[test]
    fn get_range_slices_response() {
        let c = client(100);
        c.put("DATA", b"helloworld").unwrap();
        let parts = c
            .get_range("DATA", &[ByteRange::new(5, 5), ByteRange::new(0, 5)])
            .unwrap();
        assert_eq!(parts[0].1, b"world");
        assert_eq!(parts[1].1, b"hello");
    }

    #[test]
    fn stat_and_delete() {
        let c = client(100);
        assert!(c.stat("x").unwrap().is_none());
        c.put("x", b"12345").unwrap();
        assert_eq!(c.stat("x").unwrap().unwrap().size, 5);
        assert!(c.exists("x").unwrap());
        assert!(c.delete("x").unwrap());
        assert!(!c.delete("x").unwrap());
        assert!(c.list().unwrap().is_empty());
    }
}
