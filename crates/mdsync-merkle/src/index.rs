//! Index files of a Merkle directory.
//!
//! ```text
//! DATA         append-only log of record bytes
//! HASHES_      root: "subtree <xx> <digest>" per non-empty shard
//! HASHES_<xx>  shard: "chunk <id> <offset> <length>" per record id
//! _lock        exclusive marker held by the active writer
//! ```
//!
//! Both kinds of index file are sorted text, zstd-compressed as a whole.
//! A shard's digest is the BLAKE3 of its uncompressed text, so two stores
//! with the same records at the same offsets have identical roots.

use std::collections::BTreeMap;

use mdsync_types::{ByteRange, RecordId, ShardPrefix};

use crate::error::{MerkleError, MerkleResult};

pub const DATA_FILE: &str = "DATA";
pub const ROOT_FILE: &str = "HASHES_";
pub const LOCK_NAME: &str = "_lock";

const ZSTD_LEVEL: i32 = 3;

pub fn shard_file(prefix: ShardPrefix) -> String {
    format!("{ROOT_FILE}{prefix}")
}

/// The root file followed by all 256 shard files.
pub fn all_index_files() -> Vec<String> {
    std::iter::once(ROOT_FILE.to_string())
        .chain(ShardPrefix::all().map(shard_file))
        .collect()
}

fn compress(text: &str) -> MerkleResult<Vec<u8>> {
    zstd::encode_all(text.as_bytes(), ZSTD_LEVEL).map_err(|e| MerkleError::Compression(e.to_string()))
}

fn decompress(file: &str, data: &[u8]) -> MerkleResult<String> {
    let raw = zstd::decode_all(data).map_err(|e| MerkleError::Compression(format!("{file}: {e}")))?;
    String::from_utf8(raw).map_err(|_| corrupt(file, "not UTF-8"))
}

fn corrupt(file: &str, reason: impl Into<String>) -> MerkleError {
    MerkleError::CorruptIndex {
        file: file.to_string(),
        reason: reason.into(),
    }
}

fn digest(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Record locations for every id sharing one prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShardIndex {
    entries: BTreeMap<RecordId, ByteRange>,
}

impl ShardIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &RecordId) -> Option<ByteRange> {
        self.entries.get(id).copied()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn insert(&mut self, id: RecordId, location: ByteRange) {
        self.entries.insert(id, location);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RecordId, &ByteRange)> {
        self.entries.iter()
    }

    /// Entries present here but absent from `other`.
    pub fn new_in(&self, other: &ShardIndex) -> Vec<(RecordId, ByteRange)> {
        self.entries
            .iter()
            .filter(|(id, _)| !other.contains(id))
            .map(|(id, loc)| (*id, *loc))
            .collect()
    }

    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for (id, loc) in &self.entries {
            text.push_str(&format!("chunk {id} {} {}\n", loc.offset, loc.length));
        }
        text
    }

    pub fn from_text(file: &str, text: &str) -> MerkleResult<Self> {
        let mut shard = Self::new();
        for line in text.lines().filter(|l| !l.is_empty()) {
            let words: Vec<&str> = line.split_whitespace().collect();
            let &[tag, id, offset, length] = words.as_slice() else {
                return Err(corrupt(file, format!("bad line {line:?}")));
            };
            if tag != "chunk" {
                return Err(corrupt(file, format!("expected chunk line, got {line:?}")));
            }
            let id = RecordId::from_hex(id).map_err(|e| corrupt(file, e.to_string()))?;
            let offset = offset
                .parse()
                .map_err(|_| corrupt(file, format!("bad offset in {line:?}")))?;
            let length = length
                .parse()
                .map_err(|_| corrupt(file, format!("bad length in {line:?}")))?;
            shard.insert(id, ByteRange::new(offset, length));
        }
        Ok(shard)
    }

    pub fn digest(&self) -> String {
        digest(&self.to_text())
    }

    /// Compressed file contents and the digest the root records for them.
    pub fn encode(&self) -> MerkleResult<(Vec<u8>, String)> {
        let text = self.to_text();
        Ok((compress(&text)?, digest(&text)))
    }

    pub fn decode(file: &str, data: &[u8]) -> MerkleResult<Self> {
        Self::from_text(file, &decompress(file, data)?)
    }
}

/// Digest of every non-empty shard, keyed by prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RootIndex {
    subtrees: BTreeMap<ShardPrefix, String>,
}

impl RootIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, prefix: ShardPrefix, digest: String) {
        self.subtrees.insert(prefix, digest);
    }

    pub fn get(&self, prefix: ShardPrefix) -> Option<&str> {
        self.subtrees.get(&prefix).map(String::as_str)
    }

    pub fn prefixes(&self) -> Vec<ShardPrefix> {
        self.subtrees.keys().copied().collect()
    }

    /// Prefixes whose shard here is missing from, or differs from, `other`.
    pub fn new_or_different_in(&self, other: &RootIndex) -> Vec<ShardPrefix> {
        self.subtrees
            .iter()
            .filter(|(prefix, digest)| other.subtrees.get(prefix) != Some(digest))
            .map(|(prefix, _)| *prefix)
            .collect()
    }

    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for (prefix, digest) in &self.subtrees {
            text.push_str(&format!("subtree {prefix} {digest}\n"));
        }
        text
    }

    pub fn from_text(text: &str) -> MerkleResult<Self> {
        let mut root = Self::new();
        for line in text.lines().filter(|l| !l.is_empty()) {
            let words: Vec<&str> = line.split_whitespace().collect();
            let &[tag, prefix, digest] = words.as_slice() else {
                return Err(corrupt(ROOT_FILE, format!("bad line {line:?}")));
            };
            if tag != "subtree" {
                return Err(corrupt(ROOT_FILE, format!("expected subtree line, got {line:?}")));
            }
            let prefix = ShardPrefix::parse(prefix).map_err(|e| corrupt(ROOT_FILE, e.to_string()))?;
            root.set(prefix, digest.to_string());
        }
        Ok(root)
    }

    pub fn encode(&self) -> MerkleResult<Vec<u8>> {
        compress(&self.to_text())
    }

    pub fn decode(data: &[u8]) -> MerkleResult<Self> {
        Self::from_text(&decompress(ROOT_FILE, data)?)
    }
}
