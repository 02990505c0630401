use std::collections::{BTreeMap, HashMap};

use mdsync_store::{AppendHandle, ReadFs, WriteFs};
use mdsync_types::{ByteRange, RecordId, ShardPrefix};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{MerkleError, MerkleResult};
use crate::index::{self, RootIndex, ShardIndex, DATA_FILE, LOCK_NAME, ROOT_FILE};

/// Records read back from a store, produced lazily from the data log.
pub type Chunks<'a> = Box<dyn Iterator<Item = MerkleResult<(RecordId, Vec<u8>)>> + 'a>;

/// What one push or pull copied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub records: u64,
    pub bytes: u64,
}

/// Both halves of a sync.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub pulled: TransferReport,
    pub pushed: TransferReport,
}

#[derive(Debug)]
struct Pending {
    id: RecordId,
    location: ByteRange,
    digest: blake3::Hash,
}

/// A content-addressed record store laid out as a two-level Merkle tree
/// over a storage backend.
///
/// Reads need only [`ReadFs`]; transactions need [`WriteFs`]. Root and
/// shard files are cached per instance: inside a transaction the cache is
/// authoritative (this instance holds the lock), outside one it is dropped
/// at the start of every push and every full enumeration.
///
/// Not safe for concurrent use; callers serialize access to one instance.
pub struct MerkleDir<F> {
    fs: F,
    depth: usize,
    poisoned: bool,
    data: Option<Box<dyn AppendHandle>>,
    data_len: u64,
    pending: Vec<Pending>,
    pending_index: HashMap<RecordId, usize>,
    root: Option<RootIndex>,
    shards: HashMap<ShardPrefix, ShardIndex>,
}

impl<F: ReadFs> MerkleDir<F> {
    /// Open a store over `fs`. Nothing is read until first use.
    pub fn new(fs: F) -> Self {
        Self {
            fs,
            depth: 0,
            poisoned: false,
            data: None,
            data_len: 0,
            pending: Vec::new(),
            pending_index: HashMap::new(),
            root: None,
            shards: HashMap::new(),
        }
    }

    /// The backend this store lives on.
    pub fn fs(&self) -> &F {
        &self.fs
    }

    /// Whether this instance holds the lock.
    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    /// Forget cached index files unless a transaction is open.
    pub fn refresh(&mut self) {
        if self.depth == 0 {
            self.root = None;
            self.shards.clear();
        }
    }

    fn load_root(&mut self) -> MerkleResult<&RootIndex> {
        if self.root.is_none() {
            let root = match self.fs.fetch_one(ROOT_FILE)? {
                Some(data) => RootIndex::decode(&data)?,
                None => RootIndex::new(),
            };
            self.root = Some(root);
        }
        Ok(self.root.get_or_insert_with(RootIndex::new))
    }

    fn load_shards(&mut self, prefixes: &[ShardPrefix]) -> MerkleResult<()> {
        let needed: Vec<ShardPrefix> = prefixes
            .iter()
            .filter(|p| !self.shards.contains_key(*p))
            .copied()
            .collect();
        if needed.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = needed.iter().map(|p| index::shard_file(*p)).collect();
        let mut fetched = self.fs.fetch(&names)?;
        for (prefix, name) in needed.into_iter().zip(names) {
            let shard = match fetched.remove(&name).flatten() {
                Some(data) => ShardIndex::decode(&name, &data)?,
                None => ShardIndex::new(),
            };
            self.shards.insert(prefix, shard);
        }
        Ok(())
    }

    /// Whether `id` is committed or pending in this store.
    pub fn contains(&mut self, id: &RecordId) -> MerkleResult<bool> {
        if self.pending_index.contains_key(id) {
            return Ok(true);
        }
        let prefix = id.prefix();
        self.load_shards(&[prefix])?;
        Ok(self.shards.get(&prefix).is_some_and(|s| s.contains(id)))
    }

    fn committed_locations(&mut self) -> MerkleResult<Vec<(RecordId, ByteRange)>> {
        let prefixes = self.load_root()?.prefixes();
        self.load_shards(&prefixes)?;
        let mut locations = Vec::new();
        for prefix in &prefixes {
            if let Some(shard) = self.shards.get(prefix) {
                locations.extend(shard.iter().map(|(id, loc)| (*id, *loc)));
            }
        }
        Ok(locations)
    }

    /// Every committed record id.
    pub fn all_ids(&mut self) -> MerkleResult<Vec<RecordId>> {
        self.refresh();
        Ok(self
            .committed_locations()?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// Every committed record, fetched with one batched ranged read.
    pub fn all_chunks(&mut self) -> MerkleResult<Chunks<'_>> {
        self.refresh();
        let locations = self.committed_locations()?;
        self.get_chunks(locations)
    }

    /// Read the records at `locations` from the data log.
    ///
    /// Zero-length records are produced directly: several of them may
    /// share an offset, so their location cannot identify them.
    pub fn get_chunks(&self, locations: Vec<(RecordId, ByteRange)>) -> MerkleResult<Chunks<'_>> {
        let mut empties = Vec::new();
        let mut by_location: HashMap<ByteRange, RecordId> = HashMap::new();
        for (id, location) in locations {
            if location.is_empty() {
                empties.push(Ok((id, Vec::new())));
                continue;
            }
            if let Some(other) = by_location.insert(location, id) {
                if other != id {
                    return Err(MerkleError::CorruptIndex {
                        file: DATA_FILE.to_string(),
                        reason: format!("{other} and {id} both claim {location}"),
                    });
                }
            }
        }
        if by_location.is_empty() {
            return Ok(Box::new(empties.into_iter()));
        }

        let mut ranges: Vec<ByteRange> = by_location.keys().copied().collect();
        ranges.sort();
        let stream = self.fs.fetch_ranges(DATA_FILE, &ranges)?;
        let fetched = stream.map(move |item| -> MerkleResult<(RecordId, Vec<u8>)> {
            let (range, data) = item?;
            let id = by_location
                .get(&range)
                .copied()
                .ok_or_else(|| MerkleError::CorruptIndex {
                    file: DATA_FILE.to_string(),
                    reason: format!("backend returned unrequested range {range}"),
                })?;
            Ok((id, data))
        });
        Ok(Box::new(empties.into_iter().chain(fetched)))
    }

    /// Copy every record this store has and `target` lacks.
    pub fn push<G: WriteFs>(&mut self, target: &mut MerkleDir<G>) -> MerkleResult<TransferReport> {
        self.push_with(target, |_, _| Ok(()))
    }

    /// [`MerkleDir::push`], calling `on_record` for each record copied.
    ///
    /// Runs in its own transaction on `target`; on any failure after the
    /// lock is taken the target is rolled back before the error returns.
    pub fn push_with<G, C>(&mut self, target: &mut MerkleDir<G>, mut on_record: C) -> MerkleResult<TransferReport>
    where
        G: WriteFs,
        C: FnMut(&RecordId, &[u8]) -> MerkleResult<()>,
    {
        if self.depth > 0 {
            return Err(MerkleError::TransactionOpen(self.fs.describe()));
        }
        self.refresh();
        target.begin()?;
        match self.transfer_into(target, &mut on_record) {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!(target = %target.fs.describe(), error = %e, "push failed, rolling back");
                if let Err(rollback) = target.rollback() {
                    warn!(error = %rollback, "rollback after failed push also failed");
                }
                Err(e)
            }
        }
    }

    fn transfer_into<G, C>(&mut self, target: &mut MerkleDir<G>, on_record: &mut C) -> MerkleResult<TransferReport>
    where
        G: WriteFs,
        C: FnMut(&RecordId, &[u8]) -> MerkleResult<()>,
    {
        let source_root = self.load_root()?.clone();
        let target_root = target.load_root()?.clone();
        let differing = source_root.new_or_different_in(&target_root);

        let mut report = TransferReport::default();
        if !differing.is_empty() {
            self.load_shards(&differing)?;
            target.load_shards(&differing)?;
            let empty = ShardIndex::new();
            let mut missing = Vec::new();
            for prefix in &differing {
                let mine = self.shards.get(prefix).unwrap_or(&empty);
                let theirs = target.shards.get(prefix).unwrap_or(&empty);
                missing.extend(
                    mine.new_in(theirs)
                        .into_iter()
                        .filter(|(id, _)| !target.pending_index.contains_key(id)),
                );
            }
            debug!(shards = differing.len(), records = missing.len(), "push diff");

            for item in self.get_chunks(missing)? {
                let (id, data) = item?;
                target.add(id, &data)?;
                on_record(&id, &data)?;
                report.records += 1;
                report.bytes += data.len() as u64;
            }
        }

        target.flush()?;
        target.commit()?;
        info!(
            from = %self.fs.describe(),
            to = %target.fs.describe(),
            records = report.records,
            bytes = report.bytes,
            "push complete"
        );
        Ok(report)
    }
}

impl<F: WriteFs> MerkleDir<F> {
    /// Open a transaction, taking the store's lock on the outermost call.
    pub fn begin(&mut self) -> MerkleResult<()> {
        if self.depth == 0 {
            if !self.fs.mkdir(LOCK_NAME)? {
                return Err(MerkleError::Locked(self.fs.describe()));
            }
            self.root = None;
            self.shards.clear();
            if let Err(e) = self.open_data() {
                if let Err(unlock) = self.fs.rmdir(LOCK_NAME) {
                    warn!(error = %unlock, "failed to release lock after open failure");
                }
                return Err(e);
            }
            debug!(store = %self.fs.describe(), data_len = self.data_len, "lock acquired");
        } else {
            self.check_poisoned()?;
        }
        self.depth += 1;
        Ok(())
    }

    fn check_poisoned(&self) -> MerkleResult<()> {
        if self.poisoned {
            return Err(MerkleError::Poisoned(self.fs.describe()));
        }
        Ok(())
    }

    fn open_data(&mut self) -> MerkleResult<()> {
        self.data_len = self.fs.size(DATA_FILE)?;
        self.data = Some(self.fs.open_append(DATA_FILE)?);
        Ok(())
    }

    /// Append a record. The caller checks [`MerkleDir::contains`] first;
    /// re-adding an id already pending with the same bytes is a no-op, with
    /// different bytes a [`MerkleError::Consistency`].
    ///
    /// A failed append leaves an unknown number of bytes in the log, so the
    /// transaction is poisoned: everything but `rollback` then fails with
    /// [`MerkleError::Poisoned`].
    pub fn add(&mut self, id: RecordId, data: &[u8]) -> MerkleResult<()> {
        if self.depth == 0 {
            return Err(MerkleError::NoTransaction);
        }
        self.check_poisoned()?;
        let digest = blake3::hash(data);
        if let Some(&i) = self.pending_index.get(&id) {
            if self.pending[i].digest == digest {
                debug!(%id, "duplicate add ignored");
                return Ok(());
            }
            return Err(MerkleError::Consistency {
                id,
                reason: "differs from the pending entry".into(),
            });
        }

        let handle = self.data.as_mut().ok_or(MerkleError::NoTransaction)?;
        if let Err(e) = handle.write_all(data) {
            self.poisoned = true;
            warn!(store = %self.fs.describe(), %id, error = %e, "append failed, transaction poisoned");
            return Err(e.into());
        }
        let location = ByteRange::new(self.data_len, data.len() as u64);
        self.data_len += location.length;
        self.pending_index.insert(id, self.pending.len());
        self.pending.push(Pending {
            id,
            location,
            digest,
        });
        Ok(())
    }

    /// Close a transaction. The outermost commit flushes and unlocks.
    pub fn commit(&mut self) -> MerkleResult<()> {
        if self.depth == 0 {
            return Err(MerkleError::NoTransaction);
        }
        self.check_poisoned()?;
        if self.depth == 1 {
            self.flush()?;
        }
        self.depth -= 1;
        if self.depth == 0 {
            self.data = None;
            self.fs.rmdir(LOCK_NAME)?;
            debug!(store = %self.fs.describe(), "lock released");
        }
        Ok(())
    }

    /// Abandon any transaction and clear the lock, whoever left it.
    ///
    /// Pending records are dropped; bytes already appended stay in the log
    /// unreferenced. Index files caught mid-replacement are repaired.
    pub fn rollback(&mut self) -> MerkleResult<()> {
        let held = self.depth > 0;
        self.depth = 0;
        self.poisoned = false;
        self.data = None;
        self.pending.clear();
        self.pending_index.clear();
        self.root = None;
        self.shards.clear();

        if self.fs.mkdir(LOCK_NAME)? {
            self.fs.rmdir(LOCK_NAME)?;
            debug!(store = %self.fs.describe(), "rollback: store was not locked");
            return Ok(());
        }
        self.fs.rollback_interrupted_puts(&index::all_index_files())?;
        self.fs.rmdir(LOCK_NAME)?;
        if held {
            info!(store = %self.fs.describe(), "transaction rolled back");
        } else {
            warn!(store = %self.fs.describe(), "removed stale lock");
        }
        Ok(())
    }

    /// Make pending records durable and visible without ending the
    /// transaction. A no-op outside a transaction.
    pub fn flush(&mut self) -> MerkleResult<()> {
        if self.depth == 0 {
            return Ok(());
        }
        self.check_poisoned()?;
        if let Some(handle) = self.data.as_mut() {
            handle.flush()?;
        }
        self.flush_index()
    }

    /// Shards first, root last: a reader may find a shard newer than the
    /// root describes, never a root entry without its shard.
    fn flush_index(&mut self) -> MerkleResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut bins: BTreeMap<ShardPrefix, Vec<usize>> = BTreeMap::new();
        for (i, pending) in self.pending.iter().enumerate() {
            bins.entry(pending.id.prefix()).or_default().push(i);
        }
        let prefixes: Vec<ShardPrefix> = bins.keys().copied().collect();
        self.load_shards(&prefixes)?;
        self.load_root()?;

        let mut updated: BTreeMap<ShardPrefix, ShardIndex> = BTreeMap::new();
        let mut added = 0usize;
        for (prefix, members) in &bins {
            let mut shard = self.shards.get(prefix).cloned().unwrap_or_default();
            for &i in members {
                let pending = &self.pending[i];
                if let Some(existing) = shard.get(&pending.id) {
                    self.check_committed_duplicate(pending, existing)?;
                    continue;
                }
                shard.insert(pending.id, pending.location);
                added += 1;
            }
            updated.insert(*prefix, shard);
        }

        let mut files = Vec::with_capacity(updated.len());
        let mut root = self.root.clone().unwrap_or_default();
        for (prefix, shard) in &updated {
            let (bytes, digest) = shard.encode()?;
            files.push((index::shard_file(*prefix), bytes));
            root.set(*prefix, digest);
        }
        info!(
            store = %self.fs.describe(),
            "writing hashes for {added} new ids to {} hash files",
            files.len()
        );
        self.fs.put(&files)?;
        self.fs.put(&[(ROOT_FILE.to_string(), root.encode()?)])?;

        self.shards.extend(updated);
        self.root = Some(root);
        self.pending.clear();
        self.pending_index.clear();
        Ok(())
    }

    fn check_committed_duplicate(&self, pending: &Pending, existing: ByteRange) -> MerkleResult<()> {
        let stored = if existing.is_empty() {
            Vec::new()
        } else {
            let mut stream = self.fs.fetch_ranges(DATA_FILE, &[existing])?;
            match stream.next() {
                Some(item) => item?.1,
                None => {
                    return Err(MerkleError::CorruptIndex {
                        file: DATA_FILE.to_string(),
                        reason: format!("no bytes at {existing}"),
                    })
                }
            }
        };
        if blake3::hash(&stored) == pending.digest {
            debug!(id = %pending.id, "already indexed with identical content");
            return Ok(());
        }
        Err(MerkleError::Consistency {
            id: pending.id,
            reason: "differs from the committed entry".into(),
        })
    }

    /// Copy every record `source` has and this store lacks.
    pub fn pull<G: ReadFs>(&mut self, source: &mut MerkleDir<G>) -> MerkleResult<TransferReport> {
        source.push(self)
    }

    pub fn pull_with<G, C>(&mut self, source: &mut MerkleDir<G>, on_record: C) -> MerkleResult<TransferReport>
    where
        G: ReadFs,
        C: FnMut(&RecordId, &[u8]) -> MerkleResult<()>,
    {
        source.push_with(self, on_record)
    }

    /// Pull from `other`, then push to it: two separate transactions.
    pub fn sync<G: WriteFs>(&mut self, other: &mut MerkleDir<G>) -> MerkleResult<SyncReport> {
        self.sync_with(other, |_, _| Ok(()), |_, _| Ok(()))
    }

    /// [`MerkleDir::sync`] with callbacks for records arriving here
    /// (`on_local`) and records sent to `other` (`on_remote`).
    pub fn sync_with<G, A, B>(
        &mut self,
        other: &mut MerkleDir<G>,
        on_local: A,
        on_remote: B,
    ) -> MerkleResult<SyncReport>
    where
        G: WriteFs,
        A: FnMut(&RecordId, &[u8]) -> MerkleResult<()>,
        B: FnMut(&RecordId, &[u8]) -> MerkleResult<()>,
    {
        let pulled = self.pull_with(other, on_local)?;
        let pushed = self.push_with(other, on_remote)?;
        Ok(SyncReport { pulled, pushed })
    }
}

impl<F> Drop for MerkleDir<F> {
    fn drop(&mut self) {
        if self.depth > 0 {
            warn!(
                pending = self.pending.len(),
                "store dropped inside a transaction; lock left in place, run rollback"
            );
        }
    }
}
