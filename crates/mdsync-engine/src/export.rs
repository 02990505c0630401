use std::collections::{BTreeSet, HashMap, HashSet};

use mdsync_merkle::{MerkleDir, MerkleError};
use mdsync_store::WriteFs;
use mdsync_types::RecordId;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::{Engine, KeyInfo, RevisionInfo};
use crate::error::{EngineError, EngineResult};
use crate::packet::{validate_packet, CertHeader};
use crate::pattern::BranchPattern;

/// Counts from one export run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    /// Revisions newly written to the store.
    pub revisions: u64,
    /// Revisions skipped because the engine handed out a bad packet.
    pub revisions_failed: u64,
    /// Records added, keys included.
    pub records_added: u64,
    /// Records that were already present.
    pub records_skipped: u64,
    pub keys_added: u64,
}

/// One wire record of a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Piece {
    Manifest(RecordId),
    ManifestDelta(RecordId, RecordId),
    File(RecordId),
    FileDelta(RecordId, RecordId),
    Revision(RecordId),
}

impl Piece {
    fn id(&self) -> RecordId {
        match *self {
            Piece::Manifest(id) | Piece::File(id) | Piece::Revision(id) => id,
            Piece::ManifestDelta(old, new) => RecordId::derive("mdelta", &[old.as_bytes(), new.as_bytes()]),
            Piece::FileDelta(old, new) => RecordId::derive("fdelta", &[old.as_bytes(), new.as_bytes()]),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Piece::Manifest(_) => "mdata",
            Piece::ManifestDelta(..) => "mdelta",
            Piece::File(_) => "fdata",
            Piece::FileDelta(..) => "fdelta",
            Piece::Revision(_) => "rdata",
        }
    }

    fn fetch<E: Engine + ?Sized>(&self, engine: &mut E) -> EngineResult<Vec<u8>> {
        match self {
            Piece::Manifest(id) => engine.manifest_packet(id),
            Piece::ManifestDelta(old, new) => engine.manifest_delta_packet(old, new),
            Piece::File(id) => engine.file_packet(id),
            Piece::FileDelta(old, new) => engine.file_delta_packet(old, new),
            Piece::Revision(id) => engine.revision_packet(id),
        }
    }
}

/// Revisions to export, parents first: everything, or the heads of every
/// branch matching `pattern` together with their ancestors.
pub fn select_revisions<E: Engine + ?Sized>(
    engine: &mut E,
    pattern: Option<&BranchPattern>,
) -> EngineResult<Vec<RecordId>> {
    let selected = match pattern {
        None => engine.select_all()?,
        Some(pattern) => {
            let mut selected = BTreeSet::new();
            for branch in engine.branches()? {
                if !pattern.matches(&branch) {
                    continue;
                }
                let heads = engine.heads(&branch)?;
                debug!(%branch, heads = heads.len(), "branch selected");
                if heads.is_empty() {
                    continue;
                }
                selected.extend(engine.ancestors(&heads)?);
                selected.extend(heads);
            }
            selected.into_iter().collect()
        }
    };
    if selected.is_empty() {
        return Ok(selected);
    }
    engine.toposort(&selected)
}

/// Copy every selected revision, with its certs and signing keys, from the
/// engine into `store` in one transaction.
///
/// A revision whose packets fail validation is skipped and counted; any
/// other error rolls the transaction back. When the store is locked by
/// another writer the lock is left alone.
pub fn export<E, F>(
    engine: &mut E,
    store: &mut MerkleDir<F>,
    pattern: Option<&BranchPattern>,
) -> EngineResult<ExportReport>
where
    E: Engine + ?Sized,
    F: WriteFs,
{
    let revisions = select_revisions(engine, pattern)?;
    info!(revisions = revisions.len(), "exporting revisions");

    store.begin()?;
    match Exporter::new(engine, store).run(&revisions) {
        Ok(report) => {
            store.commit()?;
            info!(
                revisions = report.revisions,
                added = report.records_added,
                skipped = report.records_skipped,
                keys = report.keys_added,
                "export finished"
            );
            Ok(report)
        }
        Err(e) => {
            if let Err(rollback) = store.rollback() {
                warn!(error = %rollback, "rollback after failed export also failed");
            }
            Err(e)
        }
    }
}

struct Exporter<'a, E: ?Sized, F> {
    engine: &'a mut E,
    store: &'a mut MerkleDir<F>,
    known_keys: Option<HashMap<String, KeyInfo>>,
    exported_keys: HashSet<String>,
    report: ExportReport,
}

impl<'a, E, F> Exporter<'a, E, F>
where
    E: Engine + ?Sized,
    F: WriteFs,
{
    fn new(engine: &'a mut E, store: &'a mut MerkleDir<F>) -> Self {
        Self {
            engine,
            store,
            known_keys: None,
            exported_keys: HashSet::new(),
            report: ExportReport::default(),
        }
    }

    fn run(mut self, revisions: &[RecordId]) -> EngineResult<ExportReport> {
        for revision in revisions {
            match self.export_revision(revision) {
                Ok(()) => {}
                Err(EngineError::PacketValidation { expected, found }) => {
                    warn!(%revision, %expected, %found, "skipping revision with a bad packet");
                    self.report.revisions_failed += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(self.report)
    }

    fn export_revision(&mut self, revision: &RecordId) -> EngineResult<()> {
        if self.store.contains(revision)? {
            self.report.records_skipped += 1;
        } else {
            let pieces = self.pieces(revision)?;
            self.add_pieces(&pieces)?;
            self.report.revisions += 1;
            debug!(%revision, pieces = pieces.len(), "revision exported");
        }
        self.export_certs(revision)
    }

    /// Decompose a revision into its records, the revision itself last.
    fn pieces(&mut self, revision: &RecordId) -> EngineResult<Vec<Piece>> {
        let info = RevisionInfo::parse(&self.engine.get_revision(revision)?)?;
        let mut pieces = Vec::new();

        if let Some(manifest) = info.new_manifest {
            let old = match info.first_parent() {
                Some(parent) => RevisionInfo::parse(&self.engine.get_revision(parent)?)?.new_manifest,
                None => None,
            };
            match old {
                Some(old) if old == manifest => {}
                Some(old) => pieces.push(Piece::ManifestDelta(old, manifest)),
                None => pieces.push(Piece::Manifest(manifest)),
            }
        }
        pieces.extend(info.added_files.iter().copied().map(Piece::File));
        for (from, to) in &info.patches {
            pieces.push(match from {
                Some(from) => Piece::FileDelta(*from, *to),
                None => Piece::File(*to),
            });
        }
        pieces.push(Piece::Revision(*revision));
        Ok(pieces)
    }

    /// Fetch and check every missing piece before adding any of them, so a
    /// bad packet leaves nothing of the revision behind.
    fn add_pieces(&mut self, pieces: &[Piece]) -> EngineResult<()> {
        let mut seen = HashSet::new();
        let mut fetched = Vec::new();
        for piece in pieces {
            let id = piece.id();
            if !seen.insert(id) {
                continue;
            }
            if self.store.contains(&id)? {
                self.report.records_skipped += 1;
                continue;
            }
            let data = piece.fetch(&mut *self.engine)?;
            validate_packet(&data, piece.kind())?;
            fetched.push((id, data));
        }
        for (id, data) in fetched {
            self.store.add(id, &data)?;
            self.report.records_added += 1;
        }
        Ok(())
    }

    fn export_certs(&mut self, revision: &RecordId) -> EngineResult<()> {
        for cert in self.engine.cert_packets(revision)? {
            let id = RecordId::derive("cert", &[&cert]);
            if self.store.contains(&id)? {
                self.report.records_skipped += 1;
                continue;
            }
            validate_packet(&cert, "rcert")?;
            let header = CertHeader::parse(&cert)?;
            self.export_key(&header.key)?;
            self.store.add(id, &cert)?;
            self.report.records_added += 1;
        }
        Ok(())
    }

    /// Export a signing key the first time a cert needs it.
    fn export_key(&mut self, name: &str) -> EngineResult<()> {
        if self.exported_keys.contains(name) {
            return Ok(());
        }
        let info = self.key_info(name)?;
        let id = info.record_id();
        if self.store.contains(&id)? {
            self.report.records_skipped += 1;
        } else {
            let packet = self.engine.pubkey_packet(name)?;
            validate_packet(&packet, "pubkey")?;
            self.store.add(id, &packet)?;
            self.report.records_added += 1;
            self.report.keys_added += 1;
            debug!(key = name, "key exported");
        }
        self.exported_keys.insert(name.to_string());
        Ok(())
    }

    fn key_info(&mut self, name: &str) -> EngineResult<KeyInfo> {
        if self.known_keys.is_none() {
            let keys = self.engine.keys()?;
            self.known_keys = Some(keys.into_iter().map(|k| (k.name.clone(), k)).collect());
        }
        let known = self.known_keys.as_ref().and_then(|keys| keys.get(name)).cloned();
        Ok(known.unwrap_or_else(|| {
            debug!(key = name, "signing key missing from the key listing");
            KeyInfo {
                name: name.to_string(),
                public_hash: None,
            }
        }))
    }
}

/// True when an export failed only because another writer holds the lock.
pub fn is_locked(error: &EngineError) -> bool {
    matches!(error, EngineError::Merkle(MerkleError::Locked(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryEngine;
    use mdsync_store::MemoryFs;

    const SIGNER: &str = "tester@example.com";

    fn store() -> MerkleDir<MemoryFs> {
        MerkleDir::new(MemoryFs::new())
    }

    /// Root with two files, then a child patching one and adding another.
    fn history(engine: &mut MemoryEngine) -> (RecordId, RecordId) {
        let root = engine.commit("net.example.app", None, &[("a.txt", b"one"), ("b.txt", b"two")]);
        let child = engine.commit(
            "net.example.app",
            Some(root),
            &[("a.txt", b"one changed"), ("c.txt", b"three")],
        );
        (root, child)
    }

    // -----------------------------------------------------------------------
    // Decomposition
    // -----------------------------------------------------------------------

    #[test]
    fn exports_every_record_of_a_linear_history() {
        let mut engine = MemoryEngine::new(SIGNER);
        let (root, child) = history(&mut engine);
        let mut store = store();

        let report = export(&mut engine, &mut store, None).unwrap();
        // root: mdata, 2 fdata, rdata; child: mdelta, fdelta, fdata, rdata;
        // 2 certs and 1 key.
        assert_eq!(report.revisions, 2);
        assert_eq!(report.records_added, 11);
        assert_eq!(report.keys_added, 1);
        assert_eq!(report.revisions_failed, 0);

        let root_manifest = engine.manifest_of(&root).unwrap();
        let child_manifest = engine.manifest_of(&child).unwrap();
        let fdelta = Piece::FileDelta(MemoryEngine::file_id(b"one"), MemoryEngine::file_id(b"one changed"));
        for id in [
            root,
            child,
            root_manifest,
            Piece::ManifestDelta(root_manifest, child_manifest).id(),
            fdelta.id(),
            MemoryEngine::file_id(b"three"),
        ] {
            assert!(store.contains(&id).unwrap(), "missing {id}");
        }
        assert!(!store.contains(&child_manifest).unwrap());
        assert!(!store.in_transaction());
    }

    #[test]
    fn report_serializes_for_json_output() {
        let report = ExportReport {
            revisions: 2,
            records_added: 11,
            ..ExportReport::default()
        };
        let json = serde_json::to_value(report).unwrap();
        assert_eq!(json["revisions"], 2);
        assert_eq!(json["records_added"], 11);
        assert_eq!(json["keys_added"], 0);
    }

    #[test]
    fn identical_files_in_one_revision_are_stored_once() {
        let mut engine = MemoryEngine::new(SIGNER);
        engine.commit("main", None, &[("a", b"same"), ("b", b"same")]);
        let mut store = store();
        let report = export(&mut engine, &mut store, None).unwrap();
        // mdata, fdata, rdata, cert, key
        assert_eq!(report.records_added, 5);
    }

    // -----------------------------------------------------------------------
    // Incremental runs
    // -----------------------------------------------------------------------

    #[test]
    fn second_export_adds_nothing() {
        let mut engine = MemoryEngine::new(SIGNER);
        history(&mut engine);
        let mut store = store();
        export(&mut engine, &mut store, None).unwrap();

        let report = export(&mut engine, &mut store, None).unwrap();
        assert_eq!(report.revisions, 0);
        assert_eq!(report.records_added, 0);
        // Two revisions and their two certs.
        assert_eq!(report.records_skipped, 4);
    }

    #[test]
    fn new_child_exports_only_its_records() {
        let mut engine = MemoryEngine::new(SIGNER);
        let (_, child) = history(&mut engine);
        let mut store = store();
        export(&mut engine, &mut store, None).unwrap();

        engine.commit("net.example.app", Some(child), &[("b.txt", b"two changed")]);
        let report = export(&mut engine, &mut store, None).unwrap();
        // mdelta, fdelta, rdata, cert; the key is already stored.
        assert_eq!(report.revisions, 1);
        assert_eq!(report.records_added, 4);
        assert_eq!(report.keys_added, 0);
    }

    #[test]
    fn later_cert_brings_its_signing_key() {
        let mut engine = MemoryEngine::new(SIGNER);
        let (root, _) = history(&mut engine);
        let mut store = store();
        export(&mut engine, &mut store, None).unwrap();

        engine.add_cert(&root, "tag", "v1.0", "release@example.com");
        engine.add_cert(&root, "testresult", "1", "release@example.com");
        let report = export(&mut engine, &mut store, None).unwrap();
        assert_eq!(report.records_added, 3);
        assert_eq!(report.keys_added, 1);
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    #[test]
    fn branch_pattern_limits_the_export() {
        let mut engine = MemoryEngine::new(SIGNER);
        let (root, child) = history(&mut engine);
        let other = engine.commit("org.other", None, &[("x", b"elsewhere")]);

        let pattern = BranchPattern::new("net.example.*").unwrap();
        assert_eq!(select_revisions(&mut engine, Some(&pattern)).unwrap(), vec![root, child]);
        let mut store = store();
        export(&mut engine, &mut store, Some(&pattern)).unwrap();
        assert!(store.contains(&child).unwrap());
        assert!(!store.contains(&other).unwrap());
    }

    #[test]
    fn pattern_matching_nothing_exports_nothing() {
        let mut engine = MemoryEngine::new(SIGNER);
        history(&mut engine);
        let pattern = BranchPattern::new("nope.*").unwrap();
        let mut store = store();
        let report = export(&mut engine, &mut store, Some(&pattern)).unwrap();
        assert_eq!(report, ExportReport::default());
    }

    #[test]
    fn branch_ancestors_on_other_branches_are_included() {
        let mut engine = MemoryEngine::new(SIGNER);
        let base = engine.commit("trunk", None, &[("f", b"1")]);
        let feature = engine.commit("feature", Some(base), &[("f", b"2")]);
        let pattern = BranchPattern::new("feature").unwrap();
        assert_eq!(select_revisions(&mut engine, Some(&pattern)).unwrap(), vec![base, feature]);
    }

    // -----------------------------------------------------------------------
    // Failures
    // -----------------------------------------------------------------------

    #[test]
    fn bad_packet_skips_only_that_revision() {
        let mut engine = MemoryEngine::new(SIGNER);
        let (root, child) = history(&mut engine);
        engine.corrupt(&child);
        let mut store = store();

        let report = export(&mut engine, &mut store, None).unwrap();
        assert_eq!(report.revisions, 1);
        assert_eq!(report.revisions_failed, 1);
        assert!(store.contains(&root).unwrap());
        assert!(!store.contains(&child).unwrap());
        // Nothing of the bad revision was written.
        assert!(!store.contains(&MemoryEngine::file_id(b"three")).unwrap());
    }

    #[test]
    fn locked_store_is_left_locked() {
        let fs = MemoryFs::new();
        let mut holder = MerkleDir::new(fs.clone());
        holder.begin().unwrap();

        let mut engine = MemoryEngine::new(SIGNER);
        history(&mut engine);
        let mut store = MerkleDir::new(fs);
        let err = export(&mut engine, &mut store, None).unwrap_err();
        assert!(is_locked(&err));

        holder.add(RecordId::derive("test", &[b"x"]), b"x").unwrap();
        holder.commit().unwrap();
    }

    #[test]
    fn engine_failure_rolls_back() {
        let mut engine = MemoryEngine::new(SIGNER);
        let root = engine.commit("main", None, &[("f", b"1")]);
        let mut store = store();
        let fs = store.fs().clone();

        let mut failing = KeylessEngine(engine);
        let err = export(&mut failing, &mut store, None).unwrap_err();
        assert!(matches!(err, EngineError::Command { .. }));
        assert!(!store.in_transaction());
        assert!(!store.contains(&root).unwrap());
        let mut fresh = MerkleDir::new(fs);
        fresh.begin().unwrap();
        fresh.rollback().unwrap();
    }

    /// Delegates to a memory engine but refuses every key export.
    struct KeylessEngine(MemoryEngine);

    impl Engine for KeylessEngine {
        fn get_revision(&mut self, id: &RecordId) -> EngineResult<String> {
            self.0.get_revision(id)
        }
        fn revision_packet(&mut self, id: &RecordId) -> EngineResult<Vec<u8>> {
            self.0.revision_packet(id)
        }
        fn file_packet(&mut self, id: &RecordId) -> EngineResult<Vec<u8>> {
            self.0.file_packet(id)
        }
        fn file_delta_packet(&mut self, old: &RecordId, new: &RecordId) -> EngineResult<Vec<u8>> {
            self.0.file_delta_packet(old, new)
        }
        fn manifest_packet(&mut self, id: &RecordId) -> EngineResult<Vec<u8>> {
            self.0.manifest_packet(id)
        }
        fn manifest_delta_packet(&mut self, old: &RecordId, new: &RecordId) -> EngineResult<Vec<u8>> {
            self.0.manifest_delta_packet(old, new)
        }
        fn cert_packets(&mut self, revision: &RecordId) -> EngineResult<Vec<Vec<u8>>> {
            self.0.cert_packets(revision)
        }
        fn pubkey_packet(&mut self, key: &str) -> EngineResult<Vec<u8>> {
            Err(EngineError::Command {
                command: format!("pubkey {key}"),
                message: "keystore unavailable".into(),
            })
        }
        fn toposort(&mut self, ids: &[RecordId]) -> EngineResult<Vec<RecordId>> {
            self.0.toposort(ids)
        }
        fn ancestors(&mut self, ids: &[RecordId]) -> EngineResult<Vec<RecordId>> {
            self.0.ancestors(ids)
        }
        fn heads(&mut self, branch: &str) -> EngineResult<Vec<RecordId>> {
            self.0.heads(branch)
        }
        fn branches(&mut self) -> EngineResult<Vec<String>> {
            self.0.branches()
        }
        fn select_all(&mut self) -> EngineResult<Vec<RecordId>> {
            self.0.select_all()
        }
        fn keys(&mut self) -> EngineResult<Vec<crate::engine::KeyInfo>> {
            self.0.keys()
        }
        fn feeder(&mut self) -> EngineResult<Box<dyn crate::engine::PacketSink>> {
            self.0.feeder()
        }
    }
}
