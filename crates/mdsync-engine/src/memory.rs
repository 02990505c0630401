use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use mdsync_types::RecordId;

use crate::basic_io::quote;
use crate::engine::{Engine, KeyInfo, PacketSink};
use crate::error::{EngineError, EngineResult};

struct StoredRevision {
    text: String,
    branch: String,
    parent: Option<RecordId>,
    manifest: RecordId,
    files: BTreeMap<String, RecordId>,
    certs: Vec<Vec<u8>>,
}

/// In-process engine holding a small revision graph.
///
/// Intended for tests and embedding. Revisions are built with
/// [`MemoryEngine::commit`]; packets use the engine's textual layout but
/// carry content verbatim. Everything fed through [`Engine::feeder`] is
/// kept and visible through [`MemoryEngine::received`].
#[derive(Default)]
pub struct MemoryEngine {
    revisions: BTreeMap<RecordId, StoredRevision>,
    order: Vec<RecordId>,
    files: BTreeMap<RecordId, Vec<u8>>,
    manifests: BTreeMap<RecordId, String>,
    keys: Vec<KeyInfo>,
    signer: String,
    broken: HashSet<RecordId>,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryEngine {
    /// An empty engine whose commits are signed by `signer`.
    pub fn new(signer: &str) -> Self {
        let mut engine = Self {
            signer: signer.to_string(),
            ..Self::default()
        };
        engine.add_key(signer);
        engine
    }

    pub fn add_key(&mut self, name: &str) {
        if self.keys.iter().any(|k| k.name == name) {
            return;
        }
        self.keys.push(KeyInfo {
            name: name.to_string(),
            public_hash: Some(RecordId::derive("keyhash", &[name.as_bytes()]).to_hex()),
        });
    }

    /// Identifier the engine gives a file with this content.
    pub fn file_id(content: &[u8]) -> RecordId {
        RecordId::derive("file", &[content])
    }

    /// Record a revision on `branch` that writes `files` on top of
    /// `parent`'s tree, with a branch cert signed by the default signer.
    pub fn commit(&mut self, branch: &str, parent: Option<RecordId>, files: &[(&str, &[u8])]) -> RecordId {
        let old_files = parent
            .and_then(|p| self.revisions.get(&p))
            .map(|r| r.files.clone())
            .unwrap_or_default();
        let mut tree = old_files.clone();
        for (path, content) in files {
            let fid = Self::file_id(content);
            self.files.insert(fid, content.to_vec());
            tree.insert(path.to_string(), fid);
        }

        let manifest: String = tree
            .iter()
            .map(|(path, fid)| format!("file {} [{fid}]\n", quote(path)))
            .collect();
        let mid = RecordId::derive("manifest", &[manifest.as_bytes()]);
        self.manifests.insert(mid, manifest);

        let mut text = format!(
            "format_version \"1\"\n\nnew_manifest [{mid}]\n\nold_revision [{}]\n",
            parent.map(|p| p.to_hex()).unwrap_or_default()
        );
        for (path, fid) in &tree {
            match old_files.get(path) {
                None => text.push_str(&format!("\nadd_file {}\n content [{fid}]\n", quote(path))),
                Some(old) if old != fid => {
                    text.push_str(&format!("\npatch {}\n from [{old}]\n   to [{fid}]\n", quote(path)))
                }
                Some(_) => {}
            }
        }

        let rid = RecordId::derive("revision", &[text.as_bytes(), branch.as_bytes()]);
        if self.revisions.contains_key(&rid) {
            return rid;
        }
        let signer = self.signer.clone();
        self.revisions.insert(
            rid,
            StoredRevision {
                text,
                branch: branch.to_string(),
                parent,
                manifest: mid,
                files: tree,
                certs: Vec::new(),
            },
        );
        self.order.push(rid);
        self.add_cert(&rid, "branch", branch, &signer);
        rid
    }

    /// Attach another cert to an existing revision.
    pub fn add_cert(&mut self, revision: &RecordId, name: &str, value: &str, signer: &str) {
        self.add_key(signer);
        if let Some(stored) = self.revisions.get_mut(revision) {
            stored.certs.push(
                format!("[rcert {revision}\n       {name}\n       {value}\n       {signer}]\nc2lnbmF0dXJl\n[end]\n")
                    .into_bytes(),
            );
        }
    }

    /// Make the revision's packet come back as an engine error.
    pub fn corrupt(&mut self, revision: &RecordId) {
        self.broken.insert(*revision);
    }

    pub fn manifest_of(&self, revision: &RecordId) -> Option<RecordId> {
        self.revisions.get(revision).map(|r| r.manifest)
    }

    /// Packets fed into this engine so far.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().expect("lock poisoned").clone()
    }

    fn revision(&self, id: &RecordId) -> EngineResult<&StoredRevision> {
        self.revisions.get(id).ok_or_else(|| EngineError::Command {
            command: "get_revision".into(),
            message: format!("no such revision {id}"),
        })
    }

    fn file(&self, id: &RecordId) -> EngineResult<&[u8]> {
        self.files.get(id).map(Vec::as_slice).ok_or_else(|| EngineError::Command {
            command: "get_file".into(),
            message: format!("no such file {id}"),
        })
    }

    fn manifest(&self, id: &RecordId) -> EngineResult<&str> {
        self.manifests.get(id).map(String::as_str).ok_or_else(|| EngineError::Command {
            command: "get_manifest".into(),
            message: format!("no such manifest {id}"),
        })
    }
}

fn packet(header: String, body: &[u8]) -> Vec<u8> {
    let mut out = header.into_bytes();
    out.extend_from_slice(body);
    if !body.ends_with(b"\n") {
        out.push(b'\n');
    }
    out.extend_from_slice(b"[end]\n");
    out
}

impl Engine for MemoryEngine {
    fn get_revision(&mut self, id: &RecordId) -> EngineResult<String> {
        Ok(self.revision(id)?.text.clone())
    }

    fn revision_packet(&mut self, id: &RecordId) -> EngineResult<Vec<u8>> {
        let text = &self.revision(id)?.text;
        if self.broken.contains(id) {
            return Ok(format!("error: revision {id} is corrupt\n").into_bytes());
        }
        Ok(packet(format!("[rdata {id}]\n"), text.as_bytes()))
    }

    fn file_packet(&mut self, id: &RecordId) -> EngineResult<Vec<u8>> {
        Ok(packet(format!("[fdata {id}]\n"), self.file(id)?))
    }

    fn file_delta_packet(&mut self, old: &RecordId, new: &RecordId) -> EngineResult<Vec<u8>> {
        self.file(old)?;
        Ok(packet(format!("[fdelta {old}\n        {new}]\n"), self.file(new)?))
    }

    fn manifest_packet(&mut self, id: &RecordId) -> EngineResult<Vec<u8>> {
        Ok(packet(format!("[mdata {id}]\n"), self.manifest(id)?.as_bytes()))
    }

    fn manifest_delta_packet(&mut self, old: &RecordId, new: &RecordId) -> EngineResult<Vec<u8>> {
        self.manifest(old)?;
        Ok(packet(format!("[mdelta {old}\n        {new}]\n"), self.manifest(new)?.as_bytes()))
    }

    fn cert_packets(&mut self, revision: &RecordId) -> EngineResult<Vec<Vec<u8>>> {
        Ok(self.revision(revision)?.certs.clone())
    }

    fn pubkey_packet(&mut self, key: &str) -> EngineResult<Vec<u8>> {
        if !self.keys.iter().any(|k| k.name == key) {
            return Err(EngineError::Command {
                command: format!("pubkey {key}"),
                message: format!("no such key {key}"),
            });
        }
        Ok(packet(format!("[pubkey {key}]\n"), b"MIGdMA0GCSqGSIb3DQEBAQUAA4GLADCBhwKBgQ"))
    }

    fn toposort(&mut self, ids: &[RecordId]) -> EngineResult<Vec<RecordId>> {
        let wanted: HashSet<&RecordId> = ids.iter().collect();
        Ok(self.order.iter().filter(|id| wanted.contains(id)).copied().collect())
    }

    fn ancestors(&mut self, ids: &[RecordId]) -> EngineResult<Vec<RecordId>> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<RecordId> = ids.to_vec();
        while let Some(id) = stack.pop() {
            if let Some(parent) = self.revision(&id)?.parent {
                if seen.insert(parent) {
                    stack.push(parent);
                }
            }
        }
        Ok(seen.into_iter().collect())
    }

    fn heads(&mut self, branch: &str) -> EngineResult<Vec<RecordId>> {
        let on_branch: Vec<&RecordId> = self
            .order
            .iter()
            .filter(|id| self.revisions.get(*id).is_some_and(|r| r.branch == branch))
            .collect();
        let parents: HashSet<RecordId> = on_branch
            .iter()
            .filter_map(|id| self.revisions.get(*id).and_then(|r| r.parent))
            .collect();
        Ok(on_branch.into_iter().filter(|id| !parents.contains(*id)).copied().collect())
    }

    fn branches(&mut self) -> EngineResult<Vec<String>> {
        let branches: BTreeSet<&str> = self.revisions.values().map(|r| r.branch.as_str()).collect();
        Ok(branches.into_iter().map(str::to_string).collect())
    }

    fn select_all(&mut self) -> EngineResult<Vec<RecordId>> {
        Ok(self.order.clone())
    }

    fn keys(&mut self) -> EngineResult<Vec<KeyInfo>> {
        Ok(self.keys.clone())
    }

    fn feeder(&mut self) -> EngineResult<Box<dyn PacketSink>> {
        Ok(Box::new(MemorySink {
            received: Arc::clone(&self.received),
            written: 0,
        }))
    }
}

struct MemorySink {
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    written: u64,
}

impl PacketSink for MemorySink {
    fn write(&mut self, packet: &[u8]) -> EngineResult<()> {
        self.received.lock().expect("lock poisoned").push(packet.to_vec());
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> EngineResult<u64> {
        Ok(self.written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RevisionInfo;
    use crate::packet::{validate_packet, CertHeader};

    #[test]
    fn commits_describe_their_changes() {
        let mut engine = MemoryEngine::new("tester@example.com");
        let root = engine.commit("main", None, &[("a", b"one"), ("b", b"two")]);
        let child = engine.commit("main", Some(root), &[("a", b"uno"), ("c", b"three")]);

        let info = RevisionInfo::parse(&engine.get_revision(&child).unwrap()).unwrap();
        assert_eq!(info.parents, vec![root]);
        assert_eq!(info.added_files, vec![MemoryEngine::file_id(b"three")]);
        assert_eq!(
            info.patches,
            vec![(Some(MemoryEngine::file_id(b"one")), MemoryEngine::file_id(b"uno"))]
        );
        assert_eq!(info.new_manifest, engine.manifest_of(&child));
    }

    #[test]
    fn packets_are_well_formed() {
        let mut engine = MemoryEngine::new("tester@example.com");
        let root = engine.commit("main", None, &[("a", b"one")]);
        validate_packet(&engine.revision_packet(&root).unwrap(), "rdata").unwrap();
        validate_packet(&engine.file_packet(&MemoryEngine::file_id(b"one")).unwrap(), "fdata").unwrap();
        let certs = engine.cert_packets(&root).unwrap();
        assert_eq!(certs.len(), 1);
        assert_eq!(CertHeader::parse(&certs[0]).unwrap().key, "tester@example.com");
        validate_packet(&engine.pubkey_packet("tester@example.com").unwrap(), "pubkey").unwrap();
        assert!(engine.pubkey_packet("stranger").is_err());
    }

    #[test]
    fn graph_queries() {
        let mut engine = MemoryEngine::new("k");
        let a = engine.commit("main", None, &[("f", b"1")]);
        let b = engine.commit("main", Some(a), &[("f", b"2")]);
        let c = engine.commit("side", Some(b), &[("g", b"3")]);

        assert_eq!(engine.heads("main").unwrap(), vec![b]);
        assert_eq!(engine.heads("side").unwrap(), vec![c]);
        assert_eq!(engine.branches().unwrap(), vec!["main".to_string(), "side".to_string()]);
        let mut ancestors = engine.ancestors(&[c]).unwrap();
        ancestors.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ancestors, expected);
        assert_eq!(engine.toposort(&[c, a, b]).unwrap(), vec![a, b, c]);
    }

    #[test]
    fn corrupt_revision_answers_with_error_text() {
        let mut engine = MemoryEngine::new("k");
        let a = engine.commit("main", None, &[("f", b"1")]);
        engine.corrupt(&a);
        assert!(validate_packet(&engine.revision_packet(&a).unwrap(), "rdata").is_err());
    }

    #[test]
    fn feeder_records_packets() {
        let mut engine = MemoryEngine::new("k");
        let mut sink = engine.feeder().unwrap();
        sink.write(b"[fdata x]\n[end]\n").unwrap();
        assert_eq!(sink.finish().unwrap(), 1);
        assert_eq!(engine.received().len(), 1);
    }
}
