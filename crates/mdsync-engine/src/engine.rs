use mdsync_types::RecordId;
use serde::Serialize;

use crate::basic_io;
use crate::error::{EngineError, EngineResult};

/// Client view of the external version-control engine.
///
/// Packet getters return the engine's raw answer; callers check it with
/// [`crate::validate_packet`] before storing it.
pub trait Engine {
    /// The revision descriptor in basic I/O form.
    fn get_revision(&mut self, id: &RecordId) -> EngineResult<String>;
    fn revision_packet(&mut self, id: &RecordId) -> EngineResult<Vec<u8>>;
    fn file_packet(&mut self, id: &RecordId) -> EngineResult<Vec<u8>>;
    fn file_delta_packet(&mut self, old: &RecordId, new: &RecordId) -> EngineResult<Vec<u8>>;
    fn manifest_packet(&mut self, id: &RecordId) -> EngineResult<Vec<u8>>;
    fn manifest_delta_packet(&mut self, old: &RecordId, new: &RecordId) -> EngineResult<Vec<u8>>;
    /// Every cert attached to a revision, one packet each.
    fn cert_packets(&mut self, revision: &RecordId) -> EngineResult<Vec<Vec<u8>>>;
    fn pubkey_packet(&mut self, key: &str) -> EngineResult<Vec<u8>>;
    /// Sort `ids` so that parents come before children.
    fn toposort(&mut self, ids: &[RecordId]) -> EngineResult<Vec<RecordId>>;
    /// Every proper ancestor of `ids`.
    fn ancestors(&mut self, ids: &[RecordId]) -> EngineResult<Vec<RecordId>>;
    fn heads(&mut self, branch: &str) -> EngineResult<Vec<RecordId>>;
    fn branches(&mut self) -> EngineResult<Vec<String>>;
    fn select_all(&mut self) -> EngineResult<Vec<RecordId>>;
    fn keys(&mut self) -> EngineResult<Vec<KeyInfo>>;
    /// Open the bulk ingestion channel.
    fn feeder(&mut self) -> EngineResult<Box<dyn PacketSink>>;
}

/// Bulk ingestion into the engine. Records may arrive in any order; the
/// engine buffers them until their dependencies resolve.
pub trait PacketSink {
    fn write(&mut self, packet: &[u8]) -> EngineResult<()>;

    /// Close the channel and wait for the engine to finish. Returns the
    /// number of packets written.
    fn finish(&mut self) -> EngineResult<u64>;
}

/// One entry of the engine's key listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub name: String,
    pub public_hash: Option<String>,
}

impl KeyInfo {
    /// Parse the `keys` listing: one stanza per key.
    pub fn parse_listing(text: &str) -> EngineResult<Vec<KeyInfo>> {
        let mut keys = Vec::new();
        for stanza in basic_io::parse(text)? {
            let Some(name) = stanza
                .first_value("name")
                .or_else(|| stanza.first_value("given_name"))
            else {
                continue;
            };
            let public_hash = stanza
                .first_value("public_hash")
                .or_else(|| stanza.first_value("hash"))
                .map(|v| v.as_str().to_string());
            keys.push(KeyInfo {
                name: name.as_str().to_string(),
                public_hash,
            });
        }
        Ok(keys)
    }

    /// Identifier of this key's public-key record.
    pub fn record_id(&self) -> RecordId {
        match &self.public_hash {
            Some(hash) => RecordId::derive("pubkey", &[self.name.as_bytes(), hash.as_bytes()]),
            None => RecordId::derive("pubkey", &[self.name.as_bytes()]),
        }
    }
}

/// What a revision descriptor says about its content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionInfo {
    pub new_manifest: Option<RecordId>,
    pub parents: Vec<RecordId>,
    pub added_files: Vec<RecordId>,
    /// `(from, to)` content pairs; `from` is `None` when the old content is
    /// unknown and the new one must be sent in full.
    pub patches: Vec<(Option<RecordId>, RecordId)>,
}

impl RevisionInfo {
    pub fn parse(text: &str) -> EngineResult<Self> {
        let mut info = RevisionInfo::default();
        for stanza in basic_io::parse(text)? {
            match stanza.kind() {
                "new_manifest" => info.new_manifest = stanza.id("new_manifest")?,
                "old_revision" => info.parents.extend(stanza.id("old_revision")?),
                "add_file" => {
                    if let Some(content) = stanza.id("content")? {
                        info.added_files.push(content);
                    }
                }
                "patch" => {
                    let to = stanza.id("to")?.ok_or_else(|| {
                        EngineError::BasicIo("patch stanza without a `to` identifier".into())
                    })?;
                    info.patches.push((stanza.id("from")?, to));
                }
                _ => {}
            }
        }
        Ok(info)
    }

    pub fn first_parent(&self) -> Option<&RecordId> {
        self.parents.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(c: char) -> String {
        c.to_string().repeat(40)
    }

    #[test]
    fn revision_with_parent_and_changes() {
        let text = format!(
            "format_version \"1\"\n\nnew_manifest [{}]\n\nold_revision [{}]\n\nadd_file \"new.txt\"\n content [{}]\n\npatch \"old.txt\"\n from [{}]\n   to [{}]\n\ndelete \"gone.txt\"\n",
            id('a'), id('b'), id('c'), id('d'), id('e')
        );
        let info = RevisionInfo::parse(&text).unwrap();
        assert_eq!(info.new_manifest.unwrap().to_hex(), id('a'));
        assert_eq!(info.first_parent().unwrap().to_hex(), id('b'));
        assert_eq!(info.added_files.len(), 1);
        assert_eq!(info.added_files[0].to_hex(), id('c'));
        let (from, to) = &info.patches[0];
        assert_eq!(from.unwrap().to_hex(), id('d'));
        assert_eq!(to.to_hex(), id('e'));
    }

    #[test]
    fn root_revision_has_no_parent() {
        let text = format!("new_manifest [{}]\n\nold_revision []\n", id('a'));
        let info = RevisionInfo::parse(&text).unwrap();
        assert!(info.parents.is_empty());
        assert!(info.first_parent().is_none());
    }

    #[test]
    fn merge_lists_both_parents() {
        let text = format!("old_revision [{}]\n\nold_revision [{}]\n", id('1'), id('2'));
        assert_eq!(RevisionInfo::parse(&text).unwrap().parents.len(), 2);
    }

    #[test]
    fn key_listing() {
        let text = format!(
            "             name \"tester@example.com\"\n      public_hash [{}]\n     private_hash [{}]\n  public_location \"database\" \"keystore\"\n\n             name \"other@example.com\"\n      public_hash [{}]\n",
            id('f'), id('f'), id('0')
        );
        let keys = KeyInfo::parse_listing(&text).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].name, "tester@example.com");
        assert_eq!(keys[0].public_hash.as_deref(), Some(id('f').as_str()));
        assert_ne!(keys[0].record_id(), keys[1].record_id());
    }

    #[test]
    fn key_record_id_depends_on_hash() {
        let bare = KeyInfo { name: "k".into(), public_hash: None };
        let hashed = KeyInfo { name: "k".into(), public_hash: Some(id('1')) };
        assert_ne!(bare.record_id(), hashed.record_id());
    }
}
