//! Engine to engine through a shared on-disk store.

use std::collections::BTreeSet;

use mdsync_engine::{export, feed_all, BranchPattern, Engine, MemoryEngine, PacketSink};
use mdsync_merkle::{MerkleDir, MerkleError};
use mdsync_store::{LocalFs, MemoryFs, WriteFs};

#[test]
fn revisions_travel_between_engines() {
    let remote_dir = tempfile::tempdir().unwrap();

    // First client: export into a staging store, push to the shared store.
    let mut alice = MemoryEngine::new("alice@example.com");
    let root = alice.commit("net.example.app", None, &[("README", b"hello")]);
    alice.commit("net.example.app", Some(root), &[("README", b"hello, world")]);
    let mut staging = MerkleDir::new(MemoryFs::new());
    let exported = export(&mut alice, &mut staging, None).unwrap();
    let mut remote = MerkleDir::new(LocalFs::new(remote_dir.path()));
    let pushed = staging.push(&mut remote).unwrap();
    assert_eq!(pushed.records, exported.records_added);

    // Second client: pull, feeding each new record into its engine.
    let mut bob = MemoryEngine::new("bob@example.com");
    let mut sink = bob.feeder().unwrap();
    let mut bob_staging = MerkleDir::new(MemoryFs::new());
    let pulled = bob_staging
        .pull_with(&mut remote, |_, data| {
            sink.write(data).map_err(|e| MerkleError::Callback(Box::new(e)))
        })
        .unwrap();
    assert_eq!(sink.finish().unwrap(), pulled.records);

    let sent: BTreeSet<Vec<u8>> = {
        let mut all = MerkleDir::new(LocalFs::new(remote_dir.path()));
        all.all_chunks().unwrap().map(|c| c.unwrap().1).collect()
    };
    let received: BTreeSet<Vec<u8>> = bob.received().into_iter().collect();
    assert_eq!(received, sent);
}

#[test]
fn branch_filtered_clone_then_full_reimport() {
    let remote_dir = tempfile::tempdir().unwrap();
    let mut alice = MemoryEngine::new("alice@example.com");
    alice.commit("net.example.app", None, &[("a", b"1")]);
    alice.commit("org.private", None, &[("secret", b"2")]);

    let pattern = BranchPattern::new("net.example.*").unwrap();
    let mut staging = MerkleDir::new(MemoryFs::new());
    export(&mut alice, &mut staging, Some(&pattern)).unwrap();
    let mut remote = MerkleDir::new(LocalFs::new(remote_dir.path()));
    remote.fs().ensure_dir_exists().unwrap();
    staging.push(&mut remote).unwrap();

    let mut bob = MemoryEngine::new("bob@example.com");
    let mut sink = bob.feeder().unwrap();
    let fed = feed_all(&mut remote, sink.as_mut()).unwrap();
    // rdata, mdata, fdata, cert, key
    assert_eq!(fed, 5);
    assert!(bob
        .received()
        .iter()
        .all(|p| !String::from_utf8_lossy(p).contains("secret")));
}
