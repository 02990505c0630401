use mdsync_merkle::MerkleDir;
use mdsync_store::ReadFs;
use tracing::{debug, info};

use crate::engine::{Engine, PacketSink};
use crate::error::EngineResult;

/// Feed every record of `store` into the engine, in storage order.
///
/// Storage order is not topological; the engine's bulk ingestion holds
/// records back until what they depend on has arrived.
pub fn import<E, F>(store: &mut MerkleDir<F>, engine: &mut E) -> EngineResult<u64>
where
    E: Engine + ?Sized,
    F: ReadFs,
{
    let mut sink = engine.feeder()?;
    feed_all(store, sink.as_mut())
}

/// Stream every record of `store` into an already open sink and close it.
pub fn feed_all<F: ReadFs>(store: &mut MerkleDir<F>, sink: &mut dyn PacketSink) -> EngineResult<u64> {
    for chunk in store.all_chunks()? {
        let (id, data) = chunk?;
        debug!(%id, bytes = data.len(), "feeding record");
        sink.write(&data)?;
    }
    let fed = sink.finish()?;
    info!(records = fed, "import finished");
    Ok(fed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::export;
    use crate::memory::MemoryEngine;
    use crate::packet::validate_packet;
    use mdsync_store::MemoryFs;

    #[test]
    fn every_stored_record_reaches_the_engine() {
        let mut source = MemoryEngine::new("tester@example.com");
        let root = source.commit("main", None, &[("a", b"alpha")]);
        source.commit("main", Some(root), &[("a", b"beta"), ("b", b"gamma")]);
        let mut store = MerkleDir::new(MemoryFs::new());
        let exported = export(&mut source, &mut store, None).unwrap();

        let mut target = MemoryEngine::new("other@example.com");
        let fed = import(&mut store, &mut target).unwrap();
        assert_eq!(fed, exported.records_added);

        let received = target.received();
        assert_eq!(received.len() as u64, fed);
        let revisions = received
            .iter()
            .filter(|p| validate_packet(p, "rdata").is_ok())
            .count();
        assert_eq!(revisions, 2);
    }

    #[test]
    fn empty_store_feeds_nothing() {
        let mut store = MerkleDir::new(MemoryFs::new());
        let mut target = MemoryEngine::new("k");
        assert_eq!(import(&mut store, &mut target).unwrap(), 0);
        assert!(target.received().is_empty());
    }
}
