//! # mdsync-engine
//!
//! Moves revisions between a version-control engine and a Merkle store.
//!
//! - [`MtnClient`] drives a `mtn`-compatible binary over `automate stdio`
//!   and feeds packets back through `read`.
//! - [`export`] walks the revision graph parents-first and adds each
//!   revision's wire records, its certs and their signing keys.
//! - [`import`] streams a store's records into the engine.
//! - [`MemoryEngine`] is an in-process engine for tests and embedding.

pub mod basic_io;
pub mod engine;
pub mod error;
pub mod export;
pub mod import;
pub mod memory;
pub mod mtn;
pub mod packet;
pub mod pattern;
pub mod stdio;

pub use engine::{Engine, KeyInfo, PacketSink, RevisionInfo};
pub use error::{EngineError, EngineResult};
pub use export::{export, is_locked, select_revisions, ExportReport};
pub use import::{feed_all, import};
pub use memory::MemoryEngine;
pub use mtn::{MtnClient, MtnFeeder};
pub use packet::{split_packets, validate_packet, CertHeader};
pub use pattern::BranchPattern;
