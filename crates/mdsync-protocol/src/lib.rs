//! Remote byte-store protocol for mdsync.
//!
//! A "byte store" is a dumb HTTP endpoint that exposes a flat namespace of
//! files with `list`, `stat`, `get`, ranged get, `put`, `append`, `delete`
//! and batched multi-file `put`/`get`. The server enforces a maximum request
//! body; [`ByteStoreClient`] hides that limit by splitting large writes into
//! a leading `put` plus trailing `append`s and by packing small writes into
//! a single `putmany`.
//!
//! The wire itself is abstracted behind [`Transport`]: [`HttpTransport`]
//! speaks HTTP through `ureq`, [`MemoryServer`] is an in-process server used
//! by tests and embedding.

pub mod client;
pub mod codec;
pub mod error;
pub mod http;
pub mod memory;
pub mod message;
pub mod transport;

pub use client::{ByteStoreClient, ClientConfig};
pub use error::{ProtocolError, ProtocolResult};
pub use http::HttpTransport;
pub use memory::MemoryServer;
pub use message::{FileStat, Request, Response, DEFAULT_MAX_POST};
pub use transport::Transport;
