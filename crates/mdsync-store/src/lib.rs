//! Storage backends for mdsync.
//!
//! A backend is a flat namespace of named byte files with just enough
//! capability for a dumb sync protocol: whole-file and ranged reads,
//! atomic replacement, appends, and an exclusive marker used as a lock.
//!
//! # Traits
//!
//! - [`ReadFs`] -- fetch, ranged fetch, existence
//! - [`WriteFs`] -- append, size, atomic put, marker create/remove, repair
//!
//! # Backends
//!
//! - [`LocalFs`] -- a local directory
//! - [`MemoryFs`] -- shared in-memory state, for staging and tests
//! - [`SftpFs`] -- a remote directory reached through the system `ssh`
//! - [`HttpFs`] -- read-only static files over HTTP(S)
//! - [`FtpFs`] -- read-only files on an FTP server
//! - [`RemoteFs`] -- a remote byte-store server
//!
//! [`Backend`] wraps them as one closed enum; [`open_readable`] and
//! [`open_writable`] pick the variant from a URL.

pub mod backend;
pub mod error;
pub mod ftp;
pub mod http;
pub mod local;
pub mod memory;
pub mod ranges;
pub mod remote;
pub mod sftp;
pub mod traits;

pub use backend::{open_readable, open_writable, Backend, BackendOptions};
pub use error::{StoreError, StoreResult};
pub use ftp::{FtpFs, FtpLocation};
pub use http::HttpFs;
pub use local::LocalFs;
pub use memory::MemoryFs;
pub use remote::RemoteFs;
pub use sftp::{SftpFs, SshTarget};
pub use traits::{AppendHandle, RangeStream, ReadFs, WriteFs};
