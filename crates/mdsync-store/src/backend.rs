use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use mdsync_protocol::{ByteStoreClient, ClientConfig, HttpTransport, Transport};
use mdsync_types::ByteRange;
use tracing::{debug, warn};
use url::Url;

use crate::error::{StoreError, StoreResult};
use crate::ftp::{FtpFs, FtpLocation};
use crate::http::HttpFs;
use crate::local::LocalFs;
use crate::memory::MemoryFs;
use crate::remote::RemoteFs;
use crate::sftp::{SftpFs, SshTarget};
use crate::traits::{AppendHandle, RangeStream, ReadFs, WriteFs};

/// Settings that apply to whichever backend a URL selects.
#[derive(Clone, Debug, Default)]
pub struct BackendOptions {
    pub identity_file: Option<PathBuf>,
    pub known_hosts: Option<PathBuf>,
    /// SSH port when the URL does not name one.
    pub ssh_port: Option<u16>,
    pub http_proxy: Option<String>,
    pub http_timeout: Option<Duration>,
    /// Request body limit of a remote byte-store server.
    pub max_post: Option<usize>,
}

/// The closed set of storage backends.
#[derive(Clone, Debug)]
pub enum Backend {
    Local(LocalFs),
    Memory(MemoryFs),
    Sftp(SftpFs),
    Http(HttpFs),
    Ftp(FtpFs),
    RemoteByteStore(RemoteFs),
}

impl Backend {
    pub fn is_writable(&self) -> bool {
        !matches!(self, Backend::Http(_) | Backend::Ftp(_))
    }

    fn read_only(&self) -> StoreError {
        StoreError::ReadOnly(self.describe())
    }

    fn as_read(&self) -> &dyn ReadFs {
        match self {
            Backend::Local(fs) => fs,
            Backend::Memory(fs) => fs,
            Backend::Sftp(fs) => fs,
            Backend::Http(fs) => fs,
            Backend::Ftp(fs) => fs,
            Backend::RemoteByteStore(fs) => fs,
        }
    }

    fn as_write(&self) -> StoreResult<&dyn WriteFs> {
        match self {
            Backend::Local(fs) => Ok(fs),
            Backend::Memory(fs) => Ok(fs),
            Backend::Sftp(fs) => Ok(fs),
            Backend::RemoteByteStore(fs) => Ok(fs),
            Backend::Http(_) | Backend::Ftp(_) => Err(self.read_only()),
        }
    }
}

impl ReadFs for Backend {
    fn fetch(&self, names: &[String]) -> StoreResult<BTreeMap<String, Option<Vec<u8>>>> {
        self.as_read().fetch(names)
    }

    fn fetch_ranges<'a>(&'a self, name: &str, ranges: &[ByteRange]) -> StoreResult<RangeStream<'a>> {
        self.as_read().fetch_ranges(name, ranges)
    }

    fn exists(&self, name: &str) -> StoreResult<bool> {
        self.as_read().exists(name)
    }

    fn describe(&self) -> String {
        self.as_read().describe()
    }
}

impl WriteFs for Backend {
    fn open_append(&self, name: &str) -> StoreResult<Box<dyn AppendHandle>> {
        self.as_write()?.open_append(name)
    }

    fn size(&self, name: &str) -> StoreResult<u64> {
        self.as_write()?.size(name)
    }

    fn put(&self, files: &[(String, Vec<u8>)]) -> StoreResult<()> {
        self.as_write()?.put(files)
    }

    fn rollback_interrupted_puts(&self, names: &[String]) -> StoreResult<()> {
        self.as_write()?.rollback_interrupted_puts(names)
    }

    fn mkdir(&self, name: &str) -> StoreResult<bool> {
        self.as_write()?.mkdir(name)
    }

    fn rmdir(&self, name: &str) -> StoreResult<()> {
        self.as_write()?.rmdir(name)
    }

    fn ensure_dir_exists(&self) -> StoreResult<()> {
        self.as_write()?.ensure_dir_exists()
    }
}

fn invalid(url: &str, reason: impl Into<String>) -> StoreError {
    StoreError::InvalidUrl {
        url: url.to_string(),
        reason: reason.into(),
    }
}

/// Open a backend for reading.
///
/// Accepted locations:
/// - a plain path or `file://` URL: a local directory;
/// - `sftp://[user@]host[:port]/path` (or `ssh://`): a directory reached
///   over ssh; a path starting with `/~/` is relative to the remote home;
/// - `http://` / `https://`: a read-only directory of static files;
/// - `ftp://[user[:password]@]host[:port]/dir`: a read-only directory on
///   an FTP server, anonymous unless the URL names a user;
/// - `dws+http://host/script#prefix` / `dws+https://...`: a remote byte
///   store; the fragment, if any, prefixes every file name.
pub fn open_readable(location: &str, options: &BackendOptions) -> StoreResult<Backend> {
    let Some((scheme, _)) = location.split_once("://") else {
        return Ok(Backend::Local(LocalFs::new(location)));
    };
    let scheme = scheme.to_ascii_lowercase();
    debug!(location, %scheme, "opening backend");
    match scheme.as_str() {
        "file" => {
            let url = Url::parse(location).map_err(|e| invalid(location, e.to_string()))?;
            let path = url
                .to_file_path()
                .map_err(|()| invalid(location, "not a local path"))?;
            Ok(Backend::Local(LocalFs::new(path)))
        }
        "sftp" | "ssh" => open_sftp(location, options),
        "http" | "https" => {
            let agent = build_agent(options)?;
            Ok(Backend::Http(HttpFs::new(agent, location)))
        }
        "ftp" => {
            if options.http_proxy.is_some() {
                warn!(location, "the HTTP proxy is not used for ftp:// locations");
            }
            let location = FtpLocation::parse(location)?;
            Ok(Backend::Ftp(FtpFs::new(location, options.http_timeout)))
        }
        "dws+http" | "dws+https" => open_remote(location, options),
        other => Err(StoreError::UnsupportedScheme(other.to_string())),
    }
}

/// Open a backend for writing. Read-only locations are refused up front.
pub fn open_writable(location: &str, options: &BackendOptions) -> StoreResult<Backend> {
    let backend = open_readable(location, options)?;
    if !backend.is_writable() {
        return Err(backend.read_only());
    }
    Ok(backend)
}

fn build_agent(options: &BackendOptions) -> StoreResult<ureq::Agent> {
    Ok(HttpTransport::build_agent(
        options.http_proxy.as_deref(),
        options.http_timeout,
    )?)
}

fn open_sftp(location: &str, options: &BackendOptions) -> StoreResult<Backend> {
    let url = Url::parse(location).map_err(|e| invalid(location, e.to_string()))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid(location, "missing host"))?;
    if url.password().is_some() {
        warn!(host, "passwords in sftp URLs are ignored; use a key or ssh-agent");
    }

    let mut target = SshTarget::new(host);
    if !url.username().is_empty() {
        target.user = Some(url.username().to_string());
    }
    target.port = url.port().or(options.ssh_port);
    target.identity_file = options.identity_file.clone();
    target.known_hosts = options.known_hosts.clone();

    let path = url.path();
    let dir = match path.strip_prefix("/~/") {
        Some(relative) => relative.to_string(),
        None if path == "/~" => String::new(),
        None => path.to_string(),
    };
    Ok(Backend::Sftp(SftpFs::new(target, dir)))
}

fn open_remote(location: &str, options: &BackendOptions) -> StoreResult<Backend> {
    let inner = &location["dws+".len()..];
    let (script, prefix) = match inner.split_once('#') {
        Some((script, prefix)) => (script, prefix),
        None => (inner, ""),
    };
    Url::parse(script).map_err(|e| invalid(location, e.to_string()))?;

    let mut http = HttpTransport::with_agent(build_agent(options)?, script, prefix);
    let mut config = ClientConfig::default();
    if let Some(max) = options.max_post {
        http = http.with_max_body(max);
        config.max_post = max;
    }
    let transport: Box<dyn Transport> = Box::new(http);
    let client = ByteStoreClient::with_config(transport, config);
    Ok(Backend::RemoteByteStore(RemoteFs::new(client, location)))
}
