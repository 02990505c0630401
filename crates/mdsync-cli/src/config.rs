//! Optional TOML configuration, overridden by command-line flags.
//!
//! ```toml
//! database = "/home/me/project.mtn"
//! branch_pattern = "net.example.*"
//!
//! [ssh]
//! identity_file = "/home/me/.ssh/id_ed25519"
//! port = 2222
//!
//! [http]
//! proxy = "http://proxy.example.com:3128"
//! timeout_secs = 60
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use mdsync_store::BackendOptions;
use serde::Deserialize;

use crate::cli::GlobalArgs;

pub const DEFAULT_EXECUTABLE: &str = "mtn";

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub database: Option<PathBuf>,
    pub local: Option<PathBuf>,
    pub branch_pattern: Option<String>,
    pub executable: Option<PathBuf>,
    pub ssh: SshConfig,
    pub http: HttpConfig,
    /// Request body limit of a remote byte-store server.
    pub max_post: Option<usize>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub identity_file: Option<PathBuf>,
    pub known_hosts: Option<PathBuf>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub proxy: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl SyncConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/mdsync/config.toml"))
    }

    /// The named config file, else the default one when present, with
    /// command-line flags applied on top.
    pub fn resolve(args: &GlobalArgs) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::load(&path)?,
                _ => Self::default(),
            },
        };
        config.apply(args);
        Ok(config)
    }

    pub fn apply(&mut self, args: &GlobalArgs) {
        fn set<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }
        set(&mut self.database, &args.db);
        set(&mut self.local, &args.local);
        set(&mut self.branch_pattern, &args.branch);
        set(&mut self.executable, &args.mtn);
        set(&mut self.ssh.identity_file, &args.identity);
        set(&mut self.ssh.known_hosts, &args.known_hosts);
        set(&mut self.http.proxy, &args.proxy);
    }

    pub fn executable(&self) -> PathBuf {
        self.executable
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EXECUTABLE))
    }

    pub fn database(&self) -> anyhow::Result<&Path> {
        self.database
            .as_deref()
            .context("no database given; pass --db or set `database` in the config file")
    }

    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            identity_file: self.ssh.identity_file.clone(),
            known_hosts: self.ssh.known_hosts.clone(),
            ssh_port: self.ssh.port,
            http_proxy: self.http.proxy.clone(),
            http_timeout: self.http.timeout_secs.map(Duration::from_secs),
            max_post: self.max_post,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_file() {
        let config = SyncConfig::from_toml(
            r#"
database = "/srv/project.mtn"
local = "/var/cache/mdsync"
branch_pattern = "net.example.*"
executable = "/usr/local/bin/mtn"
max_post = 65536

[ssh]
identity_file = "/home/me/.ssh/id_ed25519"
known_hosts = "/home/me/.ssh/known_hosts"
port = 2222

[http]
proxy = "http://proxy.example.com:3128"
timeout_secs = 30
"#,
        )
        .unwrap();
        assert_eq!(config.database, Some(PathBuf::from("/srv/project.mtn")));
        assert_eq!(config.ssh.port, Some(2222));
        assert_eq!(config.executable(), PathBuf::from("/usr/local/bin/mtn"));

        let options = config.backend_options();
        assert_eq!(options.ssh_port, Some(2222));
        assert_eq!(options.http_timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.max_post, Some(65536));
        assert_eq!(options.http_proxy.as_deref(), Some("http://proxy.example.com:3128"));
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config = SyncConfig::from_toml("").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.executable(), PathBuf::from(DEFAULT_EXECUTABLE));
        assert!(config.database().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(SyncConfig::from_toml("databse = \"typo.mtn\"\n").is_err());
        assert!(SyncConfig::from_toml("[ssh]\nkey = \"x\"\n").is_err());
    }

    #[test]
    fn flags_override_file_values() {
        let mut config = SyncConfig::from_toml("database = \"a.mtn\"\nbranch_pattern = \"x*\"\n").unwrap();
        let args = GlobalArgs {
            db: Some(PathBuf::from("b.mtn")),
            proxy: Some("http://p:1".into()),
            ..GlobalArgs::default()
        };
        config.apply(&args);
        assert_eq!(config.database().unwrap(), Path::new("b.mtn"));
        assert_eq!(config.branch_pattern.as_deref(), Some("x*"));
        assert_eq!(config.http.proxy.as_deref(), Some("http://p:1"));
    }

    #[test]
    fn resolve_reads_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mdsync.toml");
        std::fs::write(&path, "local = \"/tmp/transit\"\n").unwrap();
        let args = GlobalArgs {
            config: Some(path),
            ..GlobalArgs::default()
        };
        let config = SyncConfig::resolve(&args).unwrap();
        assert_eq!(config.local, Some(PathBuf::from("/tmp/transit")));

        let missing = GlobalArgs {
            config: Some(dir.path().join("absent.toml")),
            ..GlobalArgs::default()
        };
        assert!(SyncConfig::resolve(&missing).is_err());
    }
}
