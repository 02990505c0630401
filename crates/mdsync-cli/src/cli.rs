use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "mdsync",
    about = "Synchronize a version-control database through a dumb Merkle store",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Engine database
    #[arg(short, long, global = true)]
    pub db: Option<PathBuf>,

    /// Local transit directory; an in-memory store is used when absent
    #[arg(short, long, global = true)]
    pub local: Option<PathBuf>,

    /// Only export branches matching this glob
    #[arg(short, long, global = true)]
    pub branch: Option<String>,

    /// Engine executable
    #[arg(long, global = true)]
    pub mtn: Option<PathBuf>,

    /// SSH private key for sftp:// stores
    #[arg(long, global = true)]
    pub identity: Option<PathBuf>,

    /// SSH known-hosts file for sftp:// stores
    #[arg(long, global = true)]
    pub known_hosts: Option<PathBuf>,

    /// Proxy for http(s):// stores
    #[arg(long, global = true)]
    pub proxy: Option<String>,

    /// Configuration file (default: ~/.config/mdsync/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bring records from a store into the database
    Pull(StoreArgs),
    /// Send the database's records to a store
    Push(StoreArgs),
    /// Pull, then push
    Sync(StoreArgs),
    /// Create a store and push the database into it
    Clone(StoreArgs),
    /// Feed every record of a store into the database
    Import(StoreArgs),
    /// Clear the lock left by an interrupted writer
    Rollback(StoreArgs),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Pull(_) => "pull",
            Command::Push(_) => "push",
            Command::Sync(_) => "sync",
            Command::Clone(_) => "clone",
            Command::Import(_) => "import",
            Command::Rollback(_) => "rollback",
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Command::Pull(args)
            | Command::Push(args)
            | Command::Sync(args)
            | Command::Clone(args)
            | Command::Import(args)
            | Command::Rollback(args) => &args.url,
        }
    }
}

#[derive(Args, Debug)]
pub struct StoreArgs {
    /// Store location: a path, file://, sftp://, http(s):// or dws+http(s)://
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommand_and_globals() {
        let cli = Cli::try_parse_from([
            "mdsync", "push", "sftp://host/srv/store", "--db", "project.mtn", "-b", "net.example.*", "-vv",
        ])
        .unwrap();
        assert_eq!(cli.command.name(), "push");
        assert_eq!(cli.command.url(), "sftp://host/srv/store");
        assert_eq!(cli.global.db, Some(PathBuf::from("project.mtn")));
        assert_eq!(cli.global.branch.as_deref(), Some("net.example.*"));
        assert_eq!(cli.global.verbose, 2);
        assert_eq!(cli.global.format, OutputFormat::Text);
    }

    #[test]
    fn globals_may_precede_subcommand() {
        let cli = Cli::try_parse_from(["mdsync", "--format", "json", "-l", "/tmp/transit", "sync", "/srv/store"]).unwrap();
        assert_eq!(cli.global.format, OutputFormat::Json);
        assert_eq!(cli.global.local, Some(PathBuf::from("/tmp/transit")));
        assert_eq!(cli.command.name(), "sync");
    }

    #[test]
    fn url_is_required() {
        assert!(Cli::try_parse_from(["mdsync", "pull"]).is_err());
        assert!(Cli::try_parse_from(["mdsync", "frobnicate", "x"]).is_err());
    }
}
