use anyhow::Context;
use colored::Colorize;
use mdsync_engine::{export, import, is_locked, BranchPattern, Engine, EngineError, ExportReport, MtnClient};
use mdsync_merkle::{MerkleDir, MerkleError, TransferReport};
use mdsync_store::{open_readable, open_writable, Backend, LocalFs, MemoryFs, WriteFs};
use serde::Serialize;
use tracing::info;

use crate::cli::{Cli, Command, OutputFormat};
use crate::config::SyncConfig;

/// What a command did, printed as text or JSON.
#[derive(Debug, Default, Serialize)]
pub struct Summary {
    pub command: &'static str,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exported: Option<ExportReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pulled: Option<TransferReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pushed: Option<TransferReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imported: Option<u64>,
}

impl Summary {
    fn new(command: &'static str, url: &str) -> Self {
        Self {
            command,
            url: url.to_string(),
            ..Self::default()
        }
    }

    fn print(&self, format: OutputFormat) -> anyhow::Result<()> {
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(self)?),
            OutputFormat::Text => self.print_text(),
        }
        Ok(())
    }

    fn print_text(&self) {
        let url = self.url.bold();
        if let Some(exported) = &self.exported {
            println!(
                "  exported {} revisions ({} new records, {} keys)",
                exported.revisions.to_string().cyan(),
                exported.records_added,
                exported.keys_added
            );
            if exported.revisions_failed > 0 {
                println!(
                    "  {} {} revisions skipped over bad packets",
                    "warning:".yellow().bold(),
                    exported.revisions_failed
                );
            }
        }
        if let Some(pulled) = &self.pulled {
            println!(
                "{} Pulled {} records ({} bytes) from {}",
                "✓".green().bold(),
                pulled.records.to_string().cyan(),
                pulled.bytes,
                url
            );
        }
        if let Some(pushed) = &self.pushed {
            println!(
                "{} Pushed {} records ({} bytes) to {}",
                "✓".green().bold(),
                pushed.records.to_string().cyan(),
                pushed.bytes,
                url
            );
        }
        if let Some(imported) = self.imported {
            println!("{} Imported {} records from {}", "✓".green().bold(), imported.to_string().cyan(), url);
        }
        if self.command == "rollback" {
            println!("{} Rolled back {}", "✓".green().bold(), url);
        }
    }
}

fn callback_error(e: EngineError) -> MerkleError {
    MerkleError::Callback(Box::new(e))
}

/// True when the failure is another writer holding a store's lock.
pub fn is_lock_error(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        matches!(cause.downcast_ref::<MerkleError>(), Some(MerkleError::Locked(_)))
            || cause.downcast_ref::<EngineError>().is_some_and(is_locked)
    })
}

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = SyncConfig::resolve(&cli.global)?;
    let url = cli.command.url();
    let summary = match &cli.command {
        Command::Pull(_) => with_engine(&config, true, |engine| pull(engine, &config, url))?,
        Command::Push(_) => with_engine(&config, false, |engine| push(engine, &config, url))?,
        Command::Sync(_) => with_engine(&config, true, |engine| sync(engine, &config, url))?,
        Command::Clone(_) => with_engine(&config, false, |engine| clone(engine, &config, url))?,
        Command::Import(_) => with_engine(&config, true, |engine| full_import(engine, &config, url))?,
        Command::Rollback(_) => rollback(&config, url)?,
    };
    summary.print(cli.global.format)
}

/// Run `f` against the configured engine, stopping it afterwards.
fn with_engine<F>(config: &SyncConfig, create_db: bool, f: F) -> anyhow::Result<Summary>
where
    F: FnOnce(&mut MtnClient) -> anyhow::Result<Summary>,
{
    let mut engine = MtnClient::new(config.executable(), config.database()?);
    if create_db {
        engine.ensure_db()?;
    }
    let summary = f(&mut engine)?;
    engine.stop()?;
    Ok(summary)
}

/// The transit store: a local directory when configured, memory otherwise.
fn staging(config: &SyncConfig) -> anyhow::Result<MerkleDir<Backend>> {
    let backend = match &config.local {
        Some(dir) => {
            let fs = LocalFs::new(dir);
            fs.ensure_dir_exists()
                .with_context(|| format!("creating transit directory {}", dir.display()))?;
            Backend::Local(fs)
        }
        None => Backend::Memory(MemoryFs::new()),
    };
    Ok(MerkleDir::new(backend))
}

/// Export the database into a fresh transit store.
fn prepare<E: Engine + ?Sized>(
    engine: &mut E,
    config: &SyncConfig,
) -> anyhow::Result<(MerkleDir<Backend>, ExportReport)> {
    let pattern = config
        .branch_pattern
        .as_deref()
        .map(BranchPattern::new)
        .transpose()?;
    let mut staging = staging(config)?;
    let report = export(engine, &mut staging, pattern.as_ref()).context("exporting the database")?;
    Ok((staging, report))
}

fn open_target(config: &SyncConfig, url: &str) -> anyhow::Result<MerkleDir<Backend>> {
    let fs = open_writable(url, &config.backend_options()).with_context(|| format!("opening {url}"))?;
    Ok(MerkleDir::new(fs))
}

fn open_source(config: &SyncConfig, url: &str) -> anyhow::Result<MerkleDir<Backend>> {
    let fs = open_readable(url, &config.backend_options()).with_context(|| format!("opening {url}"))?;
    Ok(MerkleDir::new(fs))
}

pub fn push<E: Engine + ?Sized>(engine: &mut E, config: &SyncConfig, url: &str) -> anyhow::Result<Summary> {
    info!(url, "pushing database");
    let (mut staging, exported) = prepare(engine, config)?;
    let mut target = open_target(config, url)?;
    let pushed = staging.push(&mut target)?;
    Ok(Summary {
        exported: Some(exported),
        pushed: Some(pushed),
        ..Summary::new("push", url)
    })
}

pub fn clone<E: Engine + ?Sized>(engine: &mut E, config: &SyncConfig, url: &str) -> anyhow::Result<Summary> {
    let target = open_target(config, url)?;
    target
        .fs()
        .ensure_dir_exists()
        .with_context(|| format!("creating {url}"))?;
    drop(target);
    Ok(Summary {
        command: "clone",
        ..push(engine, config, url)?
    })
}

pub fn pull<E: Engine + ?Sized>(engine: &mut E, config: &SyncConfig, url: &str) -> anyhow::Result<Summary> {
    info!(url, "pulling into database");
    let (mut staging, exported) = prepare(engine, config)?;
    let mut source = open_source(config, url)?;
    let mut sink = engine.feeder()?;
    let pulled = staging.pull_with(&mut source, |_, data| sink.write(data).map_err(callback_error))?;
    let imported = sink.finish()?;
    Ok(Summary {
        exported: Some(exported),
        pulled: Some(pulled),
        imported: Some(imported),
        ..Summary::new("pull", url)
    })
}

pub fn sync<E: Engine + ?Sized>(engine: &mut E, config: &SyncConfig, url: &str) -> anyhow::Result<Summary> {
    info!(url, "synchronizing database");
    let (mut staging, exported) = prepare(engine, config)?;
    let mut other = open_target(config, url)?;
    let mut sink = engine.feeder()?;
    let report = staging.sync_with(
        &mut other,
        |_, data| sink.write(data).map_err(callback_error),
        |_, _| Ok(()),
    )?;
    let imported = sink.finish()?;
    Ok(Summary {
        exported: Some(exported),
        pulled: Some(report.pulled),
        pushed: Some(report.pushed),
        imported: Some(imported),
        ..Summary::new("sync", url)
    })
}

pub fn full_import<E: Engine + ?Sized>(engine: &mut E, config: &SyncConfig, url: &str) -> anyhow::Result<Summary> {
    info!(url, "importing every record");
    let mut source = open_source(config, url)?;
    let imported = import(&mut source, engine)?;
    Ok(Summary {
        imported: Some(imported),
        ..Summary::new("import", url)
    })
}

pub fn rollback(config: &SyncConfig, url: &str) -> anyhow::Result<Summary> {
    let mut target = open_target(config, url)?;
    target.rollback()?;
    Ok(Summary::new("rollback", url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdsync_engine::MemoryEngine;
    use std::path::Path;

    fn config_with_local(local: Option<&Path>) -> SyncConfig {
        SyncConfig {
            local: local.map(Path::to_path_buf),
            ..SyncConfig::default()
        }
    }

    fn url(dir: &Path) -> String {
        dir.join("store").display().to_string()
    }

    #[test]
    fn clone_then_pull_into_another_engine() {
        let dir = tempfile::tempdir().unwrap();
        let store = url(dir.path());
        let config = config_with_local(None);

        let mut alice = MemoryEngine::new("alice@example.com");
        let root = alice.commit("main", None, &[("README", b"hello")]);
        alice.commit("main", Some(root), &[("README", b"hello again")]);
        let cloned = clone(&mut alice, &config, &store).unwrap();
        assert_eq!(cloned.command, "clone");
        let exported = cloned.exported.unwrap();
        assert_eq!(cloned.pushed.unwrap().records, exported.records_added);

        let mut bob = MemoryEngine::new("bob@example.com");
        let bob_config = config_with_local(Some(&dir.path().join("bob-transit")));
        let pulled = pull(&mut bob, &bob_config, &store).unwrap();
        assert_eq!(pulled.imported, Some(exported.records_added));
        assert_eq!(bob.received().len() as u64, exported.records_added);

        // The transit directory remembers what was pulled.
        let again = pull(&mut bob, &bob_config, &store).unwrap();
        assert_eq!(again.pulled.unwrap().records, 0);
        assert_eq!(again.imported, Some(0));
    }

    #[test]
    fn sync_exchanges_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let store = url(dir.path());
        let config = config_with_local(None);

        let mut alice = MemoryEngine::new("alice@example.com");
        alice.commit("main", None, &[("a", b"from alice")]);
        clone(&mut alice, &config, &store).unwrap();

        let mut bob = MemoryEngine::new("bob@example.com");
        bob.commit("main", None, &[("b", b"from bob")]);
        let summary = sync(&mut bob, &config, &store).unwrap();
        // alice's revision: mdata, fdata, rdata, cert, key
        assert_eq!(summary.pulled.unwrap().records, 5);
        assert_eq!(summary.imported, Some(5));
        assert_eq!(summary.pushed.unwrap().records, 5);
    }

    #[test]
    fn persistent_transit_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = url(dir.path());
        let transit = dir.path().join("transit");
        let config = config_with_local(Some(&transit));

        let mut alice = MemoryEngine::new("alice@example.com");
        alice.commit("main", None, &[("a", b"1")]);
        clone(&mut alice, &config, &store).unwrap();
        assert!(transit.join("DATA").is_file());

        // The transit store already holds everything: nothing to push.
        let second = push(&mut alice, &config, &store).unwrap();
        assert_eq!(second.exported.unwrap().records_added, 0);
        assert_eq!(second.pushed.unwrap().records, 0);
    }

    #[test]
    fn full_import_feeds_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = url(dir.path());
        let config = config_with_local(None);
        let mut alice = MemoryEngine::new("alice@example.com");
        alice.commit("main", None, &[("a", b"1")]);
        let exported = clone(&mut alice, &config, &store).unwrap().exported.unwrap();

        let mut bob = MemoryEngine::new("bob@example.com");
        let summary = full_import(&mut bob, &config, &store).unwrap();
        assert_eq!(summary.imported, Some(exported.records_added));
    }

    #[test]
    fn locked_store_is_reported_as_lock_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = url(dir.path());
        let config = config_with_local(None);
        let mut alice = MemoryEngine::new("alice@example.com");
        alice.commit("main", None, &[("a", b"1")]);
        clone(&mut alice, &config, &store).unwrap();

        let mut holder = open_target(&config, &store).unwrap();
        holder.begin().unwrap();
        alice.commit("main", None, &[("b", b"2")]);
        let err = push(&mut alice, &config, &store).unwrap_err();
        assert!(is_lock_error(&err));
        drop(holder);

        rollback(&config, &store).unwrap();
        push(&mut alice, &config, &store).unwrap();
    }

    #[test]
    fn other_failures_are_not_lock_errors() {
        let config = config_with_local(None);
        let mut alice = MemoryEngine::new("alice@example.com");
        let err = push(&mut alice, &config, "ftp://example.com/store").unwrap_err();
        assert!(!is_lock_error(&err));
    }

    #[test]
    fn summary_json_omits_absent_parts() {
        let summary = Summary::new("rollback", "/srv/store");
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["command"], "rollback");
        assert!(json.get("pushed").is_none());
    }
}
