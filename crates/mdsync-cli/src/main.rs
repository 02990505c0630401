use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod config;

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    init_tracing(cli.global.verbose);
    let url = cli.command.url().to_string();

    match commands::run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if commands::is_lock_error(&e) => {
            eprintln!("{} {url} is locked by another writer: {e:#}", "error:".red().bold());
            eprintln!(
                "  try again later; if an earlier run was interrupted, clear the lock with `mdsync rollback {url}`"
            );
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}
