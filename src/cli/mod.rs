//! Command-line interface for tablet-backup.
//!
//! Every command that touches the device runs the engine on a blocking
//! worker thread; the async side only waits and watches for Ctrl-C.

use crate::channel::{ProcessChannel, RemoteChannel};
use crate::config::Config;
use crate::progress::ProgressSink;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub mod backup;
pub mod delete;
pub mod info;
pub mod list;
pub mod restore;

/// tablet-backup - block-level backups of a tablet over its remote shell
#[derive(Parser)]
#[command(name = "tablet-backup")]
#[command(about = "Verified block-level backup and restore for tablet devices")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (defaults to the per-user config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Show the connected device and what can be backed up
    Info(info::InfoArgs),
    /// Take a new backup
    Backup(backup::BackupArgs),
    /// List backups
    List(list::ListArgs),
    /// Restore a backup onto the connected device
    Restore(restore::RestoreArgs),
    /// Delete a backup
    Delete(delete::DeleteArgs),
}

/// Load the configuration from `path` or the default location
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;
    Ok(config)
}

/// Channel to the device described by the configuration
pub fn connect(config: &Config) -> anyhow::Result<Arc<dyn RemoteChannel>> {
    let channel = ProcessChannel::new(&config.device.command)
        .context("invalid device command")?;
    Ok(Arc::new(channel))
}

/// Run blocking engine work off the async runtime
pub async fn blocking<T, F>(work: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .context("worker thread failed")?
}

/// Whole-percent progress line on stderr
#[derive(Default)]
pub struct TerminalProgress {
    last: Mutex<Option<u32>>,
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(&self) {
        eprintln!();
    }
}

impl ProgressSink for TerminalProgress {
    fn set_progress(&self, percent: f64) {
        let whole = percent.floor() as u32;
        let Ok(mut last) = self.last.lock() else {
            return;
        };
        if *last == Some(whole) {
            return;
        }
        *last = Some(whole);
        eprint!("\rProgress: {:>3}%", whole);
        let _ = std::io::stderr().flush();
    }
}
