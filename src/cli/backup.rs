//! Backup command implementation.

use super::TerminalProgress;
use crate::config::Config;
use crate::controller::{BackupController, BackupOutcome};
use crate::device::DeviceInfo;
use crate::preset::BackupPreset;
use crate::progress::format_mib;
use crate::recovery::{detect_stuck_backup_mode, with_recovery_mode, ConnectedRecovery};
use crate::CancellationToken;
use anyhow::{anyhow, bail, Result};
use clap::{Args, ValueEnum};
use tracing::warn;

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum PresetArg {
    /// Bootloaders and the whole main disk
    Full,
    /// Bootloaders and the OS partitions
    Os,
    /// User data partitions
    Data,
}

impl From<PresetArg> for BackupPreset {
    fn from(arg: PresetArg) -> Self {
        match arg {
            PresetArg::Full => BackupPreset::Full,
            PresetArg::Os => BackupPreset::Os,
            PresetArg::Data => BackupPreset::Data,
        }
    }
}

/// Arguments for the backup command
#[derive(Args)]
pub struct BackupArgs {
    /// What to back up
    #[arg(short, long, value_enum, default_value = "full")]
    pub preset: PresetArg,
}

/// Run the backup command
pub async fn run(args: BackupArgs, config: &Config) -> Result<()> {
    let channel = super::connect(config)?;
    let preset = BackupPreset::from(args.preset);
    let backup_dir = config.backup_dir();
    let settings = config.engine_settings();

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current chunk");
                cancel.cancel();
            }
        })
    };

    println!("Starting {} backup into {}", preset.label(), backup_dir.display());

    let outcome = super::blocking(move || {
        let info = DeviceInfo::query(channel.as_ref())?;
        if !BackupPreset::offered(&info).contains(&preset) {
            bail!(
                "{} backups are not available for model {:?} running {:?}",
                preset.label(),
                info.model,
                info.osver
            );
        }
        if detect_stuck_backup_mode(channel.as_ref())? {
            warn!("The device reports a stuck backup session");
        }

        let recovery = ConnectedRecovery::new(channel.clone());
        let mut controller = BackupController::new(backup_dir, settings);
        let progress = TerminalProgress::new();

        let outcome = with_recovery_mode(&recovery, true, || {
            controller.make_backup(channel.as_ref(), info, &preset.specs(), &cancel, &progress)
        })
        .ok_or_else(|| anyhow!("could not enter recovery mode"))??;
        progress.finish();

        let size = match &outcome {
            BackupOutcome::Complete { id } | BackupOutcome::Partial { id } => {
                controller.find(id).map(|b| b.size()).unwrap_or(0)
            }
            BackupOutcome::Aborted => 0,
        };
        Ok((outcome, size))
    })
    .await;
    watcher.abort();

    match outcome? {
        (BackupOutcome::Complete { id }, size) => {
            println!("Backup completed successfully!");
            println!("  Backup ID: {}", id);
            println!("  Size: {}", format_mib(size));
        }
        (BackupOutcome::Partial { id }, _) => {
            println!("Backup {} is incomplete and cannot be restored.", id);
            println!("See the log for the files that failed.");
        }
        (BackupOutcome::Aborted, _) => println!("Backup aborted, nothing was kept."),
    }

    Ok(())
}
