//! Restore command implementation.

use super::TerminalProgress;
use crate::backup::RestoreType;
use crate::config::Config;
use crate::controller::BackupController;
use crate::device::DeviceInfo;
use crate::recovery::{with_recovery_mode, ConnectedRecovery};
use anyhow::{anyhow, bail, Result};
use clap::{Args, ValueEnum};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum RestoreArg {
    /// Main disk and bootloader
    Full,
    /// Bootloader only
    Bootloader,
    /// OS partitions
    Os,
    /// User data partition
    Data,
}

impl From<RestoreArg> for RestoreType {
    fn from(arg: RestoreArg) -> Self {
        match arg {
            RestoreArg::Full => RestoreType::Full,
            RestoreArg::Bootloader => RestoreType::Bootloader,
            RestoreArg::Os => RestoreType::Os,
            RestoreArg::Data => RestoreType::Data,
        }
    }
}

/// Arguments for the restore command
#[derive(Args)]
pub struct RestoreArgs {
    /// Backup id or a unique prefix of it
    pub id: String,

    /// What to restore
    #[arg(short = 't', long = "type", value_enum)]
    pub kind: RestoreArg,
}

/// Run the restore command
pub async fn run(args: RestoreArgs, config: &Config) -> Result<()> {
    let channel = super::connect(config)?;
    let kind = RestoreType::from(args.kind);
    let mut controller = BackupController::new(config.backup_dir(), config.engine_settings());

    let restored = super::blocking(move || {
        controller.find_and_load_backups()?;
        let current = DeviceInfo::query(channel.as_ref())?;

        let backup = controller.find(&args.id)?;
        if !controller
            .restorable(&current)
            .iter()
            .any(|b| b.id() == backup.id())
        {
            bail!("backup {} cannot be restored onto this device", backup.id());
        }
        let offered = backup.restore_types(Some(&current));
        if !offered.contains(&kind) {
            let labels: Vec<&str> = offered.iter().map(|t| t.label()).collect();
            bail!(
                "backup {} offers no {} restore (available: {})",
                backup.id(),
                kind,
                labels.join(", ")
            );
        }

        println!("Restoring {} from backup {}", kind, backup.id());
        let recovery = ConnectedRecovery::new(channel.clone());
        let progress = TerminalProgress::new();
        let ok = with_recovery_mode(&recovery, false, || {
            backup.restore(
                kind,
                &current,
                channel.as_ref(),
                &recovery,
                controller.settings(),
                &progress,
            )
        })
        .ok_or_else(|| anyhow!("could not enter recovery mode"))?;
        progress.finish();
        Ok(ok)
    })
    .await?;

    if !restored {
        bail!("restore failed; the device may need manual recovery");
    }
    println!("Restore completed successfully!");
    Ok(())
}
