//! Delete command implementation.

use crate::config::Config;
use crate::controller::BackupController;
use anyhow::{Context, Result};
use clap::Args;

/// Arguments for the delete command
#[derive(Args)]
pub struct DeleteArgs {
    /// Backup id or a unique prefix of it
    pub id: String,
}

/// Run the delete command
pub async fn run(args: DeleteArgs, config: &Config) -> Result<()> {
    let mut controller = BackupController::new(config.backup_dir(), config.engine_settings());
    controller.find_and_load_backups()?;

    let id = controller.find(&args.id)?.id().to_string();
    controller
        .delete_backup(&id)
        .with_context(|| format!("failed to delete backup {}", id))?;

    println!("Deleted backup {}", id);
    Ok(())
}
