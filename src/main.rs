//! tablet-backup - verified block-level backups of a tablet
//!
//! Main binary entry point for the command-line interface.

use clap::Parser;
use tablet_backup::cli::{self, Cli, Commands};
use tablet_backup::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let config = cli::load_config(args.config.as_deref())?;

    match &args.log_file {
        Some(path) => logging::init_file_logging(path, &config.logging.level, args.verbose)?,
        None => logging::init_logging(&config.logging.level, args.verbose)?,
    }

    match args.command {
        Commands::Info(cmd) => cli::info::run(cmd, &config).await,
        Commands::Backup(cmd) => cli::backup::run(cmd, &config).await,
        Commands::List(cmd) => cli::list::run(cmd, &config).await,
        Commands::Restore(cmd) => cli::restore::run(cmd, &config).await,
        Commands::Delete(cmd) => cli::delete::run(cmd, &config).await,
    }
}
