//! List command implementation.

use crate::backup::Backup;
use crate::config::Config;
use crate::controller::BackupController;
use crate::device::DeviceInfo;
use crate::progress::format_mib;
use anyhow::Result;
use chrono::{DateTime, Datelike, Local, TimeZone};
use clap::Args;

/// Arguments for the list command
#[derive(Args)]
pub struct ListArgs {
    /// Show every backup on disk, including partial ones, without asking the device
    #[arg(short, long)]
    pub all: bool,
}

/// Run the list command
pub async fn run(args: ListArgs, config: &Config) -> Result<()> {
    let mut controller = BackupController::new(config.backup_dir(), config.engine_settings());
    let current = if args.all {
        None
    } else {
        let channel = super::connect(config)?;
        Some(super::blocking(move || Ok(DeviceInfo::query(channel.as_ref())?)).await?)
    };

    controller.find_and_load_backups()?;

    let backups: Vec<&Backup> = match &current {
        Some(info) => controller.restorable(info),
        None => controller.backups().iter().collect(),
    };

    if backups.is_empty() {
        println!("No backups found in {}", controller.backup_dir().display());
        return Ok(());
    }

    let now = Local::now();
    println!(
        "{:<10} {:<28} {:<24} {:>10}  Restore",
        "ID", "Taken", "OS version", "Size"
    );
    for backup in backups {
        let types: Vec<&str> = backup
            .restore_types(current.as_ref())
            .iter()
            .map(|t| t.label())
            .collect();
        let restore = if backup.is_complete() {
            types.join(", ")
        } else {
            "(incomplete)".to_string()
        };
        println!(
            "{:<10} {:<28} {:<24} {:>10}  {}",
            &backup.id()[..backup.id().len().min(8)],
            pretty_date(backup.timestamp().with_timezone(&Local), now),
            backup.device_info().osver,
            format_mib(backup.size()),
            restore
        );
    }

    Ok(())
}

/// Human timestamp relative to `now`
pub fn pretty_date<Tz: TimeZone>(then: DateTime<Tz>, now: DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let days = (now.date_naive() - then.date_naive()).num_days();
    let format = if days == 0 {
        "Today at %-I:%M %p"
    } else if days == 1 {
        "Yesterday at %-I:%M %p"
    } else if now.year() == then.year() {
        "%b %-d at %-I:%M %p"
    } else {
        "%b %-d, %Y at %-I:%M %p"
    };
    then.format(format).to_string()
}
