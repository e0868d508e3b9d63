//! Info command implementation.

use crate::config::Config;
use crate::device::DeviceInfo;
use crate::preset::BackupPreset;
use crate::recovery::detect_stuck_backup_mode;
use anyhow::Result;
use clap::Args;

/// Arguments for the info command
#[derive(Args)]
pub struct InfoArgs {
    /// Also print the raw partition table
    #[arg(long)]
    pub partitions: bool,
}

/// Run the info command
pub async fn run(args: InfoArgs, config: &Config) -> Result<()> {
    let channel = super::connect(config)?;

    let (info, stuck) = super::blocking(move || {
        let info = DeviceInfo::query(channel.as_ref())?;
        let stuck = detect_stuck_backup_mode(channel.as_ref())?;
        Ok((info, stuck))
    })
    .await?;

    println!("Model:       {}", info.model);
    println!("Serial:      {}", info.serial);
    println!("OS version:  {}", info.osver);
    println!("Boot args:   {}", info.kernel_bootargs);
    println!(
        "Supported:   {}",
        if info.is_supported_model() { "yes" } else { "no" }
    );

    let presets = BackupPreset::offered(&info);
    if presets.is_empty() {
        println!("Backups:     none available for this model");
    } else {
        let labels: Vec<&str> = presets.iter().map(BackupPreset::label).collect();
        println!("Backups:     {}", labels.join(", "));
    }

    if stuck {
        println!();
        println!("The device is waiting in a backup session. Hold the power button for");
        println!("10 seconds, release it, then power on normally.");
    }

    if args.partitions {
        println!();
        println!("{}", info.partition_table);
    }

    Ok(())
}
