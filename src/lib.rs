//! # tablet-backup
//!
//! Verified block-level backup and restore of a tablet's storage over its
//! remote shell.
//!
//! ## Features
//!
//! - **Backups**: raw partition and whole-disk dumps, checked against the
//!   device's own `md5sum` before they are accepted
//! - **Restores**: full, bootloader, OS and data restores, with every local
//!   image verified before the first write and one reconnect-and-retry per
//!   failed write
//! - **Partition offsets**: OS and data partitions restored out of a
//!   whole-disk image using the partition table captured with the backup
//! - **Metadata**: one versioned `backup.json` per backup directory
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tablet_backup::channel::ProcessChannel;
//! use tablet_backup::config::EngineSettings;
//! use tablet_backup::device::DeviceInfo;
//! use tablet_backup::preset::BackupPreset;
//! use tablet_backup::progress::NoProgress;
//! use tablet_backup::{BackupController, CancellationToken};
//!
//! # fn main() -> tablet_backup::Result<()> {
//! let channel = ProcessChannel::new(&["ssh".to_string(), "root@10.11.99.1".to_string()])?;
//! let device_info = DeviceInfo::query(&channel)?;
//!
//! let mut controller = BackupController::new("./backups", EngineSettings::default());
//! let outcome = controller.make_backup(
//!     &channel,
//!     device_info,
//!     &BackupPreset::Data.specs(),
//!     &CancellationToken::new(),
//!     &NoProgress,
//! )?;
//! println!("Backup finished: {:?}", outcome);
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod backup_file;
pub mod channel;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod partition;
pub mod preset;
pub mod progress;
pub mod recovery;

#[cfg(test)]
mod testutil;

// Re-export commonly used types
pub use backup::{Backup, RestoreType};
pub use backup_file::{BackupFile, FileKind};
pub use channel::{ProcessChannel, RemoteChannel};
pub use controller::{BackupController, BackupOutcome};
pub use device::DeviceInfo;
pub use error::{Error, Result};
pub use recovery::RecoveryController;
pub use tokio_util::sync::CancellationToken;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
