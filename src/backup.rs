//! Backup aggregate: taking a backup and restoring it

use crate::backup_file::{BackupFile, BOOTLOADER_DEVICE};
use crate::channel::RemoteChannel;
use crate::config::EngineSettings;
use crate::device::DeviceInfo;
use crate::metadata::{self, BackupRecord, METADATA_FILE, METADATA_VERSION};
use crate::partition::{self, MAIN_DISK};
use crate::preset::FileSpec;
use crate::progress::{percent, ProgressSink};
use crate::recovery::RecoveryController;
use crate::{CancellationToken, Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{error, info, span, warn, Level};
use uuid::Uuid;

/// Retries of a failed restore write after reconnecting
const MAX_RESTORE_RETRIES: u32 = 1;

const OS_PARTITIONS: [&str; 3] = ["/dev/mmcblk1p1", "/dev/mmcblk1p2", "/dev/mmcblk1p3"];
const DATA_PARTITION: &str = "/dev/mmcblk1p7";

/// What a backup can put back on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestoreType {
    Full,
    Bootloader,
    Os,
    Data,
}

impl RestoreType {
    pub fn label(&self) -> &'static str {
        match self {
            RestoreType::Full => "Full",
            RestoreType::Bootloader => "Bootloader",
            RestoreType::Os => "OS",
            RestoreType::Data => "Data",
        }
    }
}

impl std::fmt::Display for RestoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for RestoreType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(RestoreType::Full),
            "bootloader" => Ok(RestoreType::Bootloader),
            "os" => Ok(RestoreType::Os),
            "data" => Ok(RestoreType::Data),
            other => Err(Error::Configuration {
                reason: format!("unknown restore type `{}`", other),
            }),
        }
    }
}

/// One write of a restore: a byte range of a local file onto a device path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreStep<'a> {
    pub file: &'a BackupFile,
    pub mountpoint: &'a str,
    pub start: u64,
    pub length: u64,
}

/// A set of partition images taken from one device at one time
#[derive(Debug)]
pub struct Backup {
    id: String,
    timestamp: DateTime<Utc>,
    device_info: DeviceInfo,
    files: Vec<BackupFile>,
    complete: bool,
    dir: PathBuf,
}

impl Backup {
    /// Register a new backup under `parent_dir` and size up its files.
    ///
    /// A file whose size or checksum cannot be read stays dirty and is
    /// reported as failed by [`Backup::do_backup`].
    pub fn as_new(
        parent_dir: &Path,
        device_info: DeviceInfo,
        specs: &[FileSpec],
        channel: &dyn RemoteChannel,
        settings: &EngineSettings,
    ) -> Result<Self> {
        let id = Uuid::new_v4().to_string();
        let dir = parent_dir.join(&id);
        fs::create_dir_all(dir.join("files"))?;
        info!("Created backup {} at {}", id, dir.display());

        let mut files = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut file = BackupFile::new(&spec.name, spec.kind, &spec.mountpoint);
            if let Err(e) = file.resolve_size_and_checksum(channel, settings) {
                error!("Could not size up {}: {}", spec.mountpoint, e);
            }
            files.push(file);
        }

        Ok(Self {
            id,
            timestamp: Utc::now(),
            device_info,
            files,
            complete: false,
            dir,
        })
    }

    /// Rebuild a backup from its directory
    pub fn load(dir: &Path) -> Result<Self> {
        let record = BackupRecord::load(dir.join(METADATA_FILE))?;
        Self::from_record(dir.to_path_buf(), record)
    }

    pub fn from_record(dir: PathBuf, record: BackupRecord) -> Result<Self> {
        let timestamp = record.created().ok_or_else(|| Error::InvalidMetadata {
            reason: format!("timestamp {} out of range", record.timestamp),
        })?;
        Ok(Self {
            id: record.bid,
            timestamp,
            device_info: record.device_info,
            files: record.files.into_iter().map(BackupFile::from_record).collect(),
            complete: record.complete,
            dir,
        })
    }

    /// Metadata as persisted; dirty files are left out
    pub fn to_record(&self) -> BackupRecord {
        BackupRecord {
            version: METADATA_VERSION,
            bid: self.id.clone(),
            timestamp: metadata::to_epoch_seconds(self.timestamp),
            complete: self.complete,
            device_info: self.device_info.clone(),
            files: self.files.iter().filter_map(BackupFile::to_record).collect(),
        }
    }

    /// Recompute completeness and write `backup.json`
    pub fn save(&mut self) -> Result<()> {
        self.complete = !self.files.is_empty() && self.files.iter().all(|f| !f.is_dirty());
        self.to_record().save(self.dir.join(METADATA_FILE))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    pub fn files(&self) -> &[BackupFile] {
        &self.files
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn files_dir(&self) -> PathBuf {
        self.dir.join("files")
    }

    /// Local path of a file's image
    pub fn file_path(&self, file: &BackupFile) -> PathBuf {
        self.files_dir().join(file.filename())
    }

    /// Total size in bytes
    pub fn size(&self) -> u64 {
        self.files.iter().map(BackupFile::size).sum()
    }

    /// Remove the backup directory and everything in it
    pub fn delete(self) -> Result<()> {
        info!("Deleting backup {}", self.id);
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    /// Take every file from the device, in order.
    ///
    /// A failed file is logged and skipped; metadata is written after each
    /// attempt. Stops between files once `cancel` fires. Returns whether
    /// the backup ended up complete.
    pub fn do_backup(
        &mut self,
        channel: &dyn RemoteChannel,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> bool {
        let span = span!(Level::INFO, "do_backup", id = %self.id);
        let _enter = span.enter();

        let total = self.size();
        let mut done = 0u64;
        progress.set_progress(0.0);

        for index in 0..self.files.len() {
            if cancel.is_cancelled() {
                info!("Backup cancelled before {}", self.files[index].name());
                break;
            }

            let dest = self.file_path(&self.files[index]);
            let file = &mut self.files[index];
            let base = done;

            if file.checksum().is_none() {
                error!("Skipping {}: size and checksum unknown", file.name());
            } else {
                let mut copied = 0u64;
                let ok = file.dump_from_device(channel, &dest, cancel, &mut |n| {
                    copied += n;
                    progress.set_progress(percent(base + copied, total));
                });
                if !ok {
                    warn!("Could not back up {}, continuing with the rest", file.name());
                }
            }
            done = base + file.size();

            if let Err(e) = self.save() {
                error!("Could not write backup metadata: {}", e);
            }
        }

        if self.complete {
            info!("Backup {} complete ({} files)", self.id, self.files.len());
        } else {
            warn!("Backup {} is incomplete", self.id);
        }
        self.complete
    }

    /// Restore types this backup supports on the connected device.
    ///
    /// OS and Data are withheld when either the backup or the connected
    /// device runs the vendor fork, or the connected device is unknown.
    pub fn restore_types(&self, current: Option<&DeviceInfo>) -> Vec<RestoreType> {
        let has = |name: &str| self.clean_file(name).is_some();
        let disk = has("mmcblk1");
        let boot0 = has("mmcblk1boot0");
        let os_parts = has("mmcblk1p1") && has("mmcblk1p2") && has("mmcblk1p3");
        let data_part = has("mmcblk1p7");

        let os_level_allowed = !self.device_info.is_vendor_fork()
            && current.is_some_and(|d| !d.osver.is_empty() && !d.is_vendor_fork());

        let mut types = Vec::new();
        if boot0 && disk {
            types.push(RestoreType::Full);
        }
        if boot0 {
            types.push(RestoreType::Bootloader);
        }
        if (disk || os_parts) && os_level_allowed {
            types.push(RestoreType::Os);
        }
        if (disk || data_part) && os_level_allowed {
            types.push(RestoreType::Data);
        }
        types
    }

    fn clean_file(&self, name: &str) -> Option<&BackupFile> {
        self.files.iter().find(|f| f.name() == name && !f.is_dirty())
    }

    fn clean_file_at(&self, mountpoint: &str) -> Result<&BackupFile> {
        self.files
            .iter()
            .find(|f| f.mountpoint() == mountpoint && !f.is_dirty())
            .ok_or_else(|| Error::InvalidMetadata {
                reason: format!("backup {} has no usable copy of {}", self.id, mountpoint),
            })
    }

    fn whole<'a>(&'a self, mountpoint: &'a str) -> Result<RestoreStep<'a>> {
        let file = self.clean_file_at(mountpoint)?;
        Ok(RestoreStep {
            file,
            mountpoint,
            start: 0,
            length: file.size(),
        })
    }

    /// Byte range of `mountpoint` inside the whole-disk image, located
    /// through the partition table recorded with the backup
    fn slice<'a>(&'a self, mountpoint: &'a str) -> Result<RestoreStep<'a>> {
        let disk = self.clean_file_at(MAIN_DISK)?;
        let extent = partition::resolve_offset(&self.device_info.partition_table, mountpoint)?;
        let end = extent.end()?;
        if end > disk.size() {
            return Err(Error::Parse {
                reason: format!(
                    "{} ends at byte {}, past the {} byte disk image",
                    mountpoint,
                    end,
                    disk.size()
                ),
            });
        }
        Ok(RestoreStep {
            file: disk,
            mountpoint,
            start: extent.start,
            length: extent.length,
        })
    }

    /// The writes a restore of `kind` consists of, in order
    pub fn restore_plan(&self, kind: RestoreType) -> Result<Vec<RestoreStep<'_>>> {
        let has_disk = self.clean_file("mmcblk1").is_some();
        match kind {
            RestoreType::Full => Ok(vec![self.whole(MAIN_DISK)?, self.whole(BOOTLOADER_DEVICE)?]),
            RestoreType::Bootloader => Ok(vec![self.whole(BOOTLOADER_DEVICE)?]),
            RestoreType::Os if has_disk => OS_PARTITIONS.iter().map(|mp| self.slice(mp)).collect(),
            RestoreType::Os => OS_PARTITIONS.iter().map(|mp| self.whole(mp)).collect(),
            RestoreType::Data if has_disk => Ok(vec![self.slice(DATA_PARTITION)?]),
            RestoreType::Data => Ok(vec![self.whole(DATA_PARTITION)?]),
        }
    }

    /// Put this backup back on the device
    pub fn restore(
        &self,
        kind: RestoreType,
        current: &DeviceInfo,
        channel: &dyn RemoteChannel,
        recovery: &dyn RecoveryController,
        settings: &EngineSettings,
        progress: &dyn ProgressSink,
    ) -> bool {
        info!("{} restore of backup {}", kind, self.id);

        if !self.restore_types(Some(current)).contains(&kind) {
            error!("Backup {} does not offer a {} restore", self.id, kind);
            return false;
        }

        match self.restore_plan(kind) {
            Ok(steps) => self.restore_files(&steps, channel, recovery, settings, progress),
            Err(e) => {
                error!("Cannot restore: {}", e);
                false
            }
        }
    }

    /// Each local image behind `steps` once, in first-use order
    fn local_sources<'a>(&self, steps: &[RestoreStep<'a>]) -> Vec<(&'a BackupFile, PathBuf)> {
        let mut seen = HashSet::new();
        steps
            .iter()
            .map(|step| (step.file, self.file_path(step.file)))
            .filter(|(_, path)| seen.insert(path.clone()))
            .collect()
    }

    /// Write `steps` to the device in order.
    ///
    /// Every local image is verified before the first write. A failed write
    /// is retried once after a cooldown and a successful reconnect; any
    /// other failure ends the whole sequence.
    pub fn restore_files(
        &self,
        steps: &[RestoreStep<'_>],
        channel: &dyn RemoteChannel,
        recovery: &dyn RecoveryController,
        settings: &EngineSettings,
        progress: &dyn ProgressSink,
    ) -> bool {
        let span = span!(Level::INFO, "restore_files", id = %self.id);
        let _enter = span.enter();

        let mut verified = true;
        for (file, path) in self.local_sources(steps) {
            if !file.verify_local_copy(&path) {
                verified = false;
            }
        }
        if !verified {
            error!("Not all local checksums could be verified, nothing was written");
            return false;
        }
        info!("All local checksums are good");

        let total: u64 = steps.iter().map(|s| s.length).sum();
        let mut done = 0u64;

        for step in steps {
            let source = self.file_path(step.file);
            let mut attempt = 0;

            loop {
                let ok = step.file.restore_to_device(
                    channel,
                    &source,
                    step.mountpoint,
                    step.start,
                    step.length,
                    settings,
                    &mut |fraction| {
                        let written = done as f64 + step.length as f64 * fraction;
                        progress.set_progress(if total == 0 {
                            100.0
                        } else {
                            (written / total as f64 * 100.0).clamp(0.0, 100.0)
                        });
                    },
                );
                if ok {
                    break;
                }
                if attempt == MAX_RESTORE_RETRIES {
                    error!(
                        "Failed to restore {} to {}, aborting. The device needs manual recovery",
                        step.file.name(),
                        step.mountpoint
                    );
                    return false;
                }
                attempt += 1;

                warn!(
                    "Restoring {} failed, waiting {}s before reconnecting",
                    step.file.name(),
                    settings.restore_cooldown.as_secs()
                );
                thread::sleep(settings.restore_cooldown);
                if !recovery.reconnect(false) {
                    error!(
                        "Could not re-establish the connection to the recovery OS. \
                         The device needs manual recovery"
                    );
                    return false;
                }
            }

            done += step.length;
        }

        info!("Restore of backup {} finished", self.id);
        true
    }
}
