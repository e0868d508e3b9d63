//! Backup discovery and lifecycle

use crate::backup::Backup;
use crate::channel::RemoteChannel;
use crate::config::EngineSettings;
use crate::device::DeviceInfo;
use crate::metadata::METADATA_FILE;
use crate::preset::FileSpec;
use crate::progress::ProgressSink;
use crate::{CancellationToken, Error, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// How a [`BackupController::make_backup`] call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// Every file was taken and verified
    Complete { id: String },
    /// Some files failed; the backup stays on disk but is never restorable
    Partial { id: String },
    /// Cancelled by the user; nothing was kept
    Aborted,
}

/// Owns the backups found under one directory
pub struct BackupController {
    backup_dir: PathBuf,
    settings: EngineSettings,
    backups: Vec<Backup>,
}

impl BackupController {
    pub fn new<P: AsRef<Path>>(backup_dir: P, settings: EngineSettings) -> Self {
        Self {
            backup_dir: backup_dir.as_ref().to_path_buf(),
            settings,
            backups: Vec::new(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Load every `*/backup.json` under the backup directory.
    ///
    /// Unreadable metadata is logged and skipped; a backup id seen twice
    /// is loaded once. Returns the number of backups loaded.
    pub fn find_and_load_backups(&mut self) -> Result<usize> {
        fs::create_dir_all(&self.backup_dir)?;

        let mut seen = HashSet::new();
        let mut backups = Vec::new();

        for entry in WalkDir::new(&self.backup_dir)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if entry.file_name() != METADATA_FILE || !entry.file_type().is_file() {
                continue;
            }
            let Some(dir) = entry.path().parent() else {
                continue;
            };

            match Backup::load(dir) {
                Ok(backup) => {
                    if seen.insert(backup.id().to_string()) {
                        debug!("Loaded backup {} from {}", backup.id(), dir.display());
                        backups.push(backup);
                    } else {
                        warn!("Backup {} found twice, ignoring {}", backup.id(), dir.display());
                    }
                }
                Err(e) => warn!("Skipping backup at {}: {}", dir.display(), e),
            }
        }

        backups.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        self.backups = backups;
        info!("Found {} backups in {}", self.backups.len(), self.backup_dir.display());
        Ok(self.backups.len())
    }

    /// Every loaded backup, newest first
    pub fn backups(&self) -> &[Backup] {
        &self.backups
    }

    /// Complete backups that may be restored onto `current`, newest first
    pub fn restorable(&self, current: &DeviceInfo) -> Vec<&Backup> {
        if !current.is_supported_model() {
            debug!("Model {:?} is not supported, offering no restores", current.model);
            return Vec::new();
        }
        self.backups
            .iter()
            .filter(|b| b.is_complete() && b.device_info().is_supported_model())
            .collect()
    }

    fn position(&self, id_prefix: &str) -> Result<usize> {
        let matches: Vec<usize> = self
            .backups
            .iter()
            .enumerate()
            .filter(|(_, b)| !id_prefix.is_empty() && b.id().starts_with(id_prefix))
            .map(|(i, _)| i)
            .collect();

        match matches.as_slice() {
            [index] => Ok(*index),
            [] => Err(Error::BackupNotFound {
                id: id_prefix.to_string(),
            }),
            _ => Err(Error::Configuration {
                reason: format!("backup id prefix `{}` is ambiguous", id_prefix),
            }),
        }
    }

    /// Look up a loaded backup by id or unique id prefix
    pub fn find(&self, id_prefix: &str) -> Result<&Backup> {
        let index = self.position(id_prefix)?;
        Ok(&self.backups[index])
    }

    /// Take a new backup of `specs` from the device.
    ///
    /// On cancellation the new backup's directory is removed entirely.
    /// Failed files leave a partial backup behind.
    pub fn make_backup(
        &mut self,
        channel: &dyn RemoteChannel,
        device_info: DeviceInfo,
        specs: &[FileSpec],
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<BackupOutcome> {
        info!("Making backup of {} files", specs.len());

        let mut backup = Backup::as_new(
            &self.backup_dir,
            device_info,
            specs,
            channel,
            &self.settings,
        )?;
        let complete = backup.do_backup(channel, cancel, progress);

        if cancel.is_cancelled() {
            info!("Backup {} aborted, removing its data", backup.id());
            if let Err(e) = backup.delete() {
                error!("Could not remove aborted backup: {}", e);
            }
            return Ok(BackupOutcome::Aborted);
        }

        let id = backup.id().to_string();
        self.backups.insert(0, backup);

        Ok(if complete {
            BackupOutcome::Complete { id }
        } else {
            BackupOutcome::Partial { id }
        })
    }

    /// Delete a backup and its files from disk
    pub fn delete_backup(&mut self, id_prefix: &str) -> Result<()> {
        let index = self.position(id_prefix)?;
        self.backups.remove(index).delete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::BackupRecord;
    use crate::preset::BackupPreset;
    use crate::progress::NoProgress;
    use crate::testutil::SimulatedDevice;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn controller(dir: &Path) -> BackupController {
        BackupController::new(dir, EngineSettings::immediate())
    }

    fn backup(
        controller: &mut BackupController,
        device: &SimulatedDevice,
        preset: BackupPreset,
    ) -> BackupOutcome {
        controller
            .make_backup(
                device,
                DeviceInfo::query(device).unwrap(),
                &preset.specs(),
                &CancellationToken::new(),
                &NoProgress,
            )
            .unwrap()
    }

    #[test]
    fn test_make_backup_and_reload() -> Result<()> {
        let device = SimulatedDevice::new();
        let temp_dir = TempDir::new()?;
        let mut first = controller(temp_dir.path());

        let id = match backup(&mut first, &device, BackupPreset::Data) {
            BackupOutcome::Complete { id } => id,
            other => panic!("unexpected outcome: {:?}", other),
        };

        let mut second = controller(temp_dir.path());
        assert_eq!(second.find_and_load_backups()?, 1);
        assert_eq!(second.backups()[0].id(), id);
        assert_eq!(second.find(&id[..8])?.id(), id);
        Ok(())
    }

    #[test]
    fn test_backups_sorted_newest_first() -> Result<()> {
        let device = SimulatedDevice::new();
        let temp_dir = TempDir::new()?;
        let mut ctrl = controller(temp_dir.path());
        backup(&mut ctrl, &device, BackupPreset::Data);
        std::thread::sleep(std::time::Duration::from_millis(5));
        backup(&mut ctrl, &device, BackupPreset::Os);

        ctrl.find_and_load_backups()?;
        let backups = ctrl.backups();
        assert_eq!(backups.len(), 2);
        assert!(backups[0].timestamp() > backups[1].timestamp());
        assert_eq!(backups[0].files().len(), 5);
        Ok(())
    }

    #[test]
    fn test_partial_backup_is_not_restorable() -> Result<()> {
        let device = SimulatedDevice::new();
        let temp_dir = TempDir::new()?;
        let mut ctrl = controller(temp_dir.path());
        let specs = vec![FileSpec::bin("mmcblk1p5"), FileSpec::bin("mmcblk1p9")];

        let outcome = ctrl.make_backup(
            &device,
            DeviceInfo::query(&device)?,
            &specs,
            &CancellationToken::new(),
            &NoProgress,
        )?;
        assert!(matches!(outcome, BackupOutcome::Partial { .. }));

        ctrl.find_and_load_backups()?;
        assert_eq!(ctrl.backups().len(), 1);
        assert!(ctrl.restorable(&DeviceInfo::query(&device)?).is_empty());
        Ok(())
    }

    #[test]
    fn test_aborted_backup_leaves_nothing() -> Result<()> {
        let device = SimulatedDevice::new();
        let temp_dir = TempDir::new()?;
        let mut ctrl = controller(temp_dir.path());
        let cancel = CancellationToken::new();
        let sink = |p: f64| {
            if p > 0.0 {
                cancel.cancel();
            }
        };

        let outcome = ctrl.make_backup(
            &device,
            DeviceInfo::query(&device)?,
            &BackupPreset::Full.specs(),
            &cancel,
            &sink,
        )?;
        assert_eq!(outcome, BackupOutcome::Aborted);
        assert!(ctrl.backups().is_empty());
        assert_eq!(fs::read_dir(temp_dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_restorable_checks_models() -> Result<()> {
        let device = SimulatedDevice::new();
        let temp_dir = TempDir::new()?;
        let mut ctrl = controller(temp_dir.path());
        backup(&mut ctrl, &device, BackupPreset::Data);
        device.set_serial("RM110-100-00001");
        backup(&mut ctrl, &device, BackupPreset::Data);

        let supported = DeviceInfo {
            serial: "RM102-1".to_string(),
            model: "RM102".to_string(),
            ..DeviceInfo::default()
        };
        let restorable = ctrl.restorable(&supported);
        assert_eq!(restorable.len(), 1);
        assert_eq!(restorable[0].device_info().model, "RM100");

        let unsupported = DeviceInfo {
            model: "RM110".to_string(),
            ..DeviceInfo::default()
        };
        assert!(ctrl.restorable(&unsupported).is_empty());
        Ok(())
    }

    #[test]
    fn test_bad_metadata_is_skipped() -> Result<()> {
        let device = SimulatedDevice::new();
        let temp_dir = TempDir::new()?;
        let mut ctrl = controller(temp_dir.path());
        backup(&mut ctrl, &device, BackupPreset::Data);

        let broken = temp_dir.path().join("broken");
        fs::create_dir_all(&broken)?;
        fs::write(broken.join(METADATA_FILE), "{\"bid\": 12")?;

        assert_eq!(ctrl.find_and_load_backups()?, 1);
        Ok(())
    }

    #[test]
    fn test_duplicate_ids_loaded_once() -> Result<()> {
        let device = SimulatedDevice::new();
        let temp_dir = TempDir::new()?;
        let mut ctrl = controller(temp_dir.path());
        let BackupOutcome::Complete { id } = backup(&mut ctrl, &device, BackupPreset::Data) else {
            panic!("backup failed");
        };

        let record = BackupRecord::load(temp_dir.path().join(&id).join(METADATA_FILE))?;
        let copy = temp_dir.path().join("copy");
        fs::create_dir_all(&copy)?;
        record.save(copy.join(METADATA_FILE))?;

        assert_eq!(ctrl.find_and_load_backups()?, 1);
        Ok(())
    }

    #[test]
    fn test_delete_backup() -> Result<()> {
        let device = SimulatedDevice::new();
        let temp_dir = TempDir::new()?;
        let mut ctrl = controller(temp_dir.path());
        let BackupOutcome::Complete { id } = backup(&mut ctrl, &device, BackupPreset::Data) else {
            panic!("backup failed");
        };

        ctrl.delete_backup(&id)?;
        assert!(ctrl.backups().is_empty());
        assert!(!temp_dir.path().join(&id).exists());
        assert!(matches!(
            ctrl.delete_backup(&id),
            Err(Error::BackupNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_empty_prefix_matches_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let ctrl = controller(temp_dir.path());
        assert!(matches!(ctrl.find(""), Err(Error::BackupNotFound { .. })));
    }
}
