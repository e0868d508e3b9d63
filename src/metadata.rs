//! On-disk `backup.json` schema

use crate::backup_file::{FileKind, KNOWN_NAMES};
use crate::checksum::Checksum;
use crate::device::DeviceInfo;
use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Metadata format version
pub const METADATA_VERSION: u32 = 1;

/// File name of the metadata inside a backup directory
pub const METADATA_FILE: &str = "backup.json";

fn first_version() -> u32 {
    1
}

/// A clean backup file as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileRecord {
    pub name: String,
    pub btype: FileKind,
    pub mountpoint: String,
    pub size: u64,
    pub checksum: Checksum,
}

/// Everything `backup.json` holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupRecord {
    /// Files written before versioning carry no version field
    #[serde(default = "first_version")]
    pub version: u32,
    pub bid: String,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    pub complete: bool,
    pub device_info: DeviceInfo,
    pub files: Vec<FileRecord>,
}

impl BackupRecord {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Read and validate a metadata file; any defect is an error
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let record: BackupRecord =
            serde_json::from_reader(reader).map_err(|e| Error::InvalidMetadata {
                reason: format!("{}: {}", path.display(), e),
            })?;
        record.validate()?;
        Ok(record)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(Error::InvalidMetadata { reason });

        if self.version != METADATA_VERSION {
            return invalid(format!(
                "unsupported metadata version: {} (expected {})",
                self.version, METADATA_VERSION
            ));
        }
        if self.bid.trim().is_empty() {
            return invalid("empty backup id".to_string());
        }
        if self.created().is_none() {
            return invalid(format!("timestamp {} out of range", self.timestamp));
        }
        if self.complete && self.files.is_empty() {
            return invalid(format!("backup {} is complete but has no files", self.bid));
        }
        for file in &self.files {
            if !KNOWN_NAMES.contains(&file.name.as_str()) {
                return invalid(format!("backup {} lists unknown file `{}`", self.bid, file.name));
            }
            if file.mountpoint.is_empty() {
                return invalid(format!("file {} has no mountpoint", file.name));
            }
            if file.checksum.is_empty() {
                return invalid(format!("file {} has no checksum", file.name));
            }
        }
        Ok(())
    }

    /// Creation time, if the stored timestamp is representable
    pub fn created(&self) -> Option<DateTime<Utc>> {
        from_epoch_seconds(self.timestamp)
    }
}

pub fn to_epoch_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_micros() as f64 / 1_000_000.0
}

pub fn from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let micros = (seconds * 1_000_000.0).round();
    if micros.abs() > i64::MAX as f64 {
        return None;
    }
    Utc.timestamp_micros(micros as i64).single()
}
