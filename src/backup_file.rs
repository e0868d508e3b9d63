//! A single partition or whole-disk image inside a backup

use crate::channel::{RemoteChannel, RunOptions};
use crate::checksum::{copy_chunked, hash_file, Checksum, Direction};
use crate::config::EngineSettings;
use crate::metadata::FileRecord;
use crate::{CancellationToken, Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Boot partition that the kernel keeps read-only unless told otherwise
pub const BOOTLOADER_DEVICE: &str = "/dev/mmcblk1boot0";

const BOOTLOADER_FORCE_RO: &str = "/sys/block/mmcblk1boot0/force_ro";

/// Names a backup file may carry
pub const KNOWN_NAMES: &[&str] = &[
    "mmcblk1",
    "mmcblk1boot0",
    "mmcblk1boot1",
    "mmcblk1p1",
    "mmcblk1p2",
    "mmcblk1p3",
    "mmcblk1p4",
    "mmcblk1p5",
    "mmcblk1p6",
    "mmcblk1p7",
];

/// How a file's bytes are taken from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Raw block dump
    Bin,
    /// Filesystem archive; recognised but not implemented
    Tar,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Bin => "bin",
            FileKind::Tar => "tar",
        }
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FileKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bin" => Ok(FileKind::Bin),
            "tar" => Ok(FileKind::Tar),
            other => Err(Error::InvalidMetadata {
                reason: format!("unknown backup file type `{}`", other),
            }),
        }
    }
}

/// One physical unit of a backup.
///
/// Size and checksum are resolved once, either from the device before the
/// first dump or from persisted metadata, and never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    name: String,
    kind: FileKind,
    mountpoint: String,
    size: Option<u64>,
    checksum: Option<Checksum>,
    dirty: bool,
}

impl BackupFile {
    /// A file that still has to be taken from the device
    pub fn new(name: impl Into<String>, kind: FileKind, mountpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            mountpoint: mountpoint.into(),
            size: None,
            checksum: None,
            dirty: true,
        }
    }

    /// A file loaded from `backup.json`; only clean files are ever persisted
    pub fn from_record(record: FileRecord) -> Self {
        Self {
            name: record.name,
            kind: record.btype,
            mountpoint: record.mountpoint,
            size: Some(record.size),
            checksum: Some(record.checksum),
            dirty: false,
        }
    }

    /// Persistable form, or `None` while the file is dirty
    pub fn to_record(&self) -> Option<FileRecord> {
        if self.dirty {
            return None;
        }
        Some(FileRecord {
            name: self.name.clone(),
            btype: self.kind,
            mountpoint: self.mountpoint.clone(),
            size: self.size?,
            checksum: self.checksum.clone()?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn mountpoint(&self) -> &str {
        &self.mountpoint
    }

    /// Size in bytes; zero until resolved
    pub fn size(&self) -> u64 {
        self.size.unwrap_or(0)
    }

    pub fn checksum(&self) -> Option<&Checksum> {
        self.checksum.as_ref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// File name inside the backup's `files/` directory
    pub fn filename(&self) -> String {
        format!("{}.{}", self.name, self.kind)
    }

    /// Ask the device for this file's size and content hash.
    ///
    /// Values already known are kept as they are.
    pub fn resolve_size_and_checksum(
        &mut self,
        channel: &dyn RemoteChannel,
        settings: &EngineSettings,
    ) -> Result<()> {
        if self.kind != FileKind::Bin {
            return Err(Error::UnsupportedKind {
                kind: self.kind.to_string(),
            });
        }

        if self.size.is_none() {
            let command = size_command(&self.mountpoint);
            let output = channel
                .run(&command, &RunOptions::with_timeout(settings.query_timeout))?
                .check(&command)?;
            let size = output.text().parse::<u64>().map_err(|_| Error::DeviceQuery {
                command: command.clone(),
                stderr: format!("unexpected size output `{}`", output.text()),
            })?;
            debug!("{} is {} bytes", self.mountpoint, size);
            self.size = Some(size);
        }

        if self.checksum.is_none() {
            info!("Getting checksum of {}", self.mountpoint);
            self.checksum = Some(device_checksum(channel, &self.mountpoint, settings)?);
        }

        Ok(())
    }

    /// Copy the device contents into `dest`, verifying the result.
    ///
    /// Polls `cancel` before each chunk; a cancelled or failed dump leaves
    /// whatever was written in place for the caller to clean up.
    pub fn dump_from_device(
        &mut self,
        channel: &dyn RemoteChannel,
        dest: &Path,
        cancel: &CancellationToken,
        on_bytes: &mut dyn FnMut(u64),
    ) -> bool {
        match self.try_dump(channel, dest, cancel, on_bytes) {
            Ok(()) => true,
            Err(Error::Cancelled) => {
                info!("Backup of {} cancelled", self.name);
                false
            }
            Err(e) => {
                error!("Backup of {} failed: {}", self.name, e);
                false
            }
        }
    }

    fn try_dump(
        &mut self,
        channel: &dyn RemoteChannel,
        dest: &Path,
        cancel: &CancellationToken,
        on_bytes: &mut dyn FnMut(u64),
    ) -> Result<()> {
        if self.kind != FileKind::Bin {
            return Err(Error::UnsupportedKind {
                kind: self.kind.to_string(),
            });
        }
        let expected = self.checksum.clone().ok_or_else(|| Error::InvalidMetadata {
            reason: format!("{} has no recorded checksum", self.name),
        })?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dest)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    warn!("Refusing to overwrite backup data at {}", dest.display());
                }
                Error::Io(e)
            })?;
        let mut out = BufWriter::new(out);

        info!("Dumping {} ({} bytes) to {}", self.mountpoint, self.size(), dest.display());
        let command = format!("dd if={} bs=4M", self.mountpoint);
        let mut stream = channel.open(&command, &RunOptions::default())?;

        let outcome = copy_chunked(
            &mut stream.stdout,
            &mut out,
            None,
            Direction::FromDevice,
            || !cancel.is_cancelled(),
            |chunk| on_bytes(chunk.len() as u64),
        )?;
        drop(out);
        drop(stream);

        if outcome.cancelled {
            return Err(Error::Cancelled);
        }

        let actual = hash_file(dest)?;
        if actual != expected {
            error!("Backup file does not match: wanted {}, got {}", expected, actual);
            return Err(Error::ChecksumMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        info!("Backup file {} matches", self.filename());
        self.dirty = false;
        Ok(())
    }

    /// Whether the local copy at `path` still hashes to the recorded checksum
    pub fn verify_local_copy(&self, path: &Path) -> bool {
        let Some(expected) = &self.checksum else {
            error!("{} has no recorded checksum", self.name);
            return false;
        };
        match hash_file(path) {
            Ok(actual) if &actual == expected => true,
            Ok(actual) => {
                error!(
                    "Checksum of {} does not match: recorded {}, found {}",
                    path.display(),
                    expected,
                    actual
                );
                false
            }
            Err(e) => {
                error!("Could not hash {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Write `length` bytes of the local copy, starting at `start`, to `mountpoint`.
    ///
    /// The local copy must already have passed [`verify_local_copy`]. The
    /// device is checked afterwards against the hash of the bytes actually
    /// sent. `on_progress` receives the fraction written (0.0-1.0).
    ///
    /// [`verify_local_copy`]: BackupFile::verify_local_copy
    #[allow(clippy::too_many_arguments)]
    pub fn restore_to_device(
        &self,
        channel: &dyn RemoteChannel,
        source: &Path,
        mountpoint: &str,
        start: u64,
        length: u64,
        settings: &EngineSettings,
        on_progress: &mut dyn FnMut(f64),
    ) -> bool {
        info!(
            "Restoring {} -> {}, start={}, length={}",
            self.name, mountpoint, start, length
        );

        let bootloader = mountpoint == BOOTLOADER_DEVICE;
        if bootloader {
            if let Err(e) = set_force_ro(channel, false) {
                error!("Problem unlocking bootloader for writing: {}", e);
                return false;
            }
        }

        let result = self.write_and_verify(
            channel,
            source,
            mountpoint,
            start,
            length,
            settings,
            on_progress,
        );

        if bootloader {
            if let Err(e) = set_force_ro(channel, true) {
                // Cleared again by the next reboot.
                error!("Problem locking bootloader read-only: {}", e);
            }
        }

        match result {
            Ok(()) => true,
            Err(e) if e.is_connection_lost() => {
                error!(
                    "Lost the device while restoring {} to {}: {}",
                    self.name, mountpoint, e
                );
                false
            }
            Err(e) => {
                error!("Restoring {} to {} failed: {}", self.name, mountpoint, e);
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write_and_verify(
        &self,
        channel: &dyn RemoteChannel,
        source: &Path,
        mountpoint: &str,
        start: u64,
        length: u64,
        settings: &EngineSettings,
        on_progress: &mut dyn FnMut(f64),
    ) -> Result<()> {
        let mut file = File::open(source)?;
        file.seek(SeekFrom::Start(start))?;

        let command = format!("cat > \"{}\"", mountpoint);
        let mut stream = channel.open(&command, &RunOptions::writable())?;
        let mut stdin = stream.stdin.take().ok_or_else(|| Error::ConnectionLost {
            reason: "write sink has no stdin".to_string(),
        })?;

        let mut sent = 0u64;
        let outcome = copy_chunked(
            &mut file,
            &mut stdin,
            Some(length),
            Direction::ToDevice,
            || true,
            |chunk| {
                sent += chunk.len() as u64;
                on_progress(if length == 0 { 1.0 } else { sent as f64 / length as f64 });
            },
        )?;
        drop(stdin);

        let stderr = stream.finish()?;
        if !stderr.is_empty() {
            return Err(Error::DeviceQuery {
                command,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        let on_device = device_checksum(channel, mountpoint, settings)?;
        if on_device != outcome.checksum {
            return Err(Error::ChecksumMismatch {
                expected: outcome.checksum.to_string(),
                actual: on_device.to_string(),
            });
        }

        debug!("{} verified on device as {}", mountpoint, on_device);
        Ok(())
    }
}

/// Remote command printing the byte size of a block device
pub fn size_command(mountpoint: &str) -> String {
    format!(
        "/sbin/fdisk -l {} | head -n 1 | awk -F'bytes' '{{print $1}}' | awk '{{print $NF}}'",
        mountpoint
    )
}

/// Content hash of a block device as computed on the device
pub fn device_checksum(
    channel: &dyn RemoteChannel,
    mountpoint: &str,
    settings: &EngineSettings,
) -> Result<Checksum> {
    let command = format!("md5sum {} | cut -d\" \" -f1", mountpoint);
    let output = channel
        .run(&command, &RunOptions::with_timeout(settings.checksum_timeout))?
        .check(&command)?;
    let checksum = Checksum::new(output.text());
    if checksum.is_empty() {
        return Err(Error::DeviceQuery {
            command,
            stderr: "empty checksum output".to_string(),
        });
    }
    Ok(checksum)
}

fn set_force_ro(channel: &dyn RemoteChannel, read_only: bool) -> Result<()> {
    let command = format!("echo {} > {}", u8::from(read_only), BOOTLOADER_FORCE_RO);
    channel.run(&command, &RunOptions::default())?.check(&command)?;
    Ok(())
}
