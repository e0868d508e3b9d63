//! Which partitions each kind of backup takes

use crate::backup_file::FileKind;
use crate::device::DeviceInfo;

/// One file to take: (name, kind, mountpoint)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    pub name: String,
    pub kind: FileKind,
    pub mountpoint: String,
}

impl FileSpec {
    /// Raw dump of `/dev/<name>`
    pub fn bin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FileKind::Bin,
            mountpoint: format!("/dev/{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupPreset {
    Full,
    Os,
    Data,
}

impl BackupPreset {
    pub const ALL: [BackupPreset; 3] = [BackupPreset::Full, BackupPreset::Os, BackupPreset::Data];

    pub fn label(&self) -> &'static str {
        match self {
            BackupPreset::Full => "Full (OS + Data)",
            BackupPreset::Os => "Only OS",
            BackupPreset::Data => "Only Data",
        }
    }

    /// Files in the order they are taken and later restored
    pub fn specs(&self) -> Vec<FileSpec> {
        let names: &[&str] = match self {
            BackupPreset::Full => &["mmcblk1boot0", "mmcblk1boot1", "mmcblk1"],
            BackupPreset::Os => &[
                "mmcblk1boot0",
                "mmcblk1boot1",
                "mmcblk1p1",
                "mmcblk1p2",
                "mmcblk1p3",
            ],
            BackupPreset::Data => &["mmcblk1p5", "mmcblk1p6", "mmcblk1p7"],
        };
        names.iter().map(|name| FileSpec::bin(name)).collect()
    }

    /// Presets that make sense for the connected device
    pub fn offered(device: &DeviceInfo) -> Vec<BackupPreset> {
        if !device.is_supported_model() {
            return Vec::new();
        }
        if device.is_vendor_fork() {
            return vec![BackupPreset::Full];
        }
        Self::ALL.to_vec()
    }
}
