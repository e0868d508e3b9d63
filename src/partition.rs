//! Partition offsets from captured `fdisk -l` output
//!
//! Backups keep the partition table only as the text the device printed, so
//! offsets are scraped from that text. [`resolve_offset`] is the single
//! entry point; a structured partition-table reader can replace it as long
//! as it returns the same byte ranges.

use crate::{Error, Result};

/// Whole-disk device that full-disk backups are taken from
pub const MAIN_DISK: &str = "/dev/mmcblk1";

const BOOT_FLAG: char = '*';

/// Byte range of a partition inside a whole-disk image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionExtent {
    pub start: u64,
    pub length: u64,
}

impl PartitionExtent {
    /// First byte past the partition
    pub fn end(&self) -> Result<u64> {
        self.start.checked_add(self.length).ok_or_else(|| Error::Parse {
            reason: format!(
                "partition at byte {} with {} bytes overflows a byte offset",
                self.start, self.length
            ),
        })
    }
}

/// Locate `mountpoint` inside the image of [`MAIN_DISK`]
pub fn resolve_offset(table: &str, mountpoint: &str) -> Result<PartitionExtent> {
    resolve_offset_on(table, MAIN_DISK, mountpoint)
}

/// Locate `mountpoint` inside the image of `disk`
pub fn resolve_offset_on(table: &str, disk: &str, mountpoint: &str) -> Result<PartitionExtent> {
    let sector_size = sector_size(table, disk)?;
    let columns = ColumnLayout::detect(table);

    let line = table
        .lines()
        .find(|line| is_partition_line(line, mountpoint))
        .ok_or_else(|| Error::Parse {
            reason: format!("no partition table entry for {}", mountpoint),
        })?;

    let cleaned = line.replace(BOOT_FLAG, " ");
    let fields: Vec<&str> = cleaned.split_whitespace().collect();
    let (start_sector, sector_count) = columns.read(&fields, mountpoint)?;

    if sector_count == 0 {
        return Err(Error::Parse {
            reason: format!("partition {} has no sectors", mountpoint),
        });
    }

    let to_bytes = |sectors: u64| {
        sectors.checked_mul(sector_size).ok_or_else(|| Error::Parse {
            reason: format!("{} sectors of {} bytes overflow a byte offset", sectors, sector_size),
        })
    };
    let extent = PartitionExtent {
        start: to_bytes(start_sector)?,
        length: to_bytes(sector_count)?,
    };
    extent.end()?;
    Ok(extent)
}

/// Bytes per sector from the `Disk <path>: ..., <N1> bytes, <N2> sectors` header
pub fn sector_size(table: &str, disk: &str) -> Result<u64> {
    let prefix = format!("Disk {}", disk);
    let header = table
        .lines()
        .find(|line| {
            line.strip_prefix(&prefix)
                .is_some_and(|rest| rest.starts_with(':'))
        })
        .ok_or_else(|| Error::Parse {
            reason: format!("no disk header for {}", disk),
        })?;

    let fields: Vec<&str> = header.split_whitespace().collect();
    let bytes = number_before(&fields, "bytes").ok_or_else(|| Error::Parse {
        reason: format!("no byte count in disk header: {}", header),
    })?;
    let sectors = number_before(&fields, "sectors").ok_or_else(|| Error::Parse {
        reason: format!("no sector count in disk header: {}", header),
    })?;

    if sectors == 0 || bytes % sectors != 0 {
        return Err(Error::Parse {
            reason: format!("{} bytes do not divide into {} sectors", bytes, sectors),
        });
    }
    Ok(bytes / sectors)
}

fn number_before(fields: &[&str], unit: &str) -> Option<u64> {
    fields
        .iter()
        .position(|f| f.trim_end_matches(',') == unit)
        .filter(|&i| i > 0)
        .and_then(|i| fields[i - 1].parse().ok())
}

fn is_partition_line(line: &str, mountpoint: &str) -> bool {
    // "/dev/mmcblk1p1" must not match "/dev/mmcblk1p10"
    line.strip_prefix(mountpoint)
        .is_some_and(|rest| rest.starts_with(|c: char| c.is_whitespace() || c == BOOT_FLAG))
}

/// Where the start and sector-count columns sit in a partition line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnLayout {
    /// Indexes counted from the device column, taken from the header row
    FromHeader { start: usize, sectors: usize },
    /// Positions counted from the end of the line; assumes a one-word type
    FromEnd,
}

impl ColumnLayout {
    fn detect(table: &str) -> Self {
        table
            .lines()
            .find(|line| line.trim_start().starts_with("Device"))
            .and_then(|header| {
                // The boot column is blank on most rows, so it is not counted.
                let columns: Vec<&str> = header
                    .split_whitespace()
                    .filter(|c| *c != "Boot")
                    .collect();
                let start = columns
                    .iter()
                    .position(|c| *c == "StartLBA" || *c == "Start")?;
                let sectors = columns.iter().position(|c| *c == "Sectors")?;
                Some(ColumnLayout::FromHeader { start, sectors })
            })
            .unwrap_or(ColumnLayout::FromEnd)
    }

    fn read(self, fields: &[&str], mountpoint: &str) -> Result<(u64, u64)> {
        let (start_idx, sectors_idx) = match self {
            ColumnLayout::FromHeader { start, sectors } => (Some(start), Some(sectors)),
            ColumnLayout::FromEnd => (
                fields.len().checked_sub(6),
                fields.len().checked_sub(4),
            ),
        };

        let parse = |idx: Option<usize>, what: &str| -> Result<u64> {
            idx.and_then(|i| fields.get(i))
                .and_then(|f| f.parse::<u64>().ok())
                .ok_or_else(|| Error::Parse {
                    reason: format!("no numeric {} column for {}", what, mountpoint),
                })
        };

        Ok((parse(start_idx, "start")?, parse(sectors_idx, "sector count")?))
    }
}
