//! In-memory tablet used by unit tests

use crate::channel::{CommandOutput, CommandStream, RemoteChannel, RunOptions};
use crate::checksum::Checksum;
use crate::recovery::RecoveryController;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::io::{self, Cursor, Write};
use std::ops::Range;
use std::sync::{Arc, Mutex};

pub const SERIAL: &str = "RM100-315-12345";
pub const OSVER: &str = "Codex Linux 3.5.2";

const SECTOR: usize = 512;
const DISK_SECTORS: usize = 128;
const BOOT_SIZE: usize = 4 * SECTOR;

/// (name, start sector, sector count)
const PARTITIONS: &[(&str, usize, usize)] = &[
    ("mmcblk1p1", 8, 16),
    ("mmcblk1p2", 24, 24),
    ("mmcblk1p3", 48, 24),
    ("mmcblk1p4", 72, 56),
    ("mmcblk1p5", 74, 16),
    ("mmcblk1p6", 92, 16),
    ("mmcblk1p7", 110, 18),
];

const PARTITION_TABLE: &str = "\
Disk /dev/mmcblk1: 0 MB, 65536 bytes, 128 sectors
2 cylinders, 4 heads, 16 sectors/track
Units: sectors of 1 * 512 = 512 bytes

Device       Boot StartCHS    EndCHS        StartLBA     EndLBA    Sectors  Size Id Type
/dev/mmcblk1p1 *  0,0,9       0,1,8                8         23         16 8192  c Win95 FAT32 (LBA)
/dev/mmcblk1p2    0,1,9       0,2,16              24         47         24 12.0K 83 Linux
/dev/mmcblk1p3    0,3,1       0,3,8               48         71         24 12.0K 83 Linux
/dev/mmcblk1p4    0,3,9       1,3,16              72        127         56 28.0K  5 Extended
/dev/mmcblk1p5    0,3,11      1,1,10              74         89         16 8192 83 Linux
/dev/mmcblk1p6    1,1,13      1,2,12              92        107         16 8192 83 Linux
/dev/mmcblk1p7    1,2,15      1,3,16             110        127         18 9216 83 Linux
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Store {
    Disk,
    Boot0,
    Boot1,
}

struct State {
    disk: Vec<u8>,
    boot0: Vec<u8>,
    boot1: Vec<u8>,
    boot0_read_only: bool,
    connected: bool,
    reconnect_ok: bool,
    reconnects: usize,
    stuck_backup: bool,
    osver: String,
    serial: String,
    failing_writes: HashMap<String, u32>,
    link_cuts: HashSet<String>,
    corrupt_writes: HashSet<String>,
    commands: Vec<String>,
}

impl State {
    fn locate(&self, mountpoint: &str) -> Option<(Store, Range<usize>)> {
        let name = mountpoint.strip_prefix("/dev/")?;
        match name {
            "mmcblk1" => Some((Store::Disk, 0..self.disk.len())),
            "mmcblk1boot0" => Some((Store::Boot0, 0..self.boot0.len())),
            "mmcblk1boot1" => Some((Store::Boot1, 0..self.boot1.len())),
            _ => PARTITIONS
                .iter()
                .find(|(n, _, _)| *n == name)
                .map(|(_, start, count)| {
                    (Store::Disk, start * SECTOR..(start + count) * SECTOR)
                }),
        }
    }

    fn store_mut(&mut self, store: Store) -> &mut Vec<u8> {
        match store {
            Store::Disk => &mut self.disk,
            Store::Boot0 => &mut self.boot0,
            Store::Boot1 => &mut self.boot1,
        }
    }

    fn read(&self, mountpoint: &str) -> Option<Vec<u8>> {
        let (store, range) = self.locate(mountpoint)?;
        let data = match store {
            Store::Disk => &self.disk,
            Store::Boot0 => &self.boot0,
            Store::Boot1 => &self.boot1,
        };
        Some(data[range].to_vec())
    }
}

fn pattern(len: usize, seed: u32) -> Vec<u8> {
    (0..len as u32)
        .map(|i| (i.wrapping_mul(31).wrapping_add(i / 512).wrapping_add(seed) % 251) as u8)
        .collect()
}

/// A tablet reachable over a scripted shell.
///
/// Answers the device queries the engine sends, keeps its block devices in
/// memory and records every command it receives.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<State>>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        let state = State {
            disk: pattern(DISK_SECTORS * SECTOR, 0),
            boot0: pattern(BOOT_SIZE, 7),
            boot1: pattern(BOOT_SIZE, 13),
            boot0_read_only: true,
            connected: true,
            reconnect_ok: true,
            reconnects: 0,
            stuck_backup: false,
            osver: OSVER.to_string(),
            serial: SERIAL.to_string(),
            failing_writes: HashMap::new(),
            link_cuts: HashSet::new(),
            corrupt_writes: HashSet::new(),
            commands: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn partition_table(&self) -> String {
        PARTITION_TABLE.to_string()
    }

    pub fn contents(&self, mountpoint: &str) -> Vec<u8> {
        self.state.lock().unwrap().read(mountpoint).unwrap()
    }

    /// Replace a block device's bytes; partitions keep their size
    pub fn set_contents(&self, mountpoint: &str, data: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        let (store, range) = state.locate(mountpoint).unwrap();
        assert_eq!(range.len(), data.len(), "size of {} is fixed", mountpoint);
        state.store_mut(store)[range].copy_from_slice(&data);
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().unwrap().connected = connected;
    }

    pub fn set_reconnect_ok(&self, ok: bool) {
        self.state.lock().unwrap().reconnect_ok = ok;
    }

    pub fn reconnects(&self) -> usize {
        self.state.lock().unwrap().reconnects
    }

    pub fn set_stuck_backup(&self, stuck: bool) {
        self.state.lock().unwrap().stuck_backup = stuck;
    }

    pub fn set_osver(&self, osver: &str) {
        self.state.lock().unwrap().osver = osver.to_string();
    }

    pub fn set_serial(&self, serial: &str) {
        self.state.lock().unwrap().serial = serial.to_string();
    }

    /// Break the next `times` writes to `mountpoint` as if the link dropped
    pub fn fail_writes_to(&self, mountpoint: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .failing_writes
            .insert(mountpoint.to_string(), times);
    }

    /// Take the link down in the middle of the next write to `mountpoint`.
    /// Every command fails until a successful [`RecoveryController::reconnect`].
    pub fn cut_link_during_write_to(&self, mountpoint: &str) {
        self.state
            .lock()
            .unwrap()
            .link_cuts
            .insert(mountpoint.to_string());
    }

    /// Flip a byte of everything written to `mountpoint` from now on
    pub fn corrupt_writes_to(&self, mountpoint: &str) {
        self.state
            .lock()
            .unwrap()
            .corrupt_writes
            .insert(mountpoint.to_string());
    }

    pub fn is_read_only(&self, mountpoint: &str) -> bool {
        mountpoint == "/dev/mmcblk1boot0" && self.state.lock().unwrap().boot0_read_only
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Mountpoints written through `cat >`, in order
    pub fn writes(&self) -> Vec<String> {
        self.commands()
            .iter()
            .filter_map(|c| c.strip_prefix("cat > \""))
            .map(|rest| rest.trim_end_matches('"').to_string())
            .collect()
    }

    fn enter(&self, command: &str) -> Result<std::sync::MutexGuard<'_, State>> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.to_string());
        if !state.connected {
            return Err(Error::ConnectionLost {
                reason: "device not reachable".to_string(),
            });
        }
        Ok(state)
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn ok(stdout: impl Into<Vec<u8>>) -> Result<CommandOutput> {
    Ok(CommandOutput {
        stdout: stdout.into(),
        stderr: Vec::new(),
    })
}

fn failed(stderr: impl Into<Vec<u8>>) -> Result<CommandOutput> {
    Ok(CommandOutput {
        stdout: Vec::new(),
        stderr: stderr.into(),
    })
}

fn word(command: &str, index: usize) -> &str {
    command.split_whitespace().nth(index).unwrap_or_default()
}

impl RemoteChannel for SimulatedDevice {
    fn run(&self, command: &str, _options: &RunOptions) -> Result<CommandOutput> {
        let mut state = self.enter(command)?;

        if command == "true" {
            return ok("");
        }
        if command.starts_with("sed -n 's/^PRETTY_NAME=") {
            return ok(format!("{}\n", state.osver));
        }
        if command == "cat /sys/devices/soc0/serial_number" {
            return ok(format!("{}\n", state.serial));
        }
        if command == "cat /proc/cmdline" {
            return ok("console=ttymxc0 root=/dev/mmcblk1p2 rootwait\n");
        }
        if command == "/sbin/fdisk -l /dev/mmcblk1" {
            return ok(PARTITION_TABLE);
        }
        if command.starts_with("/sbin/fdisk -l ") {
            let mountpoint = word(command, 2);
            return match state.read(mountpoint) {
                Some(data) => ok(format!("{}\n", data.len())),
                None => failed(format!("fdisk: can't open '{}'\n", mountpoint)),
            };
        }
        if command.starts_with("md5sum ") {
            let mountpoint = word(command, 1);
            return match state.read(mountpoint) {
                Some(data) => ok(format!("{}\n", Checksum::from_bytes(&data))),
                None => failed(format!("md5sum: {}: No such file or directory\n", mountpoint)),
            };
        }
        if command.starts_with("echo ") && command.ends_with("/sys/block/mmcblk1boot0/force_ro") {
            state.boot0_read_only = word(command, 1) == "1";
            return ok("");
        }
        if command.starts_with("test -e /var/run/bakwait.pid") {
            return ok(if state.stuck_backup { "0\n" } else { "" });
        }

        failed(format!("sh: unknown command: {}\n", command))
    }

    fn open(&self, command: &str, _options: &RunOptions) -> Result<CommandStream> {
        let mut state = self.enter(command)?;

        if let Some(rest) = command.strip_prefix("dd if=") {
            let mountpoint = rest.split_whitespace().next().unwrap_or_default();
            let (stdout, stderr) = match state.read(mountpoint) {
                Some(data) => {
                    let records = data.len().div_ceil(4 << 20);
                    let stats = format!(
                        "{0}+0 records in\n{0}+0 records out\n{1} bytes copied\n",
                        records,
                        data.len()
                    );
                    (data, stats.into_bytes())
                }
                None => (
                    Vec::new(),
                    format!("dd: can't open '{}': No such file or directory\n", mountpoint)
                        .into_bytes(),
                ),
            };
            return Ok(CommandStream {
                stdout: Box::new(Cursor::new(stdout)),
                stderr: Box::new(Cursor::new(stderr)),
                stdin: None,
            });
        }

        if let Some(rest) = command.strip_prefix("cat > \"") {
            let mountpoint = rest.trim_end_matches('"').to_string();
            let broken = match state.failing_writes.get_mut(&mountpoint) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            let cut = state.link_cuts.remove(&mountpoint);
            if cut {
                state.connected = false;
            }
            let writer = DeviceWriter {
                state: Arc::clone(&self.state),
                corrupt: state.corrupt_writes.contains(&mountpoint),
                read_only: mountpoint == "/dev/mmcblk1boot0" && state.boot0_read_only,
                mountpoint,
                broken: broken || cut,
                buffer: Vec::new(),
            };
            return Ok(CommandStream {
                stdout: Box::new(io::empty()),
                stderr: Box::new(io::empty()),
                stdin: Some(Box::new(writer)),
            });
        }

        Ok(CommandStream {
            stdout: Box::new(io::empty()),
            stderr: Box::new(Cursor::new(
                format!("sh: unknown command: {}\n", command).into_bytes(),
            )),
            stdin: None,
        })
    }
}

impl RecoveryController for SimulatedDevice {
    fn enter_recovery_mode(&self, _load_info: bool) -> bool {
        self.state.lock().unwrap().connected
    }

    fn leave_recovery_mode(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn reconnect(&self, _load_info: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        state.reconnects += 1;
        if state.reconnect_ok {
            state.connected = true;
        }
        state.reconnect_ok
    }
}

/// Stdin of `cat > <device>`; lands on the device when closed
struct DeviceWriter {
    state: Arc<Mutex<State>>,
    mountpoint: String,
    broken: bool,
    corrupt: bool,
    read_only: bool,
    buffer: Vec<u8>,
}

impl Write for DeviceWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link dropped"));
        }
        if self.read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "Operation not permitted",
            ));
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for DeviceWriter {
    fn drop(&mut self) {
        if self.broken || self.read_only || self.buffer.is_empty() {
            return;
        }
        if self.corrupt {
            self.buffer[0] ^= 0xff;
        }
        let mut state = self.state.lock().unwrap();
        if let Some((store, range)) = state.locate(&self.mountpoint) {
            let n = range.len().min(self.buffer.len());
            let start = range.start;
            state.store_mut(store)[start..start + n].copy_from_slice(&self.buffer[..n]);
        }
    }
}
