//! Device information snapshot and compatibility gates

use crate::channel::{RemoteChannel, RunOptions};
use crate::partition::MAIN_DISK;
use crate::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

/// Model numbers the block-level backup layout is known for
pub const SUPPORTED_MODELS: &[&str] = &["RM100", "RM102"];

/// OS-version marker of the vendor fork that OS and Data restores refuse
pub const VENDOR_FORK_MARKER: &str = "Parabola";

/// Frozen copy of what the device reported when a backup was taken
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceInfo {
    pub osver: String,
    pub serial: String,
    pub model: String,
    pub kernel_bootargs: String,
    /// Raw `fdisk -l` output of the main disk, stored base64-encoded
    #[serde(
        serialize_with = "encode_table",
        deserialize_with = "decode_table"
    )]
    pub partition_table: String,
}

impl DeviceInfo {
    /// Collect a snapshot from the connected device.
    ///
    /// Individual values that cannot be read are left empty and logged;
    /// only a dead channel fails the whole query.
    pub fn query(channel: &dyn RemoteChannel) -> Result<Self> {
        debug!("Collecting device info");

        let osver = query_value(
            channel,
            "sed -n 's/^PRETTY_NAME=//p' /etc/os-release | tr -d '\"'",
        )?;
        let serial = query_value(channel, "cat /sys/devices/soc0/serial_number")?;
        let kernel_bootargs = query_value(channel, "cat /proc/cmdline")?;
        let partition_table = query_value(channel, &format!("/sbin/fdisk -l {}", MAIN_DISK))?;

        Ok(Self {
            model: model_from_serial(&serial),
            osver,
            serial,
            kernel_bootargs,
            partition_table,
        })
    }

    /// Whether the backup engine knows this model's storage layout
    pub fn is_supported_model(&self) -> bool {
        SUPPORTED_MODELS.contains(&self.model.as_str())
    }

    /// Whether the OS version names the vendor fork
    pub fn is_vendor_fork(&self) -> bool {
        self.osver.contains(VENDOR_FORK_MARKER)
    }
}

/// Model number is the first dash-separated group of the serial, e.g. `RM100`
pub fn model_from_serial(serial: &str) -> String {
    serial.split('-').next().unwrap_or_default().trim().to_string()
}

fn query_value(channel: &dyn RemoteChannel, command: &str) -> Result<String> {
    let output = channel.run(command, &RunOptions::default())?;
    if output.has_error() {
        warn!("Device info query `{}` failed: {}", command, output.stderr_text());
        return Ok(String::new());
    }
    Ok(output.text())
}

fn encode_table<S: Serializer>(table: &str, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(table.as_bytes()))
}

fn decode_table<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(serde::de::Error::custom)?;
    String::from_utf8(bytes).map_err(serde::de::Error::custom)
}
