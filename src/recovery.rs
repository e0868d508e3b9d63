//! Recovery-mode transitions around backup and restore sequences

use crate::channel::{RemoteChannel, RunOptions};
use crate::Result;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Marker left on the device while it waits inside a backup session
pub const BACKUP_WAIT_PIDFILE: &str = "/var/run/bakwait.pid";

/// Moves the device into and out of its recovery OS.
///
/// Calls block until the transition settles and report success.
pub trait RecoveryController: Send + Sync {
    fn enter_recovery_mode(&self, load_info: bool) -> bool;

    fn leave_recovery_mode(&self) -> bool;

    /// Verify or re-establish the link to the recovery OS, once
    fn reconnect(&self, load_info: bool) -> bool;
}

/// Run `op` with the device in recovery mode.
///
/// Returns `None` without running `op` when the device could not enter
/// recovery mode. Leaving is always attempted afterwards.
pub fn with_recovery_mode<T>(
    recovery: &dyn RecoveryController,
    load_info: bool,
    op: impl FnOnce() -> T,
) -> Option<T> {
    if !recovery.enter_recovery_mode(load_info) {
        error!("Could not enter recovery mode");
        leave(recovery);
        return None;
    }

    let result = op();
    leave(recovery);
    Some(result)
}

fn leave(recovery: &dyn RecoveryController) {
    if !recovery.leave_recovery_mode() {
        error!(
            "Could not leave recovery mode; the device may be stuck. \
             Hold the power button for 10 seconds, release it, then power on normally"
        );
    }
}

/// Whether the device was left waiting in a backup session
pub fn detect_stuck_backup_mode(channel: &dyn RemoteChannel) -> Result<bool> {
    info!("Checking for a stuck backup session");
    let command = format!("test -e {} && echo $?", BACKUP_WAIT_PIDFILE);
    let output = channel.run(&command, &RunOptions::default())?;
    if output.has_error() {
        warn!("Stuck backup check failed: {}", output.stderr_text());
        return Ok(false);
    }
    Ok(output.text() == "0")
}

/// Recovery controller for a device whose shell is already reachable.
///
/// Transitions only verify the link; reconnecting polls it a bounded
/// number of times.
pub struct ConnectedRecovery {
    channel: Arc<dyn RemoteChannel>,
    attempts: u32,
    interval: Duration,
}

impl ConnectedRecovery {
    pub fn new(channel: Arc<dyn RemoteChannel>) -> Self {
        Self {
            channel,
            attempts: 5,
            interval: Duration::from_secs(2),
        }
    }

    pub fn with_polling(mut self, attempts: u32, interval: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.interval = interval;
        self
    }
}

impl RecoveryController for ConnectedRecovery {
    fn enter_recovery_mode(&self, _load_info: bool) -> bool {
        self.channel.is_connected()
    }

    fn leave_recovery_mode(&self) -> bool {
        self.channel.is_connected()
    }

    fn reconnect(&self, _load_info: bool) -> bool {
        for attempt in 1..=self.attempts {
            if self.channel.is_connected() {
                info!("Device link verified on attempt {}", attempt);
                return true;
            }
            if attempt < self.attempts {
                thread::sleep(self.interval);
            }
        }
        false
    }
}
