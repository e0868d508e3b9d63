//! Error types for the backup engine

use thiserror::Error;

/// Main error type for backup and restore operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Partition table parse error: {reason}")]
    Parse { reason: String },

    #[error("Device query failed for `{command}`: {stderr}")]
    DeviceQuery { command: String, stderr: String },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Connection to device lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Remote command timed out after {seconds}s: {command}")]
    Timeout { command: String, seconds: u64 },

    #[error("Invalid backup metadata: {reason}")]
    InvalidMetadata { reason: String },

    #[error("Backup kind `{kind}` is not supported")]
    UnsupportedKind { kind: String },

    #[error("Backup not found: {id}")]
    BackupNotFound { id: String },

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Operation cancelled by user")]
    Cancelled,
}

impl Error {
    /// Classify an I/O error raised while talking to the device.
    ///
    /// A closed pipe or a stream that ends early means the transport went
    /// away, which the restore sequence answers with a reconnect.
    pub fn from_stream(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => Error::ConnectionLost {
                reason: err.to_string(),
            },
            _ => Error::Io(err),
        }
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Error::ConnectionLost { .. })
    }
}

/// Result type alias for backup engine operations
pub type Result<T> = std::result::Result<T, Error>;
