//! Chunked streaming with an incrementally updated content hash
//!
//! The device side only offers `md5sum`, so every checksum in a backup is an
//! MD5 hex digest. Local copies, transfers and device queries are compared
//! through the same [`Checksum`] type.

use crate::{Error, Result};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Transfer chunk size in bytes
pub const CHUNK_SIZE: usize = 4096;

/// Hex-encoded content hash
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    /// Wrap a hex digest as printed by the device (case and whitespace insensitive)
    pub fn new(hex: impl AsRef<str>) -> Self {
        Self(hex.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        Self(hex::encode(Md5::digest(data)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hash accumulated over bytes as they stream past
#[derive(Clone, Default)]
pub struct RollingChecksum {
    hasher: Md5,
    bytes: u64,
}

impl RollingChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes hashed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> Checksum {
        Checksum(hex::encode(self.hasher.finalize()))
    }
}

/// Which end of a copy is the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    FromDevice,
    ToDevice,
}

/// Result of a chunked copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    pub bytes: u64,
    pub checksum: Checksum,
    pub cancelled: bool,
}

/// Copy `reader` into `writer` in [`CHUNK_SIZE`] pieces.
///
/// `keep_going` is polled before every chunk; returning `false` stops the
/// copy and marks the outcome cancelled. `on_chunk` sees each chunk after
/// it was written. With `limit` set exactly that many bytes are copied and
/// a short source is an error.
pub fn copy_chunked<R, W>(
    reader: &mut R,
    writer: &mut W,
    limit: Option<u64>,
    direction: Direction,
    mut keep_going: impl FnMut() -> bool,
    mut on_chunk: impl FnMut(&[u8]),
) -> Result<CopyOutcome>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let read_err = |e: io::Error| match direction {
        Direction::FromDevice => Error::from_stream(e),
        Direction::ToDevice => Error::Io(e),
    };
    let write_err = |e: io::Error| match direction {
        Direction::FromDevice => Error::Io(e),
        Direction::ToDevice => Error::from_stream(e),
    };

    let mut buffer = [0u8; CHUNK_SIZE];
    let mut rolling = RollingChecksum::new();
    let mut cancelled = false;

    loop {
        let want = match limit {
            Some(limit) => {
                let remaining = limit - rolling.bytes();
                if remaining == 0 {
                    break;
                }
                remaining.min(CHUNK_SIZE as u64) as usize
            }
            None => CHUNK_SIZE,
        };

        if !keep_going() {
            cancelled = true;
            break;
        }

        let n = reader.read(&mut buffer[..want]).map_err(read_err)?;
        if n == 0 {
            if let Some(limit) = limit {
                return Err(read_err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("source ended after {} of {} bytes", rolling.bytes(), limit),
                )));
            }
            break;
        }

        let chunk = &buffer[..n];
        writer.write_all(chunk).map_err(write_err)?;
        rolling.update(chunk);
        on_chunk(chunk);
    }

    writer.flush().map_err(write_err)?;

    Ok(CopyOutcome {
        bytes: rolling.bytes(),
        checksum: rolling.finalize(),
        cancelled,
    })
}

/// Hash everything a reader yields, chunk by chunk
pub fn hash_reader<R: Read + ?Sized>(reader: &mut R) -> io::Result<Checksum> {
    let mut buffer = [0u8; CHUNK_SIZE];
    let mut rolling = RollingChecksum::new();
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        rolling.update(&buffer[..n]);
    }
    Ok(rolling.finalize())
}

/// Hash a local file in streaming fashion
pub fn hash_file<P: AsRef<Path>>(path: P) -> Result<Checksum> {
    let mut file = File::open(path)?;
    Ok(hash_reader(&mut file)?)
}
