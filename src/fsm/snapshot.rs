//! Checksummed record stream used to ship a full store copy.
//!
//! Layout: `SFSN | version | (u32 key_len, key, u32 value_len, value)* |
//! 0xFFFFFFFF | crc32`, where the CRC covers every byte before it.

use crc32fast::Hasher as Crc32Hasher;
use std::io::{self, Read, Write};
use thiserror::Error;

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"SFSN";
pub const SNAPSHOT_VERSION: u8 = 1;
const TERMINATOR: u32 = u32::MAX;
const MAX_RECORD_PART: u32 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot magic mismatch")]
    BadMagic,
    #[error("snapshot version {0} unsupported")]
    UnsupportedVersion(u8),
    #[error("snapshot record part of {0} bytes exceeds limit")]
    RecordTooLarge(u32),
    #[error("snapshot checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },
}

pub struct SnapshotWriter<W: Write> {
    inner: W,
    hasher: Crc32Hasher,
    records: u64,
}

impl<W: Write> SnapshotWriter<W> {
    pub fn new(inner: W) -> Result<Self, SnapshotError> {
        let mut writer = Self {
            inner,
            hasher: Crc32Hasher::new(),
            records: 0,
        };
        writer.put(&SNAPSHOT_MAGIC)?;
        writer.put(&[SNAPSHOT_VERSION])?;
        Ok(writer)
    }

    pub fn record(&mut self, key: &[u8], value: &[u8]) -> Result<(), SnapshotError> {
        for part in [key, value] {
            let len = u32::try_from(part.len())
                .ok()
                .filter(|len| *len < MAX_RECORD_PART)
                .ok_or(SnapshotError::RecordTooLarge(u32::MAX))?;
            self.put(&len.to_le_bytes())?;
            self.put(part)?;
        }
        self.records += 1;
        Ok(())
    }

    /// Writes the terminator and checksum; returns the record count.
    pub fn finish(mut self) -> Result<u64, SnapshotError> {
        self.put(&TERMINATOR.to_le_bytes())?;
        let crc = self.hasher.finalize();
        self.inner.write_all(&crc.to_le_bytes())?;
        self.inner.flush()?;
        Ok(self.records)
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        self.hasher.update(bytes);
        self.inner.write_all(bytes)?;
        Ok(())
    }
}

pub struct SnapshotReader<R: Read> {
    inner: R,
    hasher: Crc32Hasher,
    done: bool,
}

impl<R: Read> SnapshotReader<R> {
    pub fn new(inner: R) -> Result<Self, SnapshotError> {
        let mut reader = Self {
            inner,
            hasher: Crc32Hasher::new(),
            done: false,
        };
        let mut magic = [0u8; 4];
        reader.take(&mut magic)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        let mut version = [0u8; 1];
        reader.take(&mut version)?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version[0]));
        }
        Ok(reader)
    }

    /// Next `(key, value)` record, or `None` once the checksum has been
    /// verified.
    pub fn next_record(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, SnapshotError> {
        if self.done {
            return Ok(None);
        }
        let key_len = self.len()?;
        if key_len == TERMINATOR {
            self.verify()?;
            self.done = true;
            return Ok(None);
        }
        let key = self.part(key_len)?;
        let value_len = self.len()?;
        let value = self.part(value_len)?;
        Ok(Some((key, value)))
    }

    fn verify(&mut self) -> Result<(), SnapshotError> {
        let computed = self.hasher.clone().finalize();
        let mut raw = [0u8; 4];
        self.inner.read_exact(&mut raw)?;
        let stored = u32::from_le_bytes(raw);
        if stored != computed {
            return Err(SnapshotError::ChecksumMismatch { stored, computed });
        }
        Ok(())
    }

    fn len(&mut self) -> Result<u32, SnapshotError> {
        let mut raw = [0u8; 4];
        self.take(&mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    fn part(&mut self, len: u32) -> Result<Vec<u8>, SnapshotError> {
        if len >= MAX_RECORD_PART {
            return Err(SnapshotError::RecordTooLarge(len));
        }
        let mut buf = vec![0u8; len as usize];
        self.take(&mut buf)?;
        Ok(buf)
    }

    fn take(&mut self, buf: &mut [u8]) -> Result<(), SnapshotError> {
        self.inner.read_exact(buf)?;
        self.hasher.update(buf);
        Ok(())
    }
}
