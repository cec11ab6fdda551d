//! Raw message stream used for Raft transport batches and snapshot chunks.
//!
//! Each message is `magic (2) | RequestHeader (18) | payload (size)`. The
//! header protects itself with a CRC32 computed with its own checksum field
//! zeroed, and carries a second CRC32 over the payload. Unlike the control
//! frame protocol, any corruption here is fatal to the stream.

use crc32fast::Hasher as Crc32Hasher;
use std::io::{self, Read, Write};
use thiserror::Error;

pub const REQUEST_HEADER_LEN: usize = 18;
pub const MESSAGE_MAGIC: [u8; 2] = [0xAE, 0x7D];
/// Written instead of the magic to tell the peer no more messages follow.
pub const POISON_MARKER: [u8; 2] = [0x00, 0x00];

const HEADER_CRC_RANGE: std::ops::Range<usize> = 10..14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageMethod {
    Raft,
    Snapshot,
}

impl MessageMethod {
    pub fn code(self) -> u16 {
        match self {
            MessageMethod::Raft => 100,
            MessageMethod::Snapshot => 200,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            100 => Some(MessageMethod::Raft),
            200 => Some(MessageMethod::Snapshot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub method: MessageMethod,
    pub size: u64,
    /// CRC32 of the payload that follows the header.
    pub crc: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("request header too small: {len} bytes")]
    TooSmall { len: usize },
    #[error("request header checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("request header has invalid method {0}")]
    InvalidMethod(u16),
}

impl RequestHeader {
    pub fn for_payload(method: MessageMethod, payload: &[u8]) -> Self {
        Self {
            method,
            size: payload.len() as u64,
            crc: crc32fast::hash(payload),
        }
    }

    pub fn encode(&self) -> [u8; REQUEST_HEADER_LEN] {
        let mut buf = [0u8; REQUEST_HEADER_LEN];
        buf[0..2].copy_from_slice(&self.method.code().to_le_bytes());
        buf[2..10].copy_from_slice(&self.size.to_le_bytes());
        buf[14..18].copy_from_slice(&self.crc.to_le_bytes());
        let checksum = header_checksum(&buf);
        buf[HEADER_CRC_RANGE].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < REQUEST_HEADER_LEN {
            return Err(HeaderError::TooSmall { len: bytes.len() });
        }
        let mut buf = [0u8; REQUEST_HEADER_LEN];
        buf.copy_from_slice(&bytes[..REQUEST_HEADER_LEN]);
        let stored = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
        let computed = header_checksum(&buf);
        if stored != computed {
            return Err(HeaderError::ChecksumMismatch { stored, computed });
        }
        let code = u16::from_le_bytes([buf[0], buf[1]]);
        let method = MessageMethod::from_code(code).ok_or(HeaderError::InvalidMethod(code))?;
        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[2..10]);
        Ok(Self {
            method,
            size: u64::from_le_bytes(size),
            crc: u32::from_le_bytes([buf[14], buf[15], buf[16], buf[17]]),
        })
    }
}

fn header_checksum(buf: &[u8; REQUEST_HEADER_LEN]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(&buf[..HEADER_CRC_RANGE.start]);
    hasher.update(&[0u8; 4]);
    hasher.update(&buf[HEADER_CRC_RANGE.end..]);
    hasher.finalize()
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("message stream closed")]
    Closed,
    #[error("message stream poisoned by peer")]
    Poisoned,
    #[error("bad message magic {0:02x?}")]
    BadMagic([u8; 2]),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("message size is zero")]
    EmptyMessage,
    #[error("message size {size} exceeds limit {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("payload checksum mismatch (expected {expected:#010x}, computed {computed:#010x})")]
    PayloadChecksum { expected: u32, computed: u32 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Every failure other than an orderly close leaves the stream unusable.
    pub fn is_stream_fatal(&self) -> bool {
        !matches!(self, TransportError::Closed | TransportError::Poisoned)
    }
}

pub fn write_message<W: Write>(
    writer: &mut W,
    method: MessageMethod,
    payload: &[u8],
) -> Result<(), TransportError> {
    if payload.is_empty() {
        return Err(TransportError::EmptyMessage);
    }
    let header = RequestHeader::for_payload(method, payload);
    writer.write_all(&MESSAGE_MAGIC)?;
    writer.write_all(&header.encode())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

pub fn write_poison<W: Write>(writer: &mut W) -> Result<(), TransportError> {
    writer.write_all(&POISON_MARKER)?;
    writer.flush()?;
    Ok(())
}

pub fn read_message<R: Read>(
    reader: &mut R,
    max_size: u64,
) -> Result<(MessageMethod, Vec<u8>), TransportError> {
    let mut magic = [0u8; 2];
    match reader.read_exact(&mut magic[..1]) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed)
        }
        Err(err) => return Err(err.into()),
    }
    reader.read_exact(&mut magic[1..])?;
    if magic == POISON_MARKER {
        return Err(TransportError::Poisoned);
    }
    if magic != MESSAGE_MAGIC {
        return Err(TransportError::BadMagic(magic));
    }
    let mut raw = [0u8; REQUEST_HEADER_LEN];
    reader.read_exact(&mut raw)?;
    let header = RequestHeader::decode(&raw)?;
    if header.size == 0 {
        return Err(TransportError::EmptyMessage);
    }
    if header.size > max_size {
        return Err(TransportError::TooLarge {
            size: header.size,
            limit: max_size,
        });
    }
    let mut payload = vec![0u8; header.size as usize];
    reader.read_exact(&mut payload)?;
    let computed = crc32fast::hash(&payload);
    if computed != header.crc {
        return Err(TransportError::PayloadChecksum {
            expected: header.crc,
            computed,
        });
    }
    Ok((header.method, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_checksum_covers_method_and_size() {
        let header = RequestHeader::for_payload(MessageMethod::Snapshot, b"chunk");
        let mut bytes = header.encode();
        bytes[3] ^= 0x01;
        assert!(matches!(
            RequestHeader::decode(&bytes),
            Err(HeaderError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn unknown_method_with_valid_checksum_is_rejected() {
        let mut buf = [0u8; REQUEST_HEADER_LEN];
        buf[0..2].copy_from_slice(&300u16.to_le_bytes());
        buf[2..10].copy_from_slice(&4u64.to_le_bytes());
        let checksum = header_checksum(&buf);
        buf[10..14].copy_from_slice(&checksum.to_le_bytes());
        assert_eq!(
            RequestHeader::decode(&buf),
            Err(HeaderError::InvalidMethod(300))
        );
    }
}
