//! Little-endian payload helpers shared by every typed message on the wire.

use std::convert::TryInto;
use std::str::from_utf8;
use thiserror::Error;

/// Version byte leading every typed payload.
pub const PAYLOAD_VERSION: u8 = 1;

/// A typed payload carried inside a frame or a log entry.
pub trait WireMessage: Sized {
    /// Short name used in error messages and logs.
    const NAME: &'static str;

    /// Fails when a field exceeds its length prefix.
    fn encode(&self) -> Result<Vec<u8>, MessageError>;
    fn decode(bytes: &[u8]) -> Result<Self, MessageError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("{message} payload truncated")]
    Truncated { message: &'static str },
    #[error("{message} payload version {observed} unsupported (expected {expected})")]
    UnsupportedVersion {
        message: &'static str,
        observed: u8,
        expected: u8,
    },
    #[error("{message} field {field} is not valid UTF-8")]
    InvalidUtf8 {
        message: &'static str,
        field: &'static str,
    },
    #[error("{message} field {field} has unknown code {value}")]
    UnknownCode {
        message: &'static str,
        field: &'static str,
        value: u64,
    },
    #[error("{message} field {field} is {len} bytes (limit {limit})")]
    FieldTooLong {
        message: &'static str,
        field: &'static str,
        len: usize,
        limit: usize,
    },
    #[error("{message} payload has {remaining} trailing bytes")]
    TrailingBytes {
        message: &'static str,
        remaining: usize,
    },
}

/// Cursor over a payload that reports truncation against the message name.
pub struct PayloadReader<'a> {
    bytes: &'a [u8],
    cursor: usize,
    message: &'static str,
}

impl<'a> PayloadReader<'a> {
    /// Starts reading `bytes` and checks the leading version byte.
    pub fn versioned(bytes: &'a [u8], message: &'static str) -> Result<Self, MessageError> {
        let mut reader = Self {
            bytes,
            cursor: 0,
            message,
        };
        let version = reader.u8()?;
        if version != PAYLOAD_VERSION {
            return Err(MessageError::UnsupportedVersion {
                message,
                observed: version,
                expected: PAYLOAD_VERSION,
            });
        }
        Ok(reader)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], MessageError> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(MessageError::Truncated {
                message: self.message,
            })?;
        let slice = &self.bytes[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, MessageError> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool, MessageError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(self.unknown("flag", other as u64)),
        }
    }

    pub fn u16(&mut self) -> Result<u16, MessageError> {
        let message = self.message;
        let raw = self.take(2)?;
        raw.try_into()
            .map(u16::from_le_bytes)
            .map_err(|_| MessageError::Truncated { message })
    }

    pub fn u32(&mut self) -> Result<u32, MessageError> {
        let message = self.message;
        let raw = self.take(4)?;
        raw.try_into()
            .map(u32::from_le_bytes)
            .map_err(|_| MessageError::Truncated { message })
    }

    pub fn u64(&mut self) -> Result<u64, MessageError> {
        let message = self.message;
        let raw = self.take(8)?;
        raw.try_into()
            .map(u64::from_le_bytes)
            .map_err(|_| MessageError::Truncated { message })
    }

    /// Reads a `u16`-length-prefixed UTF-8 string.
    pub fn string(&mut self, field: &'static str) -> Result<String, MessageError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| MessageError::InvalidUtf8 {
                message: self.message,
                field,
            })
    }

    /// Reads a `u32`-length-prefixed byte blob.
    pub fn bytes(&mut self) -> Result<Vec<u8>, MessageError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn unknown(&self, field: &'static str, value: u64) -> MessageError {
        MessageError::UnknownCode {
            message: self.message,
            field,
            value,
        }
    }

    /// Fails if anything is left after the last field.
    pub fn finish(self) -> Result<(), MessageError> {
        let remaining = self.bytes.len() - self.cursor;
        if remaining != 0 {
            return Err(MessageError::TrailingBytes {
                message: self.message,
                remaining,
            });
        }
        Ok(())
    }
}

/// Builder for a versioned payload.
///
/// The first field that does not fit its length prefix is remembered and
/// reported by `finish`; later writes are ignored.
pub struct PayloadWriter {
    buf: Vec<u8>,
    message: &'static str,
    overflow: Option<MessageError>,
}

impl PayloadWriter {
    pub fn versioned(message: &'static str, capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity + 1);
        buf.push(PAYLOAD_VERSION);
        Self {
            buf,
            message,
            overflow: None,
        }
    }

    fn put(mut self, raw: &[u8]) -> Self {
        if self.overflow.is_none() {
            self.buf.extend_from_slice(raw);
        }
        self
    }

    fn too_long(mut self, field: &'static str, len: usize, limit: usize) -> Self {
        if self.overflow.is_none() {
            self.overflow = Some(MessageError::FieldTooLong {
                message: self.message,
                field,
                len,
                limit,
            });
        }
        self
    }

    pub fn u8(self, value: u8) -> Self {
        self.put(&[value])
    }

    pub fn bool(self, value: bool) -> Self {
        self.u8(u8::from(value))
    }

    pub fn u16(self, value: u16) -> Self {
        self.put(&value.to_le_bytes())
    }

    pub fn u32(self, value: u32) -> Self {
        self.put(&value.to_le_bytes())
    }

    pub fn u64(self, value: u64) -> Self {
        self.put(&value.to_le_bytes())
    }

    /// Writes a `u16`-length-prefixed string.
    pub fn string(self, field: &'static str, value: &str) -> Self {
        match u16::try_from(value.len()) {
            Ok(len) => self.u16(len).put(value.as_bytes()),
            Err(_) => self.too_long(field, value.len(), u16::MAX as usize),
        }
    }

    /// Writes a `u32`-length-prefixed byte blob.
    pub fn bytes(self, field: &'static str, value: &[u8]) -> Self {
        match u32::try_from(value.len()) {
            Ok(len) => self.u32(len).put(value),
            Err(_) => self.too_long(field, value.len(), u32::MAX as usize),
        }
    }

    /// Writes a `u32` element count for a repeated field.
    pub fn count(self, field: &'static str, len: usize) -> Self {
        match u32::try_from(len) {
            Ok(count) => self.u32(count),
            Err(_) => self.too_long(field, len, u32::MAX as usize),
        }
    }

    pub fn finish(self) -> Result<Vec<u8>, MessageError> {
        match self.overflow {
            Some(err) => Err(err),
            None => Ok(self.buf),
        }
    }
}
