use std::fmt;
use std::io::{self, Read};
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 16;
pub const FRAME_VERSION: u8 = 1;
pub const RESERVED_BYTE: u8 = 0xBC;
/// Authorization service/method value meaning "no authorization attached".
pub const NO_AUTH: u8 = 0xFF;
pub const UNSPECIFIED_METHOD: u8 = 0xFF;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Protocol state carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Valid,
    Invalid,
    StreamStart,
    StreamContinue,
    StreamError,
    StreamEnd,
    SystemError,
}

impl StreamState {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(StreamState::Valid),
            0x01 => Some(StreamState::Invalid),
            0x50 => Some(StreamState::StreamStart),
            0x51 => Some(StreamState::StreamContinue),
            0x52 => Some(StreamState::StreamError),
            0x53 => Some(StreamState::StreamEnd),
            0xFA => Some(StreamState::SystemError),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            StreamState::Valid => 0x00,
            StreamState::Invalid => 0x01,
            StreamState::StreamStart => 0x50,
            StreamState::StreamContinue => 0x51,
            StreamState::StreamError => 0x52,
            StreamState::StreamEnd => 0x53,
            StreamState::SystemError => 0xFA,
        }
    }

    /// True for the states that belong to a multi-frame response.
    pub fn is_stream(self) -> bool {
        matches!(
            self,
            StreamState::StreamStart
                | StreamState::StreamContinue
                | StreamState::StreamError
                | StreamState::StreamEnd
        )
    }
}

/// Control-plane domain a frame is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    RaftControl,
    RaftCluster,
    Session,
    BasicAuth,
    Unspecified,
}

impl Service {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x10 => Some(Service::RaftControl),
            0x11 => Some(Service::RaftCluster),
            0x30 => Some(Service::Session),
            0x50 => Some(Service::BasicAuth),
            0xFF => Some(Service::Unspecified),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Service::RaftControl => 0x10,
            Service::RaftCluster => 0x11,
            Service::Session => 0x30,
            Service::BasicAuth => 0x50,
            Service::Unspecified => 0xFF,
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Service::RaftControl => "raft_control",
            Service::RaftCluster => "raft_cluster",
            Service::Session => "session",
            Service::BasicAuth => "basic_auth",
            Service::Unspecified => "unspecified",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream ended cleanly on a frame boundary.
    #[error("frame stream closed")]
    Closed,
    #[error("frame truncated while reading {section}: expected {expected} bytes, read {read}")]
    Truncated {
        section: &'static str,
        expected: usize,
        read: usize,
    },
    #[error("invalid frame state 0x{0:02x}")]
    InvalidState(u8),
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported service 0x{0:02x}")]
    UnsupportedService(u8),
    #[error("payload length is zero")]
    EmptyPayload,
    #[error("{section} length {len} exceeds limit {limit}")]
    PayloadTooLarge {
        section: &'static str,
        len: usize,
        limit: usize,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Errors that invalidate one frame but leave the stream aligned on the
    /// next frame boundary.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            FrameError::InvalidState(_)
                | FrameError::UnsupportedVersion(_)
                | FrameError::UnsupportedService(_)
                | FrameError::EmptyPayload
                | FrameError::PayloadTooLarge { .. }
        )
    }
}

/// Decoded view of the fixed 16-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub state: u8,
    pub version: u8,
    pub service: u8,
    pub method: u8,
    pub authorization_service: u8,
    pub authorization_method: u8,
    pub authorization_len: u32,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8; FRAME_HEADER_LEN]) -> Self {
        Self {
            state: bytes[0],
            version: bytes[1],
            service: bytes[4],
            method: bytes[5],
            authorization_service: bytes[6],
            authorization_method: bytes[7],
            authorization_len: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            payload_len: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut bytes = [0u8; FRAME_HEADER_LEN];
        bytes[0] = self.state;
        bytes[1] = self.version;
        bytes[2] = RESERVED_BYTE;
        bytes[3] = RESERVED_BYTE;
        bytes[4] = self.service;
        bytes[5] = self.method;
        bytes[6] = self.authorization_service;
        bytes[7] = self.authorization_method;
        bytes[8..12].copy_from_slice(&self.authorization_len.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
        bytes
    }
}

/// One control-plane message. Built fresh per request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    state: StreamState,
    service: Service,
    method: u8,
    authorization_service: u8,
    authorization_method: u8,
    authorization: Vec<u8>,
    payload: Vec<u8>,
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl Frame {
    pub fn new() -> Self {
        Self {
            state: StreamState::Invalid,
            service: Service::Unspecified,
            method: UNSPECIFIED_METHOD,
            authorization_service: NO_AUTH,
            authorization_method: NO_AUTH,
            authorization: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: StreamState) -> Self {
        self.state = state;
        self
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.service = service;
        self
    }

    pub fn with_method(mut self, method: u8) -> Self {
        self.method = method;
        self
    }

    pub fn with_authorization(mut self, service: u8, method: u8, token: Vec<u8>) -> Self {
        self.authorization_service = service;
        self.authorization_method = method;
        self.authorization = token;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn version(&self) -> u8 {
        FRAME_VERSION
    }

    pub fn service(&self) -> Service {
        self.service
    }

    pub fn method(&self) -> u8 {
        self.method
    }

    pub fn authorization_service(&self) -> u8 {
        self.authorization_service
    }

    pub fn authorization_method(&self) -> u8 {
        self.authorization_method
    }

    pub fn authorization(&self) -> &[u8] {
        &self.authorization
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Fails when a section does not fit the header's `u32` length field.
    pub fn header(&self) -> Result<FrameHeader, FrameError> {
        Ok(FrameHeader {
            state: self.state.as_byte(),
            version: FRAME_VERSION,
            service: self.service.as_byte(),
            method: self.method,
            authorization_service: self.authorization_service,
            authorization_method: self.authorization_method,
            authorization_len: section_len("authorization", self.authorization.len())?,
            payload_len: section_len("payload", self.payload.len())?,
        })
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.authorization.len() + self.payload.len()
    }

    /// Serializes the frame. Sections longer than `u32::MAX` bytes are
    /// rejected with [`FrameError::PayloadTooLarge`].
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let header = self.header()?;
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(&self.authorization);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes exactly one frame from the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut cursor = io::Cursor::new(bytes);
        Self::read_from(&mut cursor, DEFAULT_MAX_PAYLOAD_BYTES)
    }

    /// Reads one frame, rejecting zero-length payloads.
    ///
    /// Malformed frames are consumed in full before the error is returned, so
    /// the reader stays positioned on the next frame boundary whenever
    /// [`FrameError::is_frame_local`] holds.
    pub fn read_from<R: Read>(reader: &mut R, max_payload: usize) -> Result<Self, FrameError> {
        read_frame(reader, max_payload, false)
    }
}

fn section_len(section: &'static str, len: usize) -> Result<u32, FrameError> {
    u32::try_from(len).map_err(|_| FrameError::PayloadTooLarge {
        section,
        len,
        limit: u32::MAX as usize,
    })
}

pub(crate) fn read_frame<R: Read>(
    reader: &mut R,
    max_payload: usize,
    allow_empty_end: bool,
) -> Result<Frame, FrameError> {
    let mut raw = [0u8; FRAME_HEADER_LEN];
    let read = fill(reader, &mut raw)?;
    if read == 0 {
        return Err(FrameError::Closed);
    }
    if read < FRAME_HEADER_LEN {
        return Err(FrameError::Truncated {
            section: "header",
            expected: FRAME_HEADER_LEN,
            read,
        });
    }
    let header = FrameHeader::parse(&raw);
    let auth_len = header.authorization_len as usize;
    let payload_len = header.payload_len as usize;

    let rejection = if StreamState::from_byte(header.state).is_none() {
        Some(FrameError::InvalidState(header.state))
    } else if header.version != FRAME_VERSION {
        Some(FrameError::UnsupportedVersion(header.version))
    } else if Service::from_byte(header.service).is_none() {
        Some(FrameError::UnsupportedService(header.service))
    } else if auth_len > max_payload {
        Some(FrameError::PayloadTooLarge {
            section: "authorization",
            len: auth_len,
            limit: max_payload,
        })
    } else if payload_len > max_payload {
        Some(FrameError::PayloadTooLarge {
            section: "payload",
            len: payload_len,
            limit: max_payload,
        })
    } else {
        None
    };
    if let Some(err) = rejection {
        skip(reader, auth_len as u64 + payload_len as u64)?;
        return Err(err);
    }

    let state = StreamState::from_byte(header.state).ok_or(FrameError::InvalidState(header.state))?;
    let service =
        Service::from_byte(header.service).ok_or(FrameError::UnsupportedService(header.service))?;

    let authorization = read_section(reader, auth_len, "authorization")?;
    if payload_len == 0 && !(allow_empty_end && state == StreamState::StreamEnd) {
        return Err(FrameError::EmptyPayload);
    }
    let payload = read_section(reader, payload_len, "payload")?;

    Ok(Frame {
        state,
        service,
        method: header.method,
        authorization_service: header.authorization_service,
        authorization_method: header.authorization_method,
        authorization,
        payload,
    })
}

fn read_section<R: Read>(
    reader: &mut R,
    len: usize,
    section: &'static str,
) -> Result<Vec<u8>, FrameError> {
    let mut buf = vec![0u8; len];
    let read = fill(reader, &mut buf)?;
    if read < len {
        return Err(FrameError::Truncated {
            section,
            expected: len,
            read,
        });
    }
    Ok(buf)
}

fn skip<R: Read>(reader: &mut R, len: u64) -> Result<(), FrameError> {
    let skipped = io::copy(&mut reader.by_ref().take(len), &mut io::sink())?;
    if skipped < len {
        return Err(FrameError::Truncated {
            section: "rejected frame body",
            expected: len as usize,
            read: skipped as usize,
        });
    }
    Ok(())
}

/// Reads until `buf` is full or the reader reports EOF; returns bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(filled)
}
