//! Multi-frame response framing.
//!
//! A streamed response is `StreamStart`, then zero or more `StreamContinue`
//! frames, then exactly one header-only `StreamEnd`. A response with no
//! values is the bare `StreamEnd`. Unary responses are a single `Valid` frame
//! and errors a single `Valid` frame addressed to [`ERROR_METHOD`].

use crate::wire::frame::{read_frame, Frame, FrameError, Service, StreamState};
use std::io::{self, Read, Write};

/// Method byte shared by every service for structured error responses.
pub const ERROR_METHOD: u8 = 0xFE;

/// Writes the frames of one streamed response.
pub struct ResponseWriter<'a, W: Write> {
    writer: &'a mut W,
    service: Service,
    method: u8,
    sent: usize,
}

impl<'a, W: Write> ResponseWriter<'a, W> {
    pub fn new(writer: &'a mut W, service: Service, method: u8) -> Self {
        Self {
            writer,
            service,
            method,
            sent: 0,
        }
    }

    /// Number of value frames written so far.
    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn send(&mut self, payload: Vec<u8>) -> io::Result<()> {
        let state = if self.sent == 0 {
            StreamState::StreamStart
        } else {
            StreamState::StreamContinue
        };
        self.write(state, payload)?;
        self.sent += 1;
        Ok(())
    }

    /// Reports a failure inside the stream. The stream must still be finished.
    pub fn send_error(&mut self, payload: Vec<u8>) -> io::Result<()> {
        self.write(StreamState::StreamError, payload)
    }

    /// Writes the terminator. Consumes the writer so a stream ends once.
    pub fn finish(self) -> io::Result<usize> {
        let end = Frame::new()
            .with_state(StreamState::StreamEnd)
            .with_service(self.service)
            .with_method(self.method);
        self.writer.write_all(&encode_frame(&end)?)?;
        self.writer.flush()?;
        Ok(self.sent)
    }

    fn write(&mut self, state: StreamState, payload: Vec<u8>) -> io::Result<()> {
        let frame = Frame::new()
            .with_state(state)
            .with_service(self.service)
            .with_method(self.method)
            .with_payload(payload);
        self.writer.write_all(&encode_frame(&frame)?)?;
        self.writer.flush()
    }
}

pub fn write_unary<W: Write>(
    writer: &mut W,
    service: Service,
    method: u8,
    payload: Vec<u8>,
) -> io::Result<()> {
    let frame = Frame::new()
        .with_state(StreamState::Valid)
        .with_service(service)
        .with_method(method)
        .with_payload(payload);
    writer.write_all(&encode_frame(&frame)?)?;
    writer.flush()
}

/// Encodes `frame` for a writer, reporting unrepresentable sections as
/// `InvalidInput`.
fn encode_frame(frame: &Frame) -> io::Result<Vec<u8>> {
    frame
        .encode()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
}

pub fn write_error<W: Write>(writer: &mut W, service: Service, payload: Vec<u8>) -> io::Result<()> {
    write_unary(writer, service, ERROR_METHOD, payload)
}

/// Reads one response frame, accepting the header-only `StreamEnd`
/// terminator that [`Frame::read_from`] rejects.
pub fn read_response<R: Read>(reader: &mut R, max_payload: usize) -> Result<Frame, FrameError> {
    read_frame(reader, max_payload, true)
}
