//! Byte-level protocols: the control-plane frame format, its stream framing,
//! and the raw checksummed message stream used for transport payloads.

pub mod codec;
pub mod frame;
pub mod header;
pub mod stream;

pub use codec::{MessageError, PayloadReader, PayloadWriter, WireMessage, PAYLOAD_VERSION};
pub use frame::{
    Frame, FrameError, FrameHeader, Service, StreamState, DEFAULT_MAX_PAYLOAD_BYTES,
    FRAME_HEADER_LEN, FRAME_VERSION, NO_AUTH, RESERVED_BYTE, UNSPECIFIED_METHOD,
};
pub use header::{
    read_message, write_message, write_poison, HeaderError, MessageMethod, RequestHeader,
    TransportError, MESSAGE_MAGIC, POISON_MARKER, REQUEST_HEADER_LEN,
};
pub use stream::{read_response, write_error, write_unary, ResponseWriter, ERROR_METHOD};
