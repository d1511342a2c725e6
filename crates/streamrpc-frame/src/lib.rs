//! Length-prefixed RPC frames and the envelopes they carry.
//!
//! Every message on the wire is one frame:
//! - A 4-byte little-endian header word: protocol version in the top 4 bits,
//!   payload length in the low 28 bits
//! - Exactly `length` bytes of payload: one encoded [`Envelope`]
//!
//! Callers always get complete frames; partial reads are handled here.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, decode_header, encode_frame, encode_header, FrameConfig, DEFAULT_MAX_PAYLOAD,
    HEADER_SIZE, MAX_FRAME_PAYLOAD, PROTOCOL_VERSION, SIZE_MASK, VERSION_MASK,
};
pub use envelope::{Envelope, MessageType};
pub use error::{EnvelopeError, FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
