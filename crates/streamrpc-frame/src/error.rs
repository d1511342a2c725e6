/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload does not fit the 28-bit length field or the configured maximum.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The header carries a protocol version this side does not speak.
    #[error("protocol version mismatch (expected {expected}, got {actual})")]
    VersionMismatch { expected: u8, actual: u8 },

    /// The stream ended in the middle of a frame.
    #[error("short read: stream ended after {received} of {expected} bytes")]
    ShortRead { expected: usize, received: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed on a frame boundary.
    #[error("connection closed")]
    ConnectionClosed,

    /// The frame payload is not a valid envelope.
    #[error("malformed envelope: {0}")]
    Envelope(#[from] EnvelopeError),
}

/// Errors decoding the envelope carried inside a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// A field or varint runs past the end of the frame.
    #[error("envelope truncated")]
    Truncated,

    /// A varint is longer than 10 bytes.
    #[error("varint overflow")]
    VarintOverflow,

    /// A field uses a wire type the schema decoder cannot skip.
    #[error("invalid wire type {0}")]
    InvalidWireType(u8),

    /// The required message type field is absent.
    #[error("missing message type")]
    MissingType,

    /// The message type number is not one this side understands.
    #[error("unknown message type {value} (sequence id {sequence_id})")]
    UnknownMessageType { value: u64, sequence_id: u32 },

    /// A request carries no method name, or one that is not UTF-8.
    #[error("invalid method name for {0}")]
    InvalidMethodName(&'static str),
}

pub type Result<T> = std::result::Result<T, FrameError>;
