use std::time::Duration;

/// Errors produced while turning values into bodies and back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The value could not be serialized.
    #[error("failed to encode body: {0}")]
    Encode(String),

    /// The bytes did not decode into the expected type.
    #[error("failed to decode body: {0}")]
    Decode(String),
}

/// Errors a call can complete with.
///
/// The `Display` text of an error is what ends up in the call's
/// [`Controller`](crate::Controller) as its failure text.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] streamrpc_transport::TransportError),

    /// Frame-level error while reading or writing.
    #[error("frame error: {0}")]
    Frame(#[from] streamrpc_frame::FrameError),

    /// Request or response body could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] CodecError),

    /// The frame read back was not a RESPONSE.
    #[error("no valid response received ({0})")]
    ProtocolViolation(String),

    /// The response answered a different request.
    #[error("response sequence id {actual} does not match request id {expected}")]
    SequenceMismatch { expected: u32, actual: u32 },

    /// The peer has no handler for the method.
    #[error("Not Implemented")]
    MethodNotFound { method: String },

    /// The peer reported a failure; the text is its reason.
    #[error("{0}")]
    Failed(String),

    /// The call was cancelled, locally or by the peer.
    #[error("{0}")]
    Cancelled(String),

    /// The connection closed before the call completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// No response arrived in time.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// A newer call reused this call's sequence id.
    #[error("Duplicate request found (sequence id {0})")]
    DuplicateRequest(u32),
}

pub type Result<T> = std::result::Result<T, CallError>;
