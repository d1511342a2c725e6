//! The structured message carried inside one frame.
//!
//! Envelopes use the protocol-buffers wire format of the `RpcMessage` schema
//! shared by all peers:
//!
//! ```text
//! message RpcMessage {
//!   required Type   type   = 1;
//!   optional uint32 id     = 2;
//!   optional string name   = 3;
//!   optional bytes  buffer = 4;
//! }
//! ```
//!
//! Fields this side does not know are skipped on decode.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::EnvelopeError;

const FIELD_TYPE: u64 = 1;
const FIELD_ID: u64 = 2;
const FIELD_NAME: u64 = 3;
const FIELD_BUFFER: u64 = 4;

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// Kind of an envelope. Discriminants are the schema's wire numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Request = 1,
    Response = 2,
    ResponseCancel = 3,
    ResponseFailed = 4,
    ResponseNotImplemented = 5,
    Disconnect = 6,
    RequestCancel = 9,
}

impl MessageType {
    /// Map a wire number back to a message type.
    pub fn from_wire(value: u64) -> Option<Self> {
        Some(match value {
            1 => Self::Request,
            2 => Self::Response,
            3 => Self::ResponseCancel,
            4 => Self::ResponseFailed,
            5 => Self::ResponseNotImplemented,
            6 => Self::Disconnect,
            9 => Self::RequestCancel,
            _ => return None,
        })
    }

    /// The schema's wire number.
    pub fn wire_value(self) -> u32 {
        self as u32
    }

    /// Whether envelopes of this type must name a method.
    pub fn requires_method(self) -> bool {
        matches!(self, Self::Request | Self::RequestCancel)
    }

    /// Whether this type answers an outstanding request.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            Self::Response
                | Self::ResponseCancel
                | Self::ResponseFailed
                | Self::ResponseNotImplemented
        )
    }

    /// Schema name, for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Response => "RESPONSE",
            Self::ResponseCancel => "RESPONSE_CANCEL",
            Self::ResponseFailed => "RESPONSE_FAILED",
            Self::ResponseNotImplemented => "RESPONSE_NOT_IMPLEMENTED",
            Self::Disconnect => "DISCONNECT",
            Self::RequestCancel => "REQUEST_CANCEL",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One RPC message: type, sequence id, method name and opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_type: MessageType,
    pub sequence_id: u32,
    /// Present for `REQUEST` and `REQUEST_CANCEL` only.
    pub method_name: Option<String>,
    /// Encoded request/response body, failure text, or empty.
    pub payload: Bytes,
}

impl Envelope {
    /// Outbound call.
    pub fn request(sequence_id: u32, method: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type: MessageType::Request,
            sequence_id,
            method_name: Some(method.into()),
            payload: payload.into(),
        }
    }

    /// Request that the peer abandon a call.
    pub fn request_cancel(sequence_id: u32, method: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::RequestCancel,
            sequence_id,
            method_name: Some(method.into()),
            payload: Bytes::new(),
        }
    }

    /// Successful reply carrying the encoded response body.
    pub fn response(sequence_id: u32, payload: impl Into<Bytes>) -> Self {
        Self::control(MessageType::Response, sequence_id, payload.into())
    }

    /// Reply reporting that the handler failed.
    pub fn response_failed(sequence_id: u32, reason: &str) -> Self {
        Self::control(
            MessageType::ResponseFailed,
            sequence_id,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    /// Reply reporting that the call was cancelled on the serving side.
    pub fn response_cancel(sequence_id: u32, reason: &str) -> Self {
        Self::control(
            MessageType::ResponseCancel,
            sequence_id,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    /// Reply for a method the serving side does not have.
    pub fn not_implemented(sequence_id: u32) -> Self {
        Self::control(MessageType::ResponseNotImplemented, sequence_id, Bytes::new())
    }

    /// Orderly end of the connection.
    pub fn disconnect() -> Self {
        Self::control(MessageType::Disconnect, 0, Bytes::new())
    }

    fn control(msg_type: MessageType, sequence_id: u32, payload: Bytes) -> Self {
        Self {
            msg_type,
            sequence_id,
            method_name: None,
            payload,
        }
    }

    /// The payload as failure text, replacing invalid UTF-8.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Number of bytes [`Envelope::encode`] will produce.
    pub fn encoded_len(&self) -> usize {
        let mut len = 1 + varint_len(u64::from(self.msg_type.wire_value()));
        len += 1 + varint_len(u64::from(self.sequence_id));
        if let Some(name) = &self.method_name {
            len += 1 + varint_len(name.len() as u64) + name.len();
        }
        if !self.payload.is_empty() {
            len += 1 + varint_len(self.payload.len() as u64) + self.payload.len();
        }
        len
    }

    /// Append the schema encoding of this envelope to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        put_key(dst, FIELD_TYPE, WIRE_VARINT);
        put_varint(dst, u64::from(self.msg_type.wire_value()));
        put_key(dst, FIELD_ID, WIRE_VARINT);
        put_varint(dst, u64::from(self.sequence_id));
        if let Some(name) = &self.method_name {
            put_key(dst, FIELD_NAME, WIRE_LEN);
            put_varint(dst, name.len() as u64);
            dst.put_slice(name.as_bytes());
        }
        if !self.payload.is_empty() {
            put_key(dst, FIELD_BUFFER, WIRE_LEN);
            put_varint(dst, self.payload.len() as u64);
            dst.put_slice(&self.payload);
        }
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one envelope occupying the whole of `src`.
    ///
    /// An unknown message type still yields
    /// [`EnvelopeError::UnknownMessageType`] with the sequence id, so callers
    /// can report it and carry on.
    pub fn decode(mut src: Bytes) -> Result<Self, EnvelopeError> {
        let mut msg_type = None;
        let mut sequence_id = 0u32;
        let mut method_name = None;
        let mut payload = Bytes::new();

        while src.has_remaining() {
            let key = get_varint(&mut src)?;
            let field = key >> 3;
            let wire_type = (key & 0x07) as u8;

            match (field, wire_type) {
                (FIELD_TYPE, WIRE_VARINT) => msg_type = Some(get_varint(&mut src)?),
                // uint32 fields keep the low 32 bits, as schema decoders do.
                (FIELD_ID, WIRE_VARINT) => sequence_id = get_varint(&mut src)? as u32,
                (FIELD_NAME, WIRE_LEN) => {
                    let raw = get_len_delimited(&mut src)?;
                    let name = String::from_utf8(raw.to_vec())
                        .map_err(|_| EnvelopeError::InvalidMethodName("non-utf8 name"))?;
                    method_name = Some(name);
                }
                (FIELD_BUFFER, WIRE_LEN) => payload = get_len_delimited(&mut src)?,
                (_, wire_type) => skip_field(&mut src, wire_type)?,
            }
        }

        let raw_type = msg_type.ok_or(EnvelopeError::MissingType)?;
        let msg_type =
            MessageType::from_wire(raw_type).ok_or(EnvelopeError::UnknownMessageType {
                value: raw_type,
                sequence_id,
            })?;

        if msg_type.requires_method() {
            if method_name.is_none() {
                return Err(EnvelopeError::InvalidMethodName(msg_type.as_str()));
            }
        } else {
            method_name = None;
        }

        Ok(Self {
            msg_type,
            sequence_id,
            method_name,
            payload,
        })
    }
}

fn put_key(dst: &mut BytesMut, field: u64, wire_type: u8) {
    put_varint(dst, (field << 3) | u64::from(wire_type));
}

fn put_varint(dst: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        dst.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

fn get_varint(src: &mut Bytes) -> Result<u64, EnvelopeError> {
    let mut value = 0u64;
    for shift in (0..70).step_by(7) {
        if !src.has_remaining() {
            return Err(EnvelopeError::Truncated);
        }
        let byte = src.get_u8();
        if shift == 63 && byte > 1 {
            return Err(EnvelopeError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(EnvelopeError::VarintOverflow)
}

fn get_len_delimited(src: &mut Bytes) -> Result<Bytes, EnvelopeError> {
    let len = get_varint(src)?;
    if len > src.remaining() as u64 {
        return Err(EnvelopeError::Truncated);
    }
    Ok(src.split_to(len as usize))
}

fn skip_field(src: &mut Bytes, wire_type: u8) -> Result<(), EnvelopeError> {
    let skip = match wire_type {
        WIRE_VARINT => {
            get_varint(src)?;
            return Ok(());
        }
        WIRE_FIXED64 => 8,
        WIRE_LEN => {
            get_len_delimited(src)?;
            return Ok(());
        }
        WIRE_FIXED32 => 4,
        other => return Err(EnvelopeError::InvalidWireType(other)),
    };
    if src.remaining() < skip {
        return Err(EnvelopeError::Truncated);
    }
    src.advance(skip);
    Ok(())
}
