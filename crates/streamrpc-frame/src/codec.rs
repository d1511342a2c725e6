use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: one 32-bit word.
pub const HEADER_SIZE: usize = 4;

/// Protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Bits of the header word holding the protocol version.
pub const VERSION_MASK: u32 = 0xf000_0000;

/// Bits of the header word holding the payload length.
pub const SIZE_MASK: u32 = 0x0fff_ffff;

/// Largest payload the length field can describe.
pub const MAX_FRAME_PAYLOAD: usize = SIZE_MASK as usize;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Pack a version and payload length into a header word.
///
/// Fails instead of masking when either value does not fit its field.
pub fn encode_header(version: u8, len: usize) -> Result<u32> {
    if len > MAX_FRAME_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: MAX_FRAME_PAYLOAD,
        });
    }
    if version > 0x0f {
        return Err(FrameError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: version,
        });
    }
    Ok((u32::from(version) << 28) | len as u32)
}

/// Split a header word into `(version, payload length)`.
pub fn decode_header(header: u32) -> (u8, usize) {
    (
        ((header & VERSION_MASK) >> 28) as u8,
        (header & SIZE_MASK) as usize,
    )
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────────────────────────────────┬──────────────────┐
/// │ Header (4B LE)                     │ Payload          │
/// │ version << 28 | length (28 bits)   │ (length bytes)   │
/// └────────────────────────────────────┴──────────────────┘
/// ```
///
/// The header word is always little-endian, whatever the host byte order.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let header = encode_header(PROTOCOL_VERSION, payload.len())?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u32_le(header);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer and returns the
/// payload. The header is validated as soon as it is available.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Bytes>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
    let (version, payload_len) = decode_header(header);

    if version != PROTOCOL_VERSION {
        return Err(FrameError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: version,
        });
    }

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    Ok(Some(src.split_to(payload_len).freeze()))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB, never more than
    /// [`MAX_FRAME_PAYLOAD`].
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl FrameConfig {
    /// The effective payload limit.
    pub fn payload_limit(&self) -> usize {
        self.max_payload_size.min(MAX_FRAME_PAYLOAD)
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        let payload = b"hello, streamrpc!";

        encode_frame(payload, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + payload.len());

        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(frame.as_ref(), payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let mut buf = BytesMut::new();
        encode_frame(&[0u8; 0x0203], &mut buf).unwrap();

        // 0x1000_0203 little-endian.
        assert_eq!(&buf[..HEADER_SIZE], &[0x03, 0x02, 0x00, 0x10]);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = encode_header(PROTOCOL_VERSION, 12345).unwrap();
        assert_eq!(header & VERSION_MASK, 0x1000_0000);
        assert_eq!(decode_header(header), (PROTOCOL_VERSION, 12345));

        let max = encode_header(0x0f, MAX_FRAME_PAYLOAD).unwrap();
        assert_eq!(max, u32::MAX);
    }

    #[test]
    fn test_oversized_length_rejected_not_truncated() {
        let err = encode_header(PROTOCOL_VERSION, MAX_FRAME_PAYLOAD + 1).unwrap_err();
        assert!(matches!(
            err,
            FrameError::PayloadTooLarge { size, max } if size == MAX_FRAME_PAYLOAD + 1 && max == MAX_FRAME_PAYLOAD
        ));
        assert!(encode_header(16, 0).is_err());
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x05, 0x00, 0x00][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_frame(b"hello", &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 2);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap();
        assert!(result.is_none());
        assert_eq!(buf.len(), HEADER_SIZE + 2, "incomplete frame must not be consumed");
    }

    #[test]
    fn test_decode_version_mismatch() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0x2000_0001);
        buf.put_u8(0);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(
            result,
            Err(FrameError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_decode_payload_too_large() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(encode_header(PROTOCOL_VERSION, 32 * 1024 * 1024).unwrap());

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_multiple_frames() {
        let mut buf = BytesMut::new();
        encode_frame(b"first", &mut buf).unwrap();
        encode_frame(b"second", &mut buf).unwrap();

        let f1 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        let f2 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();

        assert_eq!(f1.as_ref(), b"first");
        assert_eq!(f2.as_ref(), b"second");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_payload() {
        let mut buf = BytesMut::new();
        encode_frame(b"", &mut buf).unwrap();

        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn test_payload_limit_capped_by_length_field() {
        let cfg = FrameConfig {
            max_payload_size: usize::MAX,
            ..FrameConfig::default()
        };
        assert_eq!(cfg.payload_limit(), MAX_FRAME_PAYLOAD);
        assert_eq!(FrameConfig::default().payload_limit(), DEFAULT_MAX_PAYLOAD);
    }
}
