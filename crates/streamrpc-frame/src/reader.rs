use std::io::{ErrorKind, Read};

use bytes::{Bytes, BytesMut};
use streamrpc_transport::Connection;
use tracing::trace;

use crate::codec::{decode_frame, decode_header, FrameConfig, HEADER_SIZE};
use crate::envelope::Envelope;
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads internally — callers always get complete frames.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next frame payload (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF falls on a frame
    /// boundary and `Err(FrameError::ShortRead { .. })` when it cuts a frame.
    pub fn read_frame(&mut self) -> Result<Bytes> {
        loop {
            if let Some(payload) = decode_frame(&mut self.buf, self.config.payload_limit())? {
                trace!(len = payload.len(), "frame read");
                return Ok(payload);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(self.eof_error());
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Read the next frame and decode the envelope it carries.
    pub fn read_envelope(&mut self) -> Result<Envelope> {
        let payload = self.read_frame()?;
        Ok(Envelope::decode(payload)?)
    }

    fn eof_error(&self) -> FrameError {
        let received = self.buf.len();
        if received == 0 {
            return FrameError::ConnectionClosed;
        }
        let expected = if received < HEADER_SIZE {
            HEADER_SIZE
        } else {
            let header = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            HEADER_SIZE + decode_header(header).1
        };
        FrameError::ShortRead { expected, received }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl<T: Connection> FrameReader<T> {
    /// Create a frame reader for a connection and apply the read timeout from config.
    pub fn with_config_stream(inner: T, config: FrameConfig) -> Result<Self> {
        inner.set_read_timeout(config.read_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}
