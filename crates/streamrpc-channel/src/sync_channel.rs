use std::io::ErrorKind;
use std::sync::Arc;

use serde::Serialize;
use streamrpc_frame::{Envelope, FrameError, FrameReader, FrameWriter, MessageType};
use streamrpc_transport::Connection;
use tracing::{debug, trace, warn};

use crate::channel::RpcChannel;
use crate::codec::{BodyCodec, JsonCodec};
use crate::config::ChannelConfig;
use crate::controller::Controller;
use crate::error::{CallError, Result};
use crate::method::{Method, ResponseShape};

/// A blocking channel with at most one call in flight.
///
/// Each call writes a REQUEST and then reads exactly one frame back, which
/// must be the RESPONSE to that request. There is no reader thread; the
/// connection is only touched from inside [`call`](Self::call).
///
/// After a failed read (timeout included) the stream position is unknown,
/// so the channel should be dropped rather than reused.
pub struct SyncChannel<S, C = JsonCodec> {
    reader: FrameReader<S>,
    writer: FrameWriter<S>,
    codec: C,
    controller: Arc<Controller>,
    next_sequence: u32,
    config: ChannelConfig,
}

impl<S: Connection> SyncChannel<S, JsonCodec> {
    /// JSON bodies, default configuration.
    pub fn new(stream: S) -> Result<Self> {
        Self::with_config(stream, JsonCodec, ChannelConfig::default())
    }
}

impl<S: Connection, C: BodyCodec> SyncChannel<S, C> {
    pub fn with_config(stream: S, codec: C, config: ChannelConfig) -> Result<Self> {
        let mut frame = config.frame.clone();
        frame.read_timeout = config.call_timeout.or(frame.read_timeout);

        let read_half = stream.try_clone_connection().map_err(FrameError::Io)?;
        let reader = FrameReader::with_config_stream(read_half, frame.clone())?;
        let writer = FrameWriter::with_config_stream(stream, frame)?;

        Ok(Self {
            reader,
            writer,
            codec,
            controller: Arc::new(Controller::new()),
            next_sequence: 0,
            config,
        })
    }

    /// The controller of the most recent [`call`](Self::call).
    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Sequence id the next call will use.
    pub fn next_sequence_id(&self) -> u32 {
        self.next_sequence
    }

    /// Perform one call and wait for its response.
    ///
    /// The channel's own controller is reset first and left holding the
    /// outcome. Methods declared with [`NoResponse`](crate::NoResponse)
    /// return as soon as the request is written.
    pub fn call<Req, Resp>(&mut self, method: &Method<Req, Resp>, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: ResponseShape,
    {
        let controller = Arc::clone(&self.controller);
        self.call_with(method, request, &controller)
    }

    fn call_with<Req, Resp>(
        &mut self,
        method: &Method<Req, Resp>,
        request: &Req,
        controller: &Controller,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: ResponseShape,
    {
        controller.reset();
        let result = self.round_trip(method, request);
        match &result {
            Ok(_) => controller.mark_completed(),
            Err(err) => {
                warn!(method = method.name(), error = %err, "call failed");
                controller.set_failed(err.to_string());
            }
        }
        result
    }

    fn round_trip<Req, Resp>(&mut self, method: &Method<Req, Resp>, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: ResponseShape,
    {
        let sequence_id = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let body = self.codec.encode(request)?;
        self.writer
            .write_envelope(&Envelope::request(sequence_id, method.name(), body))?;
        debug!(method = method.name(), sequence_id, "request sent");

        if let Some(value) = Resp::without_response() {
            return Ok(value);
        }

        let envelope = self.reader.read_envelope().map_err(|err| self.read_error(err))?;
        if envelope.msg_type != MessageType::Response {
            let detail = match envelope.payload_text() {
                text if text.is_empty() => format!("got {}", envelope.msg_type),
                text => format!("got {}: {text}", envelope.msg_type),
            };
            return Err(CallError::ProtocolViolation(detail));
        }
        if envelope.sequence_id != sequence_id {
            return Err(CallError::SequenceMismatch {
                expected: sequence_id,
                actual: envelope.sequence_id,
            });
        }

        Ok(Resp::decode_response(&self.codec, &envelope.payload)?)
    }

    fn read_error(&self, err: FrameError) -> CallError {
        match (&err, self.config.call_timeout) {
            (FrameError::Io(io), Some(timeout))
                if matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                CallError::Timeout(timeout)
            }
            _ => CallError::Frame(err),
        }
    }

    /// Tell the peer this side is done and shut the connection down.
    pub fn close(mut self) -> Result<()> {
        let sent = self.writer.write_envelope(&Envelope::disconnect());
        if let Err(err) = self.writer.get_ref().shutdown_connection() {
            trace!(error = %err, "shutdown of closed connection");
        }
        Ok(sent?)
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

impl<S: Connection, C: BodyCodec> RpcChannel for SyncChannel<S, C> {
    fn call_method<Req, Resp, F>(
        &mut self,
        method: &Method<Req, Resp>,
        request: &Req,
        controller: &Arc<Controller>,
        done: F,
    ) where
        Req: Serialize,
        Resp: ResponseShape,
        F: FnOnce(std::result::Result<Resp, CallError>) + Send + 'static,
    {
        let result = self.call_with(method, request, controller);
        done(result);
    }
}
