use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use streamrpc_frame::{
    Envelope, EnvelopeError, FrameError, FrameReader, FrameWriter, MessageType,
};
use streamrpc_transport::Connection;
use tracing::{debug, trace, warn};

use crate::channel::RpcChannel;
use crate::codec::{BodyCodec, JsonCodec};
use crate::config::ChannelConfig;
use crate::controller::Controller;
use crate::error::{CallError, Result};
use crate::method::{Method, ResponseShape};
use crate::pending::{Completion, Inserted, PendingCall, PendingTable};
use crate::service::{HandlerOutcome, ServiceRegistry};
use crate::stats::ChannelStats;

/// Failure text given to calls cancelled through their controller.
pub const CANCELLED_TEXT: &str = "call cancelled";

type CloseHandler = Box<dyn FnOnce() + Send>;

/// A channel with many calls in flight over one connection.
///
/// Requests from any thread are written under a single writer lock, one
/// whole frame at a time. A dedicated reader thread reads every inbound
/// frame and:
/// - completes the pending call a response answers (matched by sequence id)
/// - serves inbound requests from the channel's [`ServiceRegistry`]
/// - stops on DISCONNECT or any read error
///
/// When the reader stops, every call still pending completes with
/// [`CallError::ConnectionClosed`] and no new call is accepted. The close
/// handler, if set, runs after that.
///
/// Completion callbacks run on the reader thread (or inline on the calling
/// thread for early failures), never under an internal lock. They must not
/// block on another call of the same channel.
pub struct MuxChannel<S: Connection, C: BodyCodec = JsonCodec> {
    shared: Arc<Shared<S, C>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct Shared<S, C> {
    writer: Mutex<FrameWriter<S>>,
    control: S,
    pending: PendingTable,
    next_sequence: AtomicU32,
    closing: AtomicBool,
    services: ServiceRegistry<C>,
    config: ChannelConfig,
    stats: ChannelStats,
    on_close: Mutex<CloseHook>,
}

#[derive(Default)]
struct CloseHook {
    fired: bool,
    handler: Option<CloseHandler>,
}

impl<S: Connection> MuxChannel<S, JsonCodec> {
    /// JSON bodies, no served methods, default configuration.
    pub fn new(stream: S) -> Result<Self> {
        Self::with_services(stream, ServiceRegistry::new(), ChannelConfig::default())
    }
}

impl<S: Connection, C: BodyCodec> MuxChannel<S, C> {
    /// Start a channel that also serves `services` to the peer.
    ///
    /// Spawns the reader thread. Bodies use the registry's codec.
    pub fn with_services(stream: S, services: ServiceRegistry<C>, config: ChannelConfig) -> Result<Self> {
        let read_half = stream.try_clone_connection().map_err(FrameError::Io)?;
        let control = stream.try_clone_connection().map_err(FrameError::Io)?;

        // The reader waits for as long as the connection lives.
        read_half.set_read_timeout(None).map_err(FrameError::Io)?;
        let reader = FrameReader::with_config(read_half, config.frame.clone());
        let writer = FrameWriter::with_config_stream(stream, config.frame.clone())?;
        let thread_name = config.reader_thread_name.clone();

        let shared = Arc::new(Shared {
            writer: Mutex::new(writer),
            control,
            pending: PendingTable::new(),
            next_sequence: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            services,
            config,
            stats: ChannelStats::new(),
            on_close: Mutex::new(CloseHook::default()),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || thread_shared.run_reader(reader))
            .map_err(FrameError::Io)?;

        debug!(
            codec = shared.services.codec().name(),
            methods = shared.services.len(),
            "channel started"
        );

        Ok(Self {
            shared,
            reader: Mutex::new(Some(handle)),
        })
    }

    /// Start a call; `on_complete` receives its outcome exactly once.
    ///
    /// Returns the sequence id used on the wire. The controller is reset,
    /// then left holding the outcome; cancelling it via
    /// [`Controller::start_cancel`] completes the call with
    /// [`CallError::Cancelled`]. Methods declared with
    /// [`NoResponse`](crate::NoResponse) complete as soon as the request is
    /// written and never enter the pending table.
    pub fn call<Req, Resp, F>(
        &self,
        method: &Method<Req, Resp>,
        request: &Req,
        controller: &Arc<Controller>,
        on_complete: F,
    ) -> u32
    where
        Req: Serialize,
        Resp: ResponseShape,
        F: FnOnce(Result<Resp>) + Send + 'static,
    {
        let shared = &self.shared;
        controller.reset();
        let sequence_id = shared.next_sequence.fetch_add(1, Ordering::Relaxed);

        let body = match shared.services.codec().encode(request) {
            Ok(body) => body,
            Err(err) => {
                finish(controller, Err(err.into()), on_complete);
                return sequence_id;
            }
        };
        let envelope = Envelope::request(sequence_id, method.name(), body);

        if let Some(value) = Resp::without_response() {
            let outcome = if shared.pending.is_closed() {
                Err(CallError::ConnectionClosed)
            } else {
                shared.send(&envelope).map(|()| value).map_err(CallError::from)
            };
            if let Err(err) = &outcome {
                warn!(sequence_id, method = method.name(), error = %err, "one-way request not sent");
            }
            finish(controller, outcome, on_complete);
            return sequence_id;
        }

        let codec = shared.services.codec().clone();
        let complete: Completion = Box::new(
            move |outcome: std::result::Result<bytes::Bytes, CallError>, controller: &Controller| {
                let result = outcome.and_then(|payload| Ok(Resp::decode_response(&codec, &payload)?));
                finish(controller, result, on_complete);
            },
        );

        let weak = Arc::downgrade(shared);
        controller.notify_on_cancel(move || {
            if let Some(shared) = weak.upgrade() {
                shared.cancel(sequence_id);
            }
        });

        let call = PendingCall::new(sequence_id, method.name(), Arc::clone(controller), complete);
        match shared.pending.insert(call) {
            Inserted::Added => {}
            Inserted::Displaced(previous) => {
                warn!(sequence_id, method = previous.method(), "duplicate sequence id, failing older call");
                previous.resolve(Err(CallError::DuplicateRequest(sequence_id)));
            }
            Inserted::Closed(call) => {
                call.resolve(Err(CallError::ConnectionClosed));
                return sequence_id;
            }
        }

        if controller.is_canceled() {
            shared.cancel(sequence_id);
            return sequence_id;
        }

        match shared.send(&envelope) {
            Ok(()) => trace!(sequence_id, method = method.name(), "request sent"),
            Err(err) => {
                warn!(sequence_id, method = method.name(), error = %err, "request write failed, closing connection");
                if let Some(call) = shared.pending.remove(sequence_id) {
                    call.resolve(Err(err.into()));
                }
                shared.shutdown();
            }
        }
        sequence_id
    }

    /// Start a call and wait for its outcome.
    ///
    /// Waits at most [`ChannelConfig::call_timeout`] when set; on expiry the
    /// call is withdrawn and fails with [`CallError::Timeout`]. Must not be
    /// used from a completion callback or a service handler of this channel.
    pub fn call_blocking<Req, Resp>(
        &self,
        method: &Method<Req, Resp>,
        request: &Req,
        controller: &Arc<Controller>,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: ResponseShape,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let sequence_id = self.call(method, request, controller, move |result| {
            let _ = tx.send(result);
        });

        let Some(timeout) = self.shared.config.call_timeout else {
            return rx.recv().unwrap_or(Err(CallError::ConnectionClosed));
        };

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => match self.shared.pending.remove(sequence_id) {
                Some(call) => {
                    debug!(sequence_id, method = method.name(), ?timeout, "call timed out");
                    call.resolve(Err(CallError::Timeout(timeout)));
                    Err(CallError::Timeout(timeout))
                }
                // Completed while timing out; its outcome is already queued.
                None => rx.recv().unwrap_or(Err(CallError::ConnectionClosed)),
            },
            Err(RecvTimeoutError::Disconnected) => Err(CallError::ConnectionClosed),
        }
    }

    /// Withdraw a pending call; it completes with [`CallError::Cancelled`].
    ///
    /// Returns `false` when no call with that id is pending. Nothing is
    /// sent to the peer; a late response for the id is discarded.
    pub fn cancel(&self, sequence_id: u32) -> bool {
        self.shared.cancel(sequence_id)
    }

    /// Send DISCONNECT, shut the connection down and wait for the reader.
    ///
    /// Idempotent. When called from the reader thread itself (inside a
    /// callback) it does not wait; the reader stops once the callback
    /// returns.
    pub fn close(&self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.shared.pending.is_closed() {
            if let Err(err) = self.shared.send(&Envelope::disconnect()) {
                debug!(error = %err, "disconnect not sent");
            }
        }
        self.shared.shutdown();

        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("reader thread panicked");
            }
        }
        // Covers a reader that panicked before its final drain.
        self.shared.fail_pending();
        self.shared.fire_close_handler();
    }

    /// Run `handler` once the connection has ended, for whatever reason.
    ///
    /// It runs on the reader thread after pending calls were failed, or
    /// right away on this thread if the connection is already gone. A later
    /// call replaces a handler that has not run yet.
    pub fn set_close_handler(&self, handler: impl FnOnce() + Send + 'static) {
        let mut hook = self.shared.on_close.lock().unwrap_or_else(PoisonError::into_inner);
        if hook.fired {
            drop(hook);
            handler();
        } else {
            hook.handler = Some(Box::new(handler));
        }
    }

    /// Traffic counters for this connection.
    pub fn stats(&self) -> &ChannelStats {
        &self.shared.stats
    }

    /// True once the connection is gone and calls fail immediately.
    pub fn is_closed(&self) -> bool {
        self.shared.pending.is_closed()
    }

    /// Number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn services(&self) -> &ServiceRegistry<C> {
        &self.shared.services
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }
}

impl<S: Connection, C: BodyCodec> Drop for MuxChannel<S, C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S: Connection, C: BodyCodec> fmt::Debug for MuxChannel<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxChannel")
            .field("pending", &self.shared.pending.len())
            .field("closed", &self.shared.pending.is_closed())
            .field("services", &self.shared.services)
            .finish_non_exhaustive()
    }
}

impl<S: Connection, C: BodyCodec> RpcChannel for MuxChannel<S, C> {
    fn call_method<Req, Resp, F>(
        &mut self,
        method: &Method<Req, Resp>,
        request: &Req,
        controller: &Arc<Controller>,
        done: F,
    ) where
        Req: Serialize,
        Resp: ResponseShape,
        F: FnOnce(Result<Resp>) + Send + 'static,
    {
        self.call(method, request, controller, done);
    }
}

impl<S: Connection, C: BodyCodec> RpcChannel for Arc<MuxChannel<S, C>> {
    fn call_method<Req, Resp, F>(
        &mut self,
        method: &Method<Req, Resp>,
        request: &Req,
        controller: &Arc<Controller>,
        done: F,
    ) where
        Req: Serialize,
        Resp: ResponseShape,
        F: FnOnce(Result<Resp>) + Send + 'static,
    {
        (**self).call(method, request, controller, done);
    }
}

/// Record the outcome on the controller, then hand it to the caller.
fn finish<T, F>(controller: &Controller, result: Result<T>, on_complete: F)
where
    F: FnOnce(Result<T>),
{
    match &result {
        Ok(_) => controller.mark_completed(),
        Err(_) if controller.is_canceled() => {}
        Err(err) => {
            controller.clear_cancel();
            controller.set_failed(err.to_string());
        }
    }
    on_complete(result);
}

impl<S: Connection, C: BodyCodec> Shared<S, C> {
    fn send(&self, envelope: &Envelope) -> std::result::Result<(), FrameError> {
        let sent = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_envelope(envelope);
        match sent {
            Ok(()) => self.stats.record_sent(),
            Err(_) => self.stats.record_send_error(),
        }
        sent
    }

    fn shutdown(&self) {
        if let Err(err) = self.control.shutdown_connection() {
            trace!(error = %err, "shutdown of closed connection");
        }
    }

    fn cancel(&self, sequence_id: u32) -> bool {
        match self.pending.remove(sequence_id) {
            Some(call) => {
                debug!(sequence_id, method = call.method(), "call cancelled");
                call.resolve(Err(CallError::Cancelled(CANCELLED_TEXT.to_string())));
                true
            }
            None => false,
        }
    }

    fn fail_pending(&self) {
        let drained = self.pending.drain_and_close();
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing calls left pending");
        }
        for call in drained {
            call.resolve(Err(CallError::ConnectionClosed));
        }
    }

    fn fire_close_handler(&self) {
        let handler = {
            let mut hook = self.on_close.lock().unwrap_or_else(PoisonError::into_inner);
            hook.fired = true;
            hook.handler.take()
        };
        if let Some(handler) = handler {
            trace!("running close handler");
            handler();
        }
    }

    fn run_reader(&self, mut reader: FrameReader<S>) {
        trace!("reader loop started");
        loop {
            let envelope = match reader.read_envelope() {
                Ok(envelope) => envelope,
                Err(FrameError::Envelope(EnvelopeError::UnknownMessageType { value, sequence_id })) => {
                    warn!(value, sequence_id, "skipping message of unknown type");
                    continue;
                }
                Err(FrameError::ConnectionClosed) => {
                    debug!("connection closed");
                    break;
                }
                Err(err) if self.closing.load(Ordering::Acquire) => {
                    debug!(error = %err, "reader stopped by close");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "reader loop failed");
                    break;
                }
            };

            self.stats.record_received(envelope.msg_type);
            trace!(
                msg_type = %envelope.msg_type,
                sequence_id = envelope.sequence_id,
                "message received"
            );
            match envelope.msg_type {
                MessageType::Request | MessageType::RequestCancel => self.serve(envelope),
                MessageType::Disconnect => {
                    debug!("peer disconnected");
                    break;
                }
                _ => self.complete(envelope),
            }
        }

        self.fail_pending();
        self.shutdown();
        self.fire_close_handler();
    }

    fn complete(&self, envelope: Envelope) {
        let Some(call) = self.pending.remove(envelope.sequence_id) else {
            warn!(
                sequence_id = envelope.sequence_id,
                msg_type = %envelope.msg_type,
                "discarding response for unknown call"
            );
            return;
        };

        let outcome = match envelope.msg_type {
            MessageType::Response => Ok(envelope.payload),
            MessageType::ResponseFailed => Err(CallError::Failed(envelope.payload_text())),
            MessageType::ResponseCancel => Err(CallError::Cancelled(envelope.payload_text())),
            MessageType::ResponseNotImplemented => Err(CallError::MethodNotFound {
                method: call.method().to_string(),
            }),
            other => Err(CallError::ProtocolViolation(format!("got {other}"))),
        };
        call.resolve(outcome);
    }

    fn serve(&self, envelope: Envelope) {
        let sequence_id = envelope.sequence_id;
        let method = envelope.method_name.as_deref().unwrap_or_default();

        let reply = match self.services.dispatch(method, &envelope.payload) {
            None => {
                warn!(method, sequence_id, "no handler for method");
                Some(Envelope::not_implemented(sequence_id))
            }
            Some(HandlerOutcome::Reply(body)) => Some(Envelope::response(sequence_id, body)),
            Some(HandlerOutcome::NoReply) => None,
            Some(HandlerOutcome::Failed(reason)) => {
                debug!(method, sequence_id, %reason, "handler failed");
                Some(Envelope::response_failed(sequence_id, &reason))
            }
        };

        if let Some(reply) = reply {
            if let Err(err) = self.send(&reply) {
                warn!(method, sequence_id, error = %err, "reply not sent");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::method::NoResponse;

    const ECHO: Method<String, String> = Method::new("Echo");
    const DIVIDE: Method<(i64, i64), i64> = Method::new("Divide");
    const LOG: Method<String, NoResponse> = Method::new("Log");
    const WAIT: Duration = Duration::from_secs(5);

    type Outcome = std::result::Result<String, String>;

    fn services(log: mpsc::Sender<String>) -> ServiceRegistry {
        let mut services = ServiceRegistry::new();
        services
            .register_method(&ECHO, |text: String| Ok::<_, String>(text))
            .register_method(&DIVIDE, |(a, b): (i64, i64)| {
                if b == 0 {
                    Err("division by zero")
                } else {
                    Ok(a / b)
                }
            });
        let log = Mutex::new(log);
        services.register_no_response("Log", move |line: String| {
            let _ = log.lock().unwrap().send(line);
        });
        services
    }

    /// Client channel plus a serving channel on the other end.
    fn connected() -> (MuxChannel<UnixStream>, MuxChannel<UnixStream>, mpsc::Receiver<String>) {
        let (left, right) = UnixStream::pair().unwrap();
        let (log_tx, log_rx) = mpsc::channel();
        let server = MuxChannel::with_services(right, services(log_tx), ChannelConfig::default()).unwrap();
        let client = MuxChannel::new(left).unwrap();
        (client, server, log_rx)
    }

    /// Client channel plus raw frame access to the other end.
    fn scripted() -> (MuxChannel<UnixStream>, FrameReader<UnixStream>, FrameWriter<UnixStream>) {
        let (left, right) = UnixStream::pair().unwrap();
        let client = MuxChannel::new(left).unwrap();
        let reader = FrameReader::new(right.try_clone().unwrap());
        let writer = FrameWriter::new(right);
        (client, reader, writer)
    }

    fn send_echo(
        client: &MuxChannel<UnixStream>,
        text: &str,
        tag: &'static str,
        tx: &mpsc::Sender<(&'static str, Outcome)>,
    ) -> Arc<Controller> {
        let controller = Arc::new(Controller::new());
        let tx = tx.clone();
        client.call(&ECHO, &text.to_string(), &controller, move |result| {
            let _ = tx.send((tag, result.map_err(|e| e.to_string())));
        });
        controller
    }

    #[test]
    fn echo_end_to_end() {
        let (client, _server, _log) = connected();
        let controller = Arc::new(Controller::new());

        let reply = client.call_blocking(&ECHO, &"hello".to_string(), &controller).unwrap();
        assert_eq!(reply, "hello");
        assert!(controller.is_completed());
        assert!(!controller.failed());
        assert_eq!(client.pending_calls(), 0);
    }

    #[test]
    fn responses_in_reverse_order_reach_their_callers() {
        let (client, mut peer_reader, mut peer_writer) = scripted();
        let (tx, rx) = mpsc::channel();

        let first = send_echo(&client, "first", "A", &tx);
        let second = send_echo(&client, "second", "B", &tx);

        let req_a = peer_reader.read_envelope().unwrap();
        let req_b = peer_reader.read_envelope().unwrap();
        assert_ne!(req_a.sequence_id, req_b.sequence_id);
        peer_writer
            .write_envelope(&Envelope::response(req_b.sequence_id, req_b.payload.clone()))
            .unwrap();
        peer_writer
            .write_envelope(&Envelope::response(req_a.sequence_id, req_a.payload.clone()))
            .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("B", Ok("second".to_string())));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("A", Ok("first".to_string())));
        assert!(first.is_completed());
        assert!(second.is_completed());
        assert_eq!(client.pending_calls(), 0);
    }

    #[test]
    fn response_for_unknown_id_is_discarded() {
        let (client, mut peer_reader, mut peer_writer) = scripted();
        let (tx, rx) = mpsc::channel();
        send_echo(&client, "real", "A", &tx);

        let request = peer_reader.read_envelope().unwrap();
        peer_writer
            .write_envelope(&Envelope::response(request.sequence_id + 100, Bytes::from_static(b"\"stray\"")))
            .unwrap();
        peer_writer
            .write_envelope(&Envelope::response(request.sequence_id, request.payload.clone()))
            .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("A", Ok("real".to_string())));
        assert!(rx.try_recv().is_err());
        assert!(!client.is_closed());
    }

    #[test]
    fn connection_loss_fails_every_pending_call() {
        let (client, mut peer_reader, peer_writer) = scripted();
        let (tx, rx) = mpsc::channel();
        let controllers: Vec<_> = ["one", "two", "three"]
            .into_iter()
            .map(|text| send_echo(&client, text, "pending", &tx))
            .collect();

        for _ in 0..3 {
            peer_reader.read_envelope().unwrap();
        }
        assert_eq!(client.pending_calls(), 3);
        drop(peer_reader);
        drop(peer_writer);

        for _ in 0..3 {
            let (_, outcome) = rx.recv_timeout(WAIT).unwrap();
            assert_eq!(outcome, Err("connection closed".to_string()));
        }
        assert!(rx.try_recv().is_err(), "each callback runs once");
        for controller in &controllers {
            assert_eq!(controller.error_text().as_deref(), Some("connection closed"));
        }
        assert_eq!(client.pending_calls(), 0);
        assert!(client.is_closed());

        let late = Arc::new(Controller::new());
        let err = client.call_blocking(&ECHO, &"late".to_string(), &late).unwrap_err();
        assert!(matches!(err, CallError::ConnectionClosed));
        assert!(late.failed());
    }

    #[test]
    fn peer_disconnect_fails_pending_calls() {
        let (client, mut peer_reader, mut peer_writer) = scripted();
        let (tx, rx) = mpsc::channel();
        send_echo(&client, "x", "A", &tx);

        peer_reader.read_envelope().unwrap();
        peer_writer.write_envelope(&Envelope::disconnect()).unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("A", Err("connection closed".to_string())));
        assert!(client.is_closed());
    }

    #[test]
    fn fire_and_forget_completes_without_response() {
        let (client, mut peer_reader, _peer_writer) = scripted();
        let controller = Arc::new(Controller::new());

        let done = client.call_blocking(&LOG, &"note".to_string(), &controller).unwrap();
        assert_eq!(done, NoResponse);
        assert!(controller.is_completed());
        assert_eq!(client.pending_calls(), 0);

        let request = peer_reader.read_envelope().unwrap();
        assert_eq!(request.msg_type, MessageType::Request);
        assert_eq!(request.method_name.as_deref(), Some("Log"));
    }

    #[test]
    fn no_response_method_is_served_without_reply() {
        let (left, right) = UnixStream::pair().unwrap();
        let (log_tx, log_rx) = mpsc::channel();
        let _server = MuxChannel::with_services(right, services(log_tx), ChannelConfig::default()).unwrap();
        let mut reader = FrameReader::new(left.try_clone().unwrap());
        let mut writer = FrameWriter::new(left);

        writer
            .write_envelope(&Envelope::request(0, "Log", Bytes::from_static(b"\"quiet\"")))
            .unwrap();
        writer
            .write_envelope(&Envelope::request(1, "Echo", Bytes::from_static(b"\"loud\"")))
            .unwrap();

        let reply = reader.read_envelope().unwrap();
        assert_eq!(reply.msg_type, MessageType::Response);
        assert_eq!(reply.sequence_id, 1);
        assert_eq!(reply.payload, Bytes::from_static(b"\"loud\""));
        assert_eq!(log_rx.recv_timeout(WAIT).unwrap(), "quiet");
    }

    #[test]
    fn one_way_and_echo_share_a_connection() {
        let (client, _server, log) = connected();
        let controller = Arc::new(Controller::new());

        client.call_blocking(&LOG, &"first".to_string(), &controller).unwrap();
        let reply = client.call_blocking(&ECHO, &"second".to_string(), &controller).unwrap();
        assert_eq!(reply, "second");
        assert_eq!(log.recv_timeout(WAIT).unwrap(), "first");
    }

    #[test]
    fn unknown_method_is_not_implemented() {
        let (client, _server, _log) = connected();
        let controller = Arc::new(Controller::new());
        let missing: Method<String, String> = Method::named("Missing");

        let err = client.call_blocking(&missing, &String::new(), &controller).unwrap_err();
        assert!(matches!(err, CallError::MethodNotFound { ref method } if method == "Missing"));
        assert_eq!(controller.error_text().as_deref(), Some("Not Implemented"));
    }

    #[test]
    fn handler_failure_reaches_caller() {
        let (client, _server, _log) = connected();
        let controller = Arc::new(Controller::new());

        let err = client.call_blocking(&DIVIDE, &(1, 0), &controller).unwrap_err();
        assert!(matches!(err, CallError::Failed(ref text) if text == "division by zero"));
        assert_eq!(controller.error_text().as_deref(), Some("division by zero"));

        assert_eq!(client.call_blocking(&DIVIDE, &(9, 3), &controller).unwrap(), 3);
        assert!(!controller.failed());
    }

    #[test]
    fn cancel_through_controller() {
        let (client, mut peer_reader, mut peer_writer) = scripted();
        let (tx, rx) = mpsc::channel();
        let controller = send_echo(&client, "slow", "A", &tx);

        let request = peer_reader.read_envelope().unwrap();
        controller.start_cancel();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("A", Err(CANCELLED_TEXT.to_string())));
        assert!(controller.is_canceled());
        assert_eq!(client.pending_calls(), 0);

        // A late response is an unknown id by now.
        peer_writer
            .write_envelope(&Envelope::response(request.sequence_id, request.payload.clone()))
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(!client.cancel(request.sequence_id));
    }

    #[test]
    fn peer_cancel_response_fails_call() {
        let (client, mut peer_reader, mut peer_writer) = scripted();
        let (tx, rx) = mpsc::channel();
        let controller = send_echo(&client, "x", "A", &tx);

        let request = peer_reader.read_envelope().unwrap();
        peer_writer
            .write_envelope(&Envelope::response_cancel(request.sequence_id, "shutting down"))
            .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("A", Err("shutting down".to_string())));
        assert_eq!(controller.error_text().as_deref(), Some("shutting down"));
    }

    #[test]
    fn blocking_call_times_out() {
        let (left, _right) = UnixStream::pair().unwrap();
        let config = ChannelConfig::default().with_call_timeout(Duration::from_millis(50));
        let client = MuxChannel::with_services(left, ServiceRegistry::<JsonCodec>::new(), config).unwrap();
        let controller = Arc::new(Controller::new());

        let err = client.call_blocking(&ECHO, &"x".to_string(), &controller).unwrap_err();
        assert!(matches!(err, CallError::Timeout(t) if t == Duration::from_millis(50)));
        assert!(controller.failed());
        assert_eq!(client.pending_calls(), 0);
    }

    #[test]
    fn unknown_message_type_is_skipped() {
        let (client, mut peer_reader, mut peer_writer) = scripted();
        let (tx, rx) = mpsc::channel();
        send_echo(&client, "after", "A", &tx);
        let request = peer_reader.read_envelope().unwrap();

        // type = 7, id = 0: not a known message type.
        peer_writer.write_frame(&[0x08, 0x07, 0x10, 0x00]).unwrap();
        peer_writer
            .write_envelope(&Envelope::response(request.sequence_id, request.payload.clone()))
            .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("A", Ok("after".to_string())));
        assert!(!client.is_closed());
    }

    #[test]
    fn sequence_ids_wrap_around() {
        let (client, mut peer_reader, _peer_writer) = scripted();
        client.shared.next_sequence.store(u32::MAX, Ordering::Relaxed);
        let controller = Arc::new(Controller::new());

        let first = client.call(&LOG, &"a".to_string(), &controller, |_| {});
        let second = client.call(&LOG, &"b".to_string(), &controller, |_| {});
        assert_eq!((first, second), (u32::MAX, 0));
        assert_eq!(peer_reader.read_envelope().unwrap().sequence_id, u32::MAX);
        assert_eq!(peer_reader.read_envelope().unwrap().sequence_id, 0);
    }

    #[test]
    fn close_sends_disconnect_and_fails_pending() {
        let (client, mut peer_reader, _peer_writer) = scripted();
        let (tx, rx) = mpsc::channel();
        send_echo(&client, "x", "A", &tx);
        peer_reader.read_envelope().unwrap();

        client.close();
        assert!(client.is_closed());
        assert_eq!(peer_reader.read_envelope().unwrap().msg_type, MessageType::Disconnect);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("A", Err("connection closed".to_string())));
        client.close();
    }

    #[test]
    fn concurrent_callers_share_one_channel() {
        let (client, _server, _log) = connected();
        let client = Arc::new(client);

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let client = Arc::clone(&client);
                thread::spawn(move || {
                    let controller = Arc::new(Controller::new());
                    for i in 0..20 {
                        let text = format!("{worker}-{i}");
                        let reply = client.call_blocking(&ECHO, &text, &controller).unwrap();
                        assert_eq!(reply, text);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(client.pending_calls(), 0);
    }

    fn close_signal(client: &MuxChannel<UnixStream>) -> mpsc::Receiver<&'static str> {
        let (tx, rx) = mpsc::channel();
        client.set_close_handler(move || {
            let _ = tx.send("closed");
        });
        rx
    }

    #[test]
    fn close_handler_runs_when_peer_goes_away() {
        let (client, peer_reader, peer_writer) = scripted();
        let closed = close_signal(&client);

        drop(peer_reader);
        drop(peer_writer);
        assert_eq!(closed.recv_timeout(WAIT).unwrap(), "closed");
        assert!(client.is_closed());
        assert!(closed.recv_timeout(Duration::from_millis(50)).is_err(), "runs once");
    }

    #[test]
    fn close_handler_runs_after_pending_calls_fail() {
        let (client, mut peer_reader, mut peer_writer) = scripted();
        let (tx, rx) = mpsc::channel();
        send_echo(&client, "x", "A", &tx);
        let closed = close_signal(&client);

        peer_reader.read_envelope().unwrap();
        peer_writer.write_envelope(&Envelope::disconnect()).unwrap();

        assert_eq!(closed.recv_timeout(WAIT).unwrap(), "closed");
        // The call had already failed when the handler ran.
        assert_eq!(rx.try_recv().unwrap(), ("A", Err("connection closed".to_string())));
        client.close();
        assert!(closed.try_recv().is_err());
    }

    #[test]
    fn close_handler_set_late_runs_immediately() {
        let (client, _peer_reader, _peer_writer) = scripted();
        client.close();

        let closed = close_signal(&client);
        assert_eq!(closed.try_recv().unwrap(), "closed");
    }

    #[test]
    fn stats_count_echo_exchange() {
        let (client, server, _log) = connected();
        let controller = Arc::new(Controller::new());

        client.call_blocking(&ECHO, &"one".to_string(), &controller).unwrap();
        client.call_blocking(&LOG, &"two".to_string(), &controller).unwrap();
        let missing: Method<String, String> = Method::named("Missing");
        client.call_blocking(&missing, &String::new(), &controller).unwrap_err();

        let stats = client.stats().snapshot();
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.send_errors, 0);
        assert_eq!(stats.received, 2);
        assert_eq!(stats.received_by_type.get("RESPONSE"), Some(&1));
        assert_eq!(stats.received_by_type.get("RESPONSE_NOT_IMPLEMENTED"), Some(&1));

        assert_eq!(server.stats().received_of(MessageType::Request), 3);
        assert_eq!(server.stats().received(), 3);
    }

    #[test]
    fn send_errors_are_counted() {
        let (left, _right) = UnixStream::pair().unwrap();
        let mut config = ChannelConfig::default();
        config.frame.write_timeout = Some(Duration::from_millis(20));
        let client = MuxChannel::with_services(left, ServiceRegistry::<JsonCodec>::new(), config).unwrap();
        let controller = Arc::new(Controller::new());

        // Larger than the socket buffer of a peer that never reads.
        let big = "x".repeat(4 * 1024 * 1024);
        let err = client.call_blocking(&LOG, &big, &controller).unwrap_err();
        assert!(matches!(err, CallError::Frame(_)));
        assert_eq!(client.stats().send_errors(), 1);
        assert_eq!(client.stats().sent(), 0);
    }

    #[test]
    fn failed_call_leaves_no_cancel_hook() {
        let (client, mut peer_reader, mut peer_writer) = scripted();
        let (tx, rx) = mpsc::channel();
        let first = send_echo(&client, "first", "A", &tx);

        let request = peer_reader.read_envelope().unwrap();
        peer_writer
            .write_envelope(&Envelope::response_failed(request.sequence_id, "boom"))
            .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("A", Err("boom".to_string())));
        assert!(format!("{first:?}").contains("cancel_hook: false"));

        // Reuse the id, then cancel through the old controller.
        client.shared.next_sequence.store(request.sequence_id, Ordering::Relaxed);
        send_echo(&client, "second", "B", &tx);
        let reused = peer_reader.read_envelope().unwrap();
        assert_eq!(reused.sequence_id, request.sequence_id);

        first.start_cancel();
        assert_eq!(client.pending_calls(), 1);
        peer_writer
            .write_envelope(&Envelope::response(reused.sequence_id, reused.payload.clone()))
            .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("B", Ok("second".to_string())));
    }

    #[test]
    fn rpc_channel_trait_on_shared_channel() {
        let (client, _server, _log) = connected();
        let mut client = Arc::new(client);
        let controller = Arc::new(Controller::new());
        let (tx, rx) = mpsc::channel();

        client.call_method(&ECHO, &"trait".to_string(), &controller, move |result| {
            let _ = tx.send(result.map_err(|e| e.to_string()));
        });
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok("trait".to_string()));
    }
}
