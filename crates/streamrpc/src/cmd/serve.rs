use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use serde_json::Value;
use streamrpc_channel::{ChannelConfig, MuxChannel, ServiceRegistry};
use streamrpc_transport::{connect, Endpoint, RpcListener, RpcStream};

use crate::cmd::ServeArgs;
use crate::exit::{io_error, transport_error, CliError, CliResult, SUCCESS};

/// Methods served by `streamrpc serve`.
pub fn demo_services() -> ServiceRegistry {
    let mut services = ServiceRegistry::new();
    services.register("Echo", |value: Value| Ok::<_, String>(value));
    services.register_no_response("Log", |value: Value| {
        tracing::info!(%value, "log");
    });
    services
}

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let endpoint: Endpoint = args
        .endpoint
        .parse()
        .map_err(|err| transport_error("invalid endpoint", err))?;
    let listener = RpcListener::bind(&endpoint).map_err(|err| transport_error("bind failed", err))?;
    let bound = listener.endpoint().clone();

    let mut config = ChannelConfig::default().with_reader_thread_name("streamrpc-conn");
    if let Some(max) = args.max_payload {
        config.frame.max_payload_size = max;
    }

    let running = Arc::new(AtomicBool::new(true));
    let (stop_tx, stop_rx) = mpsc::channel();
    install_ctrlc_handler(running.clone(), stop_tx.clone())?;

    let acceptor = {
        let running = running.clone();
        thread::Builder::new()
            .name("streamrpc-accept".to_string())
            .spawn(move || {
                let result = accept_loop(&listener, &running, &config);
                let _ = stop_tx.send(());
                result
            })
            .map_err(|err| io_error("acceptor start failed", err))?
    };

    let methods = demo_services().method_names().join(",");
    tracing::info!(endpoint = %bound, %methods, "serving");

    let _ = stop_rx.recv();
    running.store(false, Ordering::SeqCst);
    // Wake the acceptor if it is still blocked in accept.
    let _ = connect(&bound);

    let result = acceptor
        .join()
        .map_err(|_| CliError::new(crate::exit::INTERNAL, "acceptor thread panicked"))?;
    result.map(|()| SUCCESS)
}

fn accept_loop(listener: &RpcListener, running: &AtomicBool, config: &ChannelConfig) -> CliResult<()> {
    let connections = Arc::new(Connections::default());

    while running.load(Ordering::SeqCst) {
        let stream = listener
            .accept()
            .map_err(|err| transport_error("accept failed", err))?;
        if !running.load(Ordering::SeqCst) {
            break;
        }

        match MuxChannel::with_services(stream, demo_services(), config.clone()) {
            Ok(channel) => connections.adopt(channel),
            Err(err) => tracing::warn!(error = %err, "connection setup failed"),
        }
    }

    connections.close_all();
    Ok(())
}

/// Live server-side channels, each removed as soon as its connection ends.
#[derive(Default)]
struct Connections {
    channels: Mutex<HashMap<u64, MuxChannel<RpcStream>>>,
    next_id: AtomicU64,
}

impl Connections {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, MuxChannel<RpcStream>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn adopt(self: &Arc<Self>, channel: MuxChannel<RpcStream>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::downgrade(self);
        channel.set_close_handler(move || {
            if let Some(registry) = registry.upgrade() {
                registry.release(id);
            }
        });

        // Never insert a channel that is already gone; its handler finds nothing to remove.
        let rejected = {
            let mut channels = self.lock();
            if channel.is_closed() {
                Some(channel)
            } else {
                channels.insert(id, channel);
                tracing::info!(connection = id, connections = channels.len(), "client connected");
                None
            }
        };
        drop(rejected);
    }

    fn release(&self, id: u64) {
        let removed = self.lock().remove(&id);
        if let Some(channel) = removed {
            let stats = channel.stats().snapshot();
            tracing::info!(
                connection = id,
                sent = stats.sent,
                received = stats.received,
                "client disconnected"
            );
            // Dropped outside the lock; runs on the channel's own reader thread.
            drop(channel);
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn close_all(&self) {
        let channels: Vec<_> = self.lock().drain().map(|(_, channel)| channel).collect();
        tracing::info!(connections = channels.len(), "shutting down");
        for channel in channels {
            channel.close();
        }
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>, stop: mpsc::Sender<()>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
        let _ = stop.send(());
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
