//! Many threads sharing one multiplexed channel.
//!
//! Both ends live in this process on a socket pair: one side serves
//! `Square`, the other fires calls from several threads at once and checks
//! every reply lands with the thread that asked.
//!
//! Run with:
//!   cargo run --example concurrent-calls

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;

use streamrpc::channel::{ChannelConfig, Controller, Method, MuxChannel, ServiceRegistry};

const SQUARE: Method<u64, u64> = Method::new("Square");

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (client_end, server_end) = UnixStream::pair()?;

    let mut services: ServiceRegistry = ServiceRegistry::new();
    services.register_method(&SQUARE, |n: u64| {
        n.checked_mul(n).ok_or("overflow")
    });
    let _server = MuxChannel::with_services(server_end, services, ChannelConfig::default())?;
    let client = Arc::new(MuxChannel::new(client_end)?);

    let workers: Vec<_> = (0..4u64)
        .map(|worker| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                let controller = Arc::new(Controller::new());
                for i in 0..5u64 {
                    let n = worker * 100 + i;
                    match client.call_blocking(&SQUARE, &n, &controller) {
                        Ok(square) => println!("worker {worker}: {n}^2 = {square}"),
                        Err(err) => eprintln!("worker {worker}: call failed: {err}"),
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        if worker.join().is_err() {
            eprintln!("worker panicked");
        }
    }

    eprintln!("pending after run: {}", client.pending_calls());
    Ok(())
}
