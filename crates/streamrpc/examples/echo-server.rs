//! Minimal echo server: serves `Echo` on one Unix socket until the first
//! client disconnects.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal:
//!   cargo run --features cli -- call unix:/tmp/streamrpc-echo-<pid>/echo.sock \
//!     Echo --json '{"hello":"world"}'

use std::fs;

use streamrpc::channel::{ChannelConfig, MuxChannel, ServiceRegistry};
use streamrpc::transport::{Endpoint, RpcListener};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sock_dir = std::env::temp_dir().join(format!("streamrpc-echo-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let endpoint = Endpoint::Unix(sock_dir.join("echo.sock"));

    let listener = RpcListener::bind(&endpoint)?;
    eprintln!("Listening on {}", listener.endpoint());

    let stream = listener.accept()?;
    eprintln!("Client connected");

    let mut services: ServiceRegistry = ServiceRegistry::new();
    services.register("Echo", |value: serde_json::Value| {
        eprintln!("Echoing {value}");
        Ok::<_, String>(value)
    });
    let channel = MuxChannel::with_services(stream, services, ChannelConfig::default())?;

    while !channel.is_closed() {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    eprintln!("Client disconnected");

    drop(listener);
    let _ = fs::remove_dir_all(&sock_dir);
    Ok(())
}
