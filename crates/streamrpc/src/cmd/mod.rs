use clap::{Args, Subcommand};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod call;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the demo methods (Echo, Log) until interrupted.
    Serve(ServeArgs),
    /// Make one call and print the response.
    Call(CallArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Call(args) => call::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Endpoint to listen on: unix:/path, tcp:host:port or host[:port].
    #[arg(env = "STREAMRPC_ENDPOINT")]
    pub endpoint: String,
    /// Largest accepted frame payload in bytes.
    #[arg(long, value_name = "BYTES")]
    pub max_payload: Option<usize>,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Endpoint to connect to: unix:/path, tcp:host:port or host[:port].
    pub endpoint: String,
    /// Method name.
    pub method: String,
    /// JSON request body. Default: null.
    #[arg(long, value_name = "JSON")]
    pub json: Option<String>,
    /// Send without waiting for a response.
    #[arg(long)]
    pub no_response: bool,
    /// Use a multiplexed channel instead of a synchronous one.
    #[arg(long)]
    pub mux: bool,
    /// Maximum time to wait for the response (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
