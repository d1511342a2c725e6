//! RPC channels over one framed connection.
//!
//! Two channel kinds share the same envelope protocol:
//! - [`SyncChannel`]: one call at a time, the caller blocks for the reply
//! - [`MuxChannel`]: many calls in flight, replies matched by sequence id on
//!   a reader thread, inbound requests served from a [`ServiceRegistry`]
//!
//! Calls are described by typed [`Method`]s and report their outcome
//! through a shared [`Controller`].

pub mod channel;
pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod method;
pub mod mux_channel;
pub mod pending;
pub mod service;
pub mod stats;
pub mod sync_channel;

pub use channel::RpcChannel;
pub use codec::{BodyCodec, JsonCodec};
pub use config::{ChannelConfig, DEFAULT_READER_THREAD_NAME};
pub use controller::{CallState, Controller};
pub use error::{CallError, CodecError, Result};
pub use method::{Method, NoResponse, ResponseShape};
pub use mux_channel::{MuxChannel, CANCELLED_TEXT};
pub use pending::{PendingCall, PendingTable};
pub use service::{HandlerOutcome, ServiceRegistry};
pub use stats::{ChannelStats, StatsSnapshot};
pub use sync_channel::SyncChannel;
