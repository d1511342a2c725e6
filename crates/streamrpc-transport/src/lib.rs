//! Byte-stream connections for streamrpc.
//!
//! A channel owns exactly one persistent, bidirectional byte stream. This
//! crate provides that stream over TCP or Unix domain sockets, plus the
//! [`Connection`] trait the channel layer is generic over.
//!
//! This is the lowest layer of streamrpc. Everything else builds on top of
//! the [`RpcStream`] type provided here.

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod traits;

pub use endpoint::{Endpoint, DEFAULT_PORT};
pub use error::{Result, TransportError};
pub use listener::{connect, RpcListener};
pub use traits::{Connection, RpcStream};
