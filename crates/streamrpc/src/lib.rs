//! Framed RPC over persistent byte streams.
//!
//! streamrpc sends typed method calls over one TCP or Unix socket per
//! connection, either one call at a time or many calls multiplexed with
//! responses matched by sequence id.
//!
//! # Crate Structure
//!
//! - [`transport`] — Byte-stream connections, listener and endpoint parsing
//! - [`frame`] — Length-prefixed frames and the message envelope they carry
//! - [`channel`] — Controllers, methods, services, and the synchronous and
//!   multiplexed channels

/// Re-export transport types.
pub mod transport {
    pub use streamrpc_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use streamrpc_frame::*;
}

/// Re-export channel types.
pub mod channel {
    pub use streamrpc_channel::*;
}
