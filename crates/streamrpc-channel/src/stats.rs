use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use streamrpc_frame::MessageType;

const TYPES: [MessageType; 7] = [
    MessageType::Request,
    MessageType::Response,
    MessageType::ResponseCancel,
    MessageType::ResponseFailed,
    MessageType::ResponseNotImplemented,
    MessageType::Disconnect,
    MessageType::RequestCancel,
];

fn slot(msg_type: MessageType) -> usize {
    match msg_type {
        MessageType::Request => 0,
        MessageType::Response => 1,
        MessageType::ResponseCancel => 2,
        MessageType::ResponseFailed => 3,
        MessageType::ResponseNotImplemented => 4,
        MessageType::Disconnect => 5,
        MessageType::RequestCancel => 6,
    }
}

/// Traffic counters for one channel.
///
/// Updated lock-free from the calling threads and the reader thread; read
/// with [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct ChannelStats {
    sent: AtomicU64,
    send_errors: AtomicU64,
    received: AtomicU64,
    received_by_type: [AtomicU64; TYPES.len()],
}

/// Point-in-time copy of [`ChannelStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub send_errors: u64,
    pub received: u64,
    /// Keyed by schema name; types never seen are left out.
    pub received_by_type: BTreeMap<&'static str, u64>,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, msg_type: MessageType) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.received_by_type[slot(msg_type)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Messages of one type read from the peer.
    pub fn received_of(&self, msg_type: MessageType) -> u64 {
        self.received_by_type[slot(msg_type)].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let received_by_type = TYPES
            .iter()
            .map(|&msg_type| (msg_type.as_str(), self.received_of(msg_type)))
            .filter(|&(_, count)| count > 0)
            .collect();
        StatsSnapshot {
            sent: self.sent(),
            send_errors: self.send_errors(),
            received: self.received(),
            received_by_type,
        }
    }
}
