use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::controller::Controller;
use crate::error::CallError;

/// Completion hook of an in-flight call. Receives the raw response payload
/// (or the error) and the call's controller.
pub type Completion = Box<dyn FnOnce(Result<Bytes, CallError>, &Controller) + Send>;

/// One call waiting for its response.
pub struct PendingCall {
    sequence_id: u32,
    method: String,
    controller: Arc<Controller>,
    complete: Completion,
}

impl PendingCall {
    pub fn new(
        sequence_id: u32,
        method: impl Into<String>,
        controller: Arc<Controller>,
        complete: Completion,
    ) -> Self {
        Self {
            sequence_id,
            method: method.into(),
            controller,
            complete,
        }
    }

    pub fn sequence_id(&self) -> u32 {
        self.sequence_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Run the completion hook. Consumes the call, so it runs exactly once.
    pub fn resolve(self, outcome: Result<Bytes, CallError>) {
        let Self {
            controller,
            complete,
            ..
        } = self;
        complete(outcome, &controller);
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("sequence_id", &self.sequence_id)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`PendingTable::insert`].
#[derive(Debug)]
pub enum Inserted {
    /// The call is now pending.
    Added,
    /// The call is pending; it displaced an older call with the same id.
    Displaced(PendingCall),
    /// The table is closed. The call is handed back unresolved.
    Closed(PendingCall),
}

/// In-flight calls keyed by sequence id.
///
/// Every operation holds the lock only for the map update. Entries come
/// back out to the caller, which resolves them after the lock is released.
/// Once [`drain_and_close`](Self::drain_and_close) has run no call can be
/// added again, so nothing is left behind after the final drain.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<TableInner>,
}

#[derive(Default)]
struct TableInner {
    calls: HashMap<u32, PendingCall>,
    closed: bool,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, call: PendingCall) -> Inserted {
        let mut inner = self.lock();
        if inner.closed {
            return Inserted::Closed(call);
        }
        match inner.calls.insert(call.sequence_id, call) {
            Some(previous) => Inserted::Displaced(previous),
            None => Inserted::Added,
        }
    }

    pub fn remove(&self, sequence_id: u32) -> Option<PendingCall> {
        self.lock().calls.remove(&sequence_id)
    }

    /// Close the table and take every pending call out of it.
    pub fn drain_and_close(&self) -> Vec<PendingCall> {
        let mut inner = self.lock();
        inner.closed = true;
        let mut calls: Vec<PendingCall> = inner.calls.drain().map(|(_, call)| call).collect();
        calls.sort_by_key(|call| call.sequence_id);
        calls
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
