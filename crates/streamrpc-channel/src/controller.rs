use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

type CancelCallback = Box<dyn FnOnce() + Send>;

/// Where a call stands, as seen by its controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    /// Freshly created or reset; no outcome yet.
    Idle,
    Completed,
    /// Failed with the given text.
    Failed(String),
    Cancelled,
}

/// Per-call status object shared between the caller and a channel.
///
/// A controller records whether its call failed (and why) and carries an
/// optional cancel hook that a channel installs while the call is in flight.
/// Share it as `Arc<Controller>`; every method takes `&self`.
#[derive(Default)]
pub struct Controller {
    inner: Mutex<Inner>,
}

struct Inner {
    state: CallState,
    on_cancel: Option<CancelCallback>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            on_cancel: None,
        }
    }
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear the outcome and drop any registered cancel hook.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CallState::Idle;
        inner.on_cancel = None;
    }

    /// Record a failure. The latest text wins.
    pub fn set_failed(&self, reason: impl Into<String>) {
        self.lock().state = CallState::Failed(reason.into());
    }

    pub fn mark_completed(&self) {
        let mut inner = self.lock();
        inner.state = CallState::Completed;
        inner.on_cancel = None;
    }

    pub fn failed(&self) -> bool {
        matches!(self.lock().state, CallState::Failed(_))
    }

    /// Failure text, if the call failed.
    pub fn error_text(&self) -> Option<String> {
        match &self.lock().state {
            CallState::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.lock().state == CallState::Cancelled
    }

    pub fn is_completed(&self) -> bool {
        self.lock().state == CallState::Completed
    }

    pub fn state(&self) -> CallState {
        self.lock().state.clone()
    }

    /// Install the hook [`start_cancel`](Self::start_cancel) runs. Replaces
    /// any earlier hook.
    pub fn notify_on_cancel(&self, callback: impl FnOnce() + Send + 'static) {
        self.lock().on_cancel = Some(Box::new(callback));
    }

    /// Drop the cancel hook without running it.
    pub fn clear_cancel(&self) {
        self.lock().on_cancel = None;
    }

    /// Mark the call cancelled and run the cancel hook, if any.
    ///
    /// The hook runs at most once and never under the controller's lock, so
    /// it may call back into this controller.
    pub fn start_cancel(&self) {
        let callback = {
            let mut inner = self.lock();
            inner.state = CallState::Cancelled;
            inner.on_cancel.take()
        };
        match callback {
            Some(callback) => callback(),
            None => debug!("cancel requested with no hook registered"),
        }
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Controller")
            .field("state", &inner.state)
            .field("cancel_hook", &inner.on_cancel.is_some())
            .finish()
    }
}
