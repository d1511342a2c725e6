use std::sync::Arc;

use serde::Serialize;

use crate::controller::Controller;
use crate::error::CallError;
use crate::method::{Method, ResponseShape};

/// The call surface both channel kinds share.
///
/// `done` receives the outcome exactly once. A synchronous channel runs it
/// before `call_method` returns; a multiplexed channel may run it later on
/// its reader thread.
pub trait RpcChannel {
    fn call_method<Req, Resp, F>(
        &mut self,
        method: &Method<Req, Resp>,
        request: &Req,
        controller: &Arc<Controller>,
        done: F,
    ) where
        Req: Serialize,
        Resp: ResponseShape,
        F: FnOnce(Result<Resp, CallError>) + Send + 'static;
}
