use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::codec::{BodyCodec, JsonCodec};
use crate::method::Method;

type Handler = Box<dyn Fn(&[u8]) -> HandlerOutcome + Send + Sync>;

/// What a handler produced for one inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Encoded response body; sent back as RESPONSE.
    Reply(Vec<u8>),
    /// The method never answers.
    NoReply,
    /// Sent back as RESPONSE_FAILED with this text.
    Failed(String),
}

/// Handlers for the methods this side serves, keyed by method name.
///
/// A multiplexed channel consults the registry for every REQUEST it reads;
/// names without a handler are answered with NOT_IMPLEMENTED.
pub struct ServiceRegistry<C = JsonCodec> {
    codec: C,
    handlers: HashMap<String, Handler>,
}

impl<C: BodyCodec + Default> ServiceRegistry<C> {
    pub fn new() -> Self {
        Self::with_codec(C::default())
    }
}

impl<C: BodyCodec + Default> Default for ServiceRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: BodyCodec> ServiceRegistry<C> {
    pub fn with_codec(codec: C) -> Self {
        Self {
            codec,
            handlers: HashMap::new(),
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Serve `name` with a handler that answers every request.
    ///
    /// An `Err` from the handler goes back to the caller as a failure with
    /// the error's text. Registering a name again replaces its handler.
    pub fn register<Req, Resp, E, F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        Req: DeserializeOwned,
        Resp: Serialize,
        E: fmt::Display,
        F: Fn(Req) -> Result<Resp, E> + Send + Sync + 'static,
    {
        let codec = self.codec.clone();
        self.insert(
            name.into(),
            Box::new(move |body| {
                let request = match codec.decode::<Req>(body) {
                    Ok(request) => request,
                    Err(err) => return HandlerOutcome::Failed(err.to_string()),
                };
                match handler(request) {
                    Ok(response) => match codec.encode(&response) {
                        Ok(bytes) => HandlerOutcome::Reply(bytes),
                        Err(err) => HandlerOutcome::Failed(err.to_string()),
                    },
                    Err(err) => HandlerOutcome::Failed(err.to_string()),
                }
            }),
        )
    }

    /// Serve a typed [`Method`].
    pub fn register_method<Req, Resp, E, F>(&mut self, method: &Method<Req, Resp>, handler: F) -> &mut Self
    where
        Req: DeserializeOwned,
        Resp: Serialize,
        E: fmt::Display,
        F: Fn(Req) -> Result<Resp, E> + Send + Sync + 'static,
    {
        self.register(method.name(), handler)
    }

    /// Serve `name` as a method that never answers.
    ///
    /// Requests that fail to decode are dropped, since there is no reply to
    /// carry the failure.
    pub fn register_no_response<Req, F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        Req: DeserializeOwned,
        F: Fn(Req) + Send + Sync + 'static,
    {
        let name = name.into();
        let codec = self.codec.clone();
        let label = name.clone();
        self.insert(
            name,
            Box::new(move |body| {
                match codec.decode::<Req>(body) {
                    Ok(request) => handler(request),
                    Err(err) => debug!(method = %label, error = %err, "dropping undecodable request"),
                }
                HandlerOutcome::NoReply
            }),
        )
    }

    fn insert(&mut self, name: String, handler: Handler) -> &mut Self {
        if self.handlers.insert(name.clone(), handler).is_some() {
            debug!(method = %name, "handler replaced");
        }
        self
    }

    /// Run the handler for `method`. `None` when nothing serves it.
    pub fn dispatch(&self, method: &str, body: &[u8]) -> Option<HandlerOutcome> {
        self.handlers.get(method).map(|handler| handler(body))
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<C> fmt::Debug for ServiceRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort_unstable();
        f.debug_struct("ServiceRegistry")
            .field("methods", &names)
            .finish_non_exhaustive()
    }
}
