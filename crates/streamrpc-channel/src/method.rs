use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use crate::codec::BodyCodec;
use crate::error::CodecError;

/// A named remote method with its request and response types.
///
/// The name is what goes on the wire; the type parameters only tie a call
/// site to the shapes it sends and expects back.
pub struct Method<Req, Resp> {
    name: Cow<'static, str>,
    _shape: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Method<Req, Resp> {
    /// A method with a static name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            _shape: PhantomData,
        }
    }

    /// A method whose name is only known at runtime.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            _shape: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<Req, Resp> Clone for Method<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _shape: PhantomData,
        }
    }
}

impl<Req, Resp> fmt::Debug for Method<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Method").field(&self.name).finish()
    }
}

/// How a call's response type is produced.
///
/// Every deserializable type is read from the response payload. The one
/// exception is [`NoResponse`]: calls declared with it are fire-and-forget
/// and complete as soon as the request is written.
pub trait ResponseShape: Sized + Send + 'static {
    /// Decode a RESPONSE payload into this type.
    fn decode_response<C: BodyCodec>(codec: &C, payload: &[u8]) -> Result<Self, CodecError>;

    /// `Some` when no response is expected; the value completes the call.
    fn without_response() -> Option<Self> {
        None
    }
}

impl<T: DeserializeOwned + Send + 'static> ResponseShape for T {
    fn decode_response<C: BodyCodec>(codec: &C, payload: &[u8]) -> Result<Self, CodecError> {
        codec.decode(payload)
    }
}

/// Response type of a method that never answers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoResponse;

impl ResponseShape for NoResponse {
    fn decode_response<C: BodyCodec>(_codec: &C, _payload: &[u8]) -> Result<Self, CodecError> {
        Ok(NoResponse)
    }

    fn without_response() -> Option<Self> {
        Some(NoResponse)
    }
}
