use crate::error::ProtocolResult;
use crate::message::{Request, Response};

/// A single request/response exchange with a byte-store server.
///
/// Implementations perform exactly one round trip per call and do not split,
/// batch, or retry; that policy lives in [`crate::ByteStoreClient`].
/// A missing file is reported as [`crate::ProtocolError::NotFound`].
pub trait Transport: Send + Sync {
    fn call(&self, request: &Request) -> ProtocolResult<Response>;

    /// Largest request body the server accepts, if the transport knows it.
    fn max_body(&self) -> Option<usize> {
        None
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn call(&self, request: &Request) -> ProtocolResult<Response> {
        (**self).call(request)
    }

    fn max_body(&self) -> Option<usize> {
        (**self).max_body()
    }
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn call(&self, request: &Request) -> ProtocolResult<Response> {
        (**self).call(request)
    }

    fn max_body(&self) -> Option<usize> {
        (**self).max_body()
    }
}
