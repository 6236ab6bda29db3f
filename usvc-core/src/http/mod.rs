use std::future::Future;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Request, Response, Version};
use service_async::Service;

pub mod codec;

pub const CLOSE: &str = "close";
pub const KEEPALIVE: &str = "Keep-Alive";
#[allow(clippy::declare_interior_mutable_const)]
pub const CLOSE_VALUE: HeaderValue = HeaderValue::from_static(CLOSE);
#[allow(clippy::declare_interior_mutable_const)]
pub const KEEPALIVE_VALUE: HeaderValue = HeaderValue::from_static(KEEPALIVE);

/// Ceiling for one request, head and body included: 1 MB.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 1000 * 1000;

/// A request handler: one [`Request`] in, one [`Response`] out.
///
/// Every `Service<Request<Bytes>, Response = Response<Bytes>>` is a handler;
/// closures can be adapted with [`handler_fn`]. A handler is called through
/// `&self` and so may be invoked any number of times.
pub trait HttpHandler {
    type Error;

    fn handle(
        &self,
        request: Request<Bytes>,
    ) -> impl Future<Output = Result<Response<Bytes>, Self::Error>>;
}

impl<T> HttpHandler for T
where
    T: Service<Request<Bytes>, Response = Response<Bytes>>,
{
    type Error = T::Error;

    #[inline]
    fn handle(
        &self,
        request: Request<Bytes>,
    ) -> impl Future<Output = Result<Response<Bytes>, Self::Error>> {
        self.call(request)
    }
}

#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Use an async closure (or `async fn`) as a handler.
pub fn handler_fn<F, Fut, E>(f: F) -> HandlerFn<F>
where
    F: Fn(Request<Bytes>) -> Fut,
    Fut: Future<Output = Result<Response<Bytes>, E>>,
{
    HandlerFn { f }
}

impl<F, Fut, E> Service<Request<Bytes>> for HandlerFn<F>
where
    F: Fn(Request<Bytes>) -> Fut,
    Fut: Future<Output = Result<Response<Bytes>, E>>,
{
    type Response = Response<Bytes>;
    type Error = E;

    #[inline]
    fn call(
        &self,
        req: Request<Bytes>,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> {
        (self.f)(req)
    }
}

/// Whether the client asked for the connection to persist after this request.
///
/// HTTP/1.1 persists unless a `close` token is present, HTTP/1.0 only with an
/// explicit `keep-alive` token. Other versions never persist.
pub fn is_conn_keepalive(headers: &HeaderMap<HeaderValue>, version: Version) -> bool {
    match version {
        Version::HTTP_11 => !has_connection_token(headers, CLOSE),
        Version::HTTP_10 => has_connection_token(headers, KEEPALIVE),
        _ => false,
    }
}

fn has_connection_token(headers: &HeaderMap<HeaderValue>, token: &str) -> bool {
    headers
        .get_all(http::header::CONNECTION)
        .iter()
        .flat_map(|value| value.as_bytes().split(|&b| b == b','))
        .any(|t| t.trim_ascii().eq_ignore_ascii_case(token.as_bytes()))
}
