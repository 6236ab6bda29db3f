//! The per-connection HTTP/1.1 request loop.
//!
//! A session reads one request, hands it to the handler, writes the
//! response and repeats while both sides want the connection kept alive.
//! Requests on one connection are handled strictly one after another.
//! Transport and parse failures end the session quietly; only handler
//! errors are returned to the caller.
use bytes::Bytes;
use http::{
    header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING},
    HeaderValue, Method, Response, Version,
};
use service_async::Service;
use tracing::{debug, warn};
use usvc_core::{
    http::{
        codec::{body_allowed, write_response, ReadError, RequestReader},
        is_conn_keepalive, HttpHandler, CLOSE_VALUE, DEFAULT_MAX_REQUEST_SIZE, KEEPALIVE_VALUE,
    },
    listener::SessionStream,
    metrics::{ConnectionHandle, Reporter, SessionMetrics},
};

/// Serves every request arriving on one connection with `H`, and reports
/// the connection's traffic to `R` once it is over.
#[derive(Clone)]
pub struct HttpSession<H, R> {
    handler: H,
    reporter: R,
    max_request_size: usize,
}

impl<H, R> HttpSession<H, R> {
    pub fn new(handler: H, reporter: R) -> Self {
        Self {
            handler,
            reporter,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
        }
    }

    /// Limit the size of a single request, head and body together.
    pub fn with_max_request_size(mut self, max_request_size: usize) -> Self {
        self.max_request_size = max_request_size;
        self
    }
}

impl<H, R, S> Service<S> for HttpSession<H, R>
where
    S: SessionStream,
    H: HttpHandler,
    R: Reporter,
{
    type Response = ();
    type Error = H::Error;

    async fn call(&self, stream: S) -> Result<Self::Response, Self::Error> {
        run_session(stream, &self.handler, &self.reporter, self.max_request_size).await
    }
}

/// Run the request loop on `stream` until the peer leaves, a request asks
/// for the connection to close, I/O fails or the handler errors.
///
/// When `reporter` is enabled it receives exactly one record, whichever
/// way the loop ended. The handler error, if any, is returned after that.
pub async fn run_session<S, H, R>(
    mut stream: S,
    handler: &H,
    reporter: &R,
    max_request_size: usize,
) -> Result<(), H::Error>
where
    S: SessionStream,
    H: HttpHandler,
    R: Reporter,
{
    let handle = stream.connection_handle();
    let mut metrics = reporter
        .enabled()
        .then(|| SessionMetrics::start(handle));
    let mut reader = RequestReader::new(max_request_size);

    let outcome = loop {
        let (request, consumed) = match reader.read(&mut stream).await {
            Ok(Some(parsed)) => parsed,
            Ok(None) => {
                debug!("Connection {handle} closed by peer");
                shutdown(&mut stream, handle).await;
                break Ok(());
            }
            Err(ReadError::Io(e)) => {
                debug!("read request on connection {handle} failed: {e}");
                break Ok(());
            }
            Err(e) => {
                warn!("drop connection {handle}: {e}");
                break Ok(());
            }
        };
        if let Some(metrics) = metrics.as_mut() {
            metrics.bytes_read += consumed as u64;
        }

        let version = request.version();
        let keepalive = is_conn_keepalive(request.headers(), version);
        let head = request.method() == Method::HEAD;

        let response = match handler.handle(request).await {
            Ok(response) => finalize_response(response, version, keepalive, head),
            Err(e) => {
                debug!("handler failed on connection {handle}");
                break Err(e);
            }
        };

        match write_response(&mut stream, &response).await {
            Ok(written) => {
                if let Some(metrics) = metrics.as_mut() {
                    metrics.bytes_written += written as u64;
                    metrics.request_count += 1;
                }
            }
            Err(e) => {
                warn!("write response on connection {handle} failed: {e}");
                break Ok(());
            }
        }

        if !keepalive {
            shutdown(&mut stream, handle).await;
            break Ok(());
        }
    };

    if let Some(mut metrics) = metrics {
        metrics.finish();
        reporter.report(&metrics);
    }
    outcome
}

async fn shutdown<S: SessionStream>(stream: &mut S, handle: ConnectionHandle) {
    if let Err(e) = stream.shutdown().await {
        debug!("shutdown connection {handle} failed: {e}");
    }
}

/// Prepare a handler response for the wire.
///
/// The response takes the request's protocol version, gets a
/// `Content-Length` matching its body (none for statuses without a body)
/// and a `Connection` header reflecting `keepalive`. Responses to `HEAD`
/// keep their length but lose the body.
pub fn finalize_response(
    mut response: Response<Bytes>,
    version: Version,
    keepalive: bool,
    head: bool,
) -> Response<Bytes> {
    *response.version_mut() = version;
    let status = response.status();
    let body_len = response.body().len();
    let headers = response.headers_mut();

    headers.remove(TRANSFER_ENCODING);
    if body_allowed(status) {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body_len));
    } else {
        headers.remove(CONTENT_LENGTH);
    }

    match (keepalive, version) {
        (true, Version::HTTP_10) => {
            headers.insert(CONNECTION, KEEPALIVE_VALUE);
        }
        (true, _) => {
            headers.remove(CONNECTION);
        }
        (false, _) => {
            headers.insert(CONNECTION, CLOSE_VALUE);
        }
    }

    if head || !body_allowed(status) {
        *response.body_mut() = Bytes::new();
    }
    response
}
