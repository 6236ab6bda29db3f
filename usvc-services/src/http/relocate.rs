use std::{panic::AssertUnwindSafe, sync::Arc};

use bytes::Bytes;
use futures::FutureExt;
use futures_channel::oneshot;
use http::{Request, Response};
use service_async::Service;
use usvc_core::{
    http::HttpHandler,
    orchestrator::{Job, WorkerPool},
};

use crate::common::panic_message;

#[derive(thiserror::Error, Debug)]
pub enum RelocateError<E> {
    #[error("handler error: {0:?}")]
    Inner(E),
    #[error("handler panicked: {0}")]
    Panic(String),
    #[error("no handler worker accepted the request")]
    Unavailable,
    #[error("handler worker dropped the request")]
    Canceled,
}

/// Runs the wrapped handler on a [`WorkerPool`] instead of the calling
/// runtime.
///
/// The calling session suspends until the worker hands the response back,
/// so the I/O thread stays free while the handler computes. Clones share the
/// pool and the handler.
pub struct Relocate<H> {
    pool: Arc<WorkerPool>,
    handler: Arc<H>,
}

impl<H> Clone for Relocate<H> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<H> Relocate<H> {
    pub fn new(pool: Arc<WorkerPool>, handler: H) -> Self {
        Self {
            pool,
            handler: Arc::new(handler),
        }
    }
}

/// Wrap `handler` so every call runs on `pool`.
pub fn relocate<H>(pool: Arc<WorkerPool>, handler: H) -> Relocate<H> {
    Relocate::new(pool, handler)
}

impl<H> Service<Request<Bytes>> for Relocate<H>
where
    H: HttpHandler + Send + Sync + 'static,
    H::Error: Send + 'static,
{
    type Response = Response<Bytes>;
    type Error = RelocateError<H::Error>;

    async fn call(&self, req: Request<Bytes>) -> Result<Self::Response, Self::Error> {
        let (tx, rx) = oneshot::channel();
        let handler = self.handler.clone();
        let job: Job = Box::new(move || {
            async move {
                let out = match AssertUnwindSafe(H::handle(&handler, req)).catch_unwind().await {
                    Ok(Ok(resp)) => Ok(resp),
                    Ok(Err(e)) => Err(RelocateError::Inner(e)),
                    Err(payload) => Err(RelocateError::Panic(panic_message(payload))),
                };
                // the session may have gone away meanwhile
                let _ = tx.send(out);
            }
            .boxed_local()
        });
        self.pool
            .submit(job)
            .map_err(|_| RelocateError::Unavailable)?;
        rx.await.map_err(|_| RelocateError::Canceled)?
    }
}
