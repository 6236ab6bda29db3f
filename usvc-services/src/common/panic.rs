use std::{any::Any, fmt::Debug, panic::AssertUnwindSafe};

use futures::FutureExt;
use service_async::Service;

/// Turns a panic raised while serving into a [`CatchPanicError::Panic`].
///
/// The inner service must be unwind safe: state it shares across calls has
/// to stay consistent when a call unwinds halfway.
#[derive(Clone)]
pub struct CatchPanicService<S> {
    inner: S,
}

#[derive(thiserror::Error, Debug)]
pub enum CatchPanicError<E> {
    #[error("inner error: {0:?}")]
    Inner(E),
    // String rather than the payload box so the error stays Send + Sync
    #[error("inner panic: {0}")]
    Panic(String),
}

impl<S> CatchPanicService<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<R, S> Service<R> for CatchPanicService<S>
where
    S: Service<R>,
{
    type Response = S::Response;
    type Error = CatchPanicError<S::Error>;

    async fn call(&self, req: R) -> Result<Self::Response, Self::Error> {
        match AssertUnwindSafe(self.inner.call(req)).catch_unwind().await {
            Ok(Ok(r)) => Ok(r),
            Ok(Err(e)) => Err(CatchPanicError::Inner(e)),
            Err(payload) => Err(CatchPanicError::Panic(panic_message(payload))),
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(payload) => match payload.downcast_ref::<&'static str>() {
            Some(msg) => (*msg).to_string(),
            None => "non-string panic payload".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    impl Service<i32> for Doubler {
        type Response = i32;
        type Error = &'static str;

        async fn call(&self, req: i32) -> Result<i32, &'static str> {
            match req {
                0 => Err("zero"),
                r if r < 0 => panic!("negative input {r}"),
                r => Ok(r * 2),
            }
        }
    }

    #[monoio::test]
    async fn test_catch_panic() {
        let svc = CatchPanicService::new(Doubler);
        assert_eq!(svc.call(2).await.unwrap(), 4);
        assert!(matches!(svc.call(0).await, Err(CatchPanicError::Inner("zero"))));
        match svc.call(-1).await {
            Err(CatchPanicError::Panic(msg)) => assert_eq!(msg, "negative input -1"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        // the service stays usable after a panic
        assert_eq!(svc.call(3).await.unwrap(), 6);
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(1u8)), "non-string panic payload");
    }
}
