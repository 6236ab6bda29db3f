//! Demo handler: echoes request targets and bodies back to the client.
use std::convert::Infallible;

use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use service_async::Service;

/// `GET` answers `{"hello": "<target>"}`, `POST` echoes an ASCII body,
/// optionally transformed by the target path.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoService;

impl Service<Request<Bytes>> for EchoService {
    type Response = Response<Bytes>;
    type Error = Infallible;

    async fn call(&self, req: Request<Bytes>) -> Result<Self::Response, Self::Error> {
        Ok(match *req.method() {
            Method::GET => get(&req),
            Method::POST => post(&req),
            _ => status(StatusCode::METHOD_NOT_ALLOWED),
        })
    }
}

fn target(req: &Request<Bytes>) -> &str {
    req.uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
}

fn get(req: &Request<Bytes>) -> Response<Bytes> {
    let target = target(req);
    if target == "/not_found" {
        return status(StatusCode::NOT_FOUND);
    }
    let body = serde_json::json!({ "hello": target }).to_string();
    with_type(Response::new(Bytes::from(body)), "application/json")
}

fn post(req: &Request<Bytes>) -> Response<Bytes> {
    let body = req.body();
    // the transformations are byte-wise
    if !body.is_ascii() {
        return status(StatusCode::BAD_REQUEST);
    }
    let echoed = match target(req) {
        "/reverse" => {
            let mut reversed = body.to_vec();
            reversed.reverse();
            Bytes::from(reversed)
        }
        "/uppercase" => Bytes::from(body.to_ascii_uppercase()),
        "/lowercase" => Bytes::from(body.to_ascii_lowercase()),
        "/yell" => {
            let mut yelled = body.to_vec();
            yelled.extend_from_slice(b"!!");
            Bytes::from(yelled)
        }
        _ => body.clone(),
    };
    with_type(Response::new(echoed), "text/plain")
}

fn status(code: StatusCode) -> Response<Bytes> {
    let mut resp = Response::new(Bytes::new());
    *resp.status_mut() = code;
    resp
}

fn with_type(mut resp: Response<Bytes>, content_type: &'static str) -> Response<Bytes> {
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn echo(method: Method, target: &str, body: &'static [u8]) -> Response<Bytes> {
        let req = Request::builder()
            .method(method)
            .uri(target)
            .body(Bytes::from_static(body))
            .unwrap();
        EchoService.call(req).await.unwrap()
    }

    #[monoio::test]
    async fn test_get_hello() {
        let resp = echo(Method::GET, "/world?x=1", b"").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/json");
        let value: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(value["hello"], "/world?x=1");

        let resp = echo(Method::GET, "/not_found", b"").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.body().is_empty());
    }

    #[monoio::test]
    async fn test_post_transforms() {
        for (target, expected) in [
            ("/", "Hello World"),
            ("/reverse", "dlroW olleH"),
            ("/uppercase", "HELLO WORLD"),
            ("/lowercase", "hello world"),
            ("/yell", "Hello World!!"),
        ] {
            let resp = echo(Method::POST, target, b"Hello World").await;
            assert_eq!(resp.status(), StatusCode::OK, "{target}");
            assert_eq!(resp.body(), expected, "{target}");
            assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/plain");
        }
    }

    #[monoio::test]
    async fn test_rejects_non_ascii_and_other_methods() {
        let resp = echo(Method::POST, "/reverse", "héllo".as_bytes()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = echo(Method::DELETE, "/", b"").await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
