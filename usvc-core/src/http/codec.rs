//! HTTP/1.1 message reading and writing over rent-based monoio streams.
//!
//! [`RequestReader`] owns a reusable buffer and yields one request at a time
//! together with the number of bytes the message occupied on the wire.
//! Bytes past the end of a message stay buffered for the next call.
//! [`write_response`] serializes a response and writes it in one go.
use std::io;

use bytes::{Buf, Bytes, BytesMut};
use http::{Request, Response, StatusCode, Version};
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt};
use thiserror::Error;

const MAX_HEADERS: usize = 64;
// Read chunk size: 8 KB
const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed request: {0}")]
    Parse(#[from] httparse::Error),
    #[error("invalid message framing: {0}")]
    Framing(&'static str),
    #[error("invalid request: {0}")]
    Http(#[from] http::Error),
    #[error("request exceeds the {limit} bytes limit")]
    TooLarge { limit: usize },
    #[error("connection closed with {0} bytes of an incomplete request")]
    UnexpectedEof(usize),
}

enum BodyKind {
    Length(usize),
    Chunked,
}

/// Chunked body decoded so far. `pos` is the offset past the head of the
/// first chunk not yet decoded.
#[derive(Default)]
struct ChunkedProgress {
    pos: usize,
    body: BytesMut,
}

pub struct RequestReader {
    buf: BytesMut,
    chunk: Option<Vec<u8>>,
    chunked: ChunkedProgress,
    limit: usize,
}

impl RequestReader {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            chunk: None,
            chunked: ChunkedProgress::default(),
            limit,
        }
    }

    /// Read the next request.
    ///
    /// Returns `Ok(None)` when the peer closed the connection between
    /// messages, and the request with its wire size otherwise.
    pub async fn read<S: AsyncReadRent>(
        &mut self,
        stream: &mut S,
    ) -> Result<Option<(Request<Bytes>, usize)>, ReadError> {
        loop {
            if !self.buf.is_empty() {
                if let Some(parsed) = self.try_parse()? {
                    return Ok(Some(parsed));
                }
                if self.buf.len() >= self.limit {
                    return Err(ReadError::TooLarge { limit: self.limit });
                }
            }
            if self.fill(stream).await? == 0 {
                return match self.buf.len() {
                    0 => Ok(None),
                    pending => Err(ReadError::UnexpectedEof(pending)),
                };
            }
        }
    }

    async fn fill<S: AsyncReadRent>(&mut self, stream: &mut S) -> io::Result<usize> {
        let mut chunk = self
            .chunk
            .take()
            .unwrap_or_else(|| Vec::with_capacity(READ_CHUNK_SIZE));
        chunk.clear();
        let (res, chunk) = stream.read(chunk).await;
        if let Ok(n) = res {
            self.buf.extend_from_slice(&chunk[..n]);
        }
        self.chunk = Some(chunk);
        res
    }

    fn try_parse(&mut self) -> Result<Option<(Request<Bytes>, usize)>, ReadError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let head_len = match req.parse(&self.buf)? {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => return Ok(None),
        };

        let version = match req.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let mut builder = Request::builder()
            .method(req.method.unwrap_or_default())
            .uri(req.path.unwrap_or_default())
            .version(version);
        for header in req.headers.iter() {
            builder = builder.header(header.name, header.value);
        }
        let body_kind = body_kind(req.headers)?;

        let (body, consumed) = match body_kind {
            BodyKind::Length(len) => {
                let total = head_len.checked_add(len).unwrap_or(usize::MAX);
                if total > self.limit {
                    return Err(ReadError::TooLarge { limit: self.limit });
                }
                if self.buf.len() < total {
                    return Ok(None);
                }
                let mut message = self.buf.split_to(total);
                (message.split_off(head_len).freeze(), total)
            }
            BodyKind::Chunked => {
                let complete = decode_chunked(&self.buf[head_len..], &mut self.chunked)?;
                let total = head_len + self.chunked.pos;
                if total > self.limit {
                    return Err(ReadError::TooLarge { limit: self.limit });
                }
                if !complete {
                    return Ok(None);
                }
                self.buf.advance(total);
                (std::mem::take(&mut self.chunked).body.freeze(), total)
            }
        };

        Ok(Some((builder.body(body)?, consumed)))
    }
}

fn body_kind(headers: &[httparse::Header<'_>]) -> Result<BodyKind, ReadError> {
    let mut length: Option<usize> = None;
    let mut chunked = false;
    for header in headers {
        if header.name.eq_ignore_ascii_case("content-length") {
            let len = parse_content_length(header.value)
                .ok_or(ReadError::Framing("invalid content-length"))?;
            if length.is_some_and(|prev| prev != len) {
                return Err(ReadError::Framing("conflicting content-length"));
            }
            length = Some(len);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            // chunked must be the final coding
            chunked = header
                .value
                .rsplit(|&b| b == b',')
                .next()
                .is_some_and(|coding| coding.trim_ascii().eq_ignore_ascii_case(b"chunked"));
            if !chunked {
                return Err(ReadError::Framing("unsupported transfer-encoding"));
            }
        }
    }
    match (chunked, length) {
        (true, Some(_)) => Err(ReadError::Framing(
            "both content-length and transfer-encoding",
        )),
        (true, None) => Ok(BodyKind::Chunked),
        (false, len) => Ok(BodyKind::Length(len.unwrap_or(0))),
    }
}

/// `Content-Length = 1*DIGIT`. Signs and inner whitespace are rejected.
fn parse_content_length(value: &[u8]) -> Option<usize> {
    let value = value.trim_ascii();
    if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(value).ok()?.parse().ok()
}

/// Continue decoding the chunked body in `buf`, which starts right after the
/// head. Whole chunks move into `progress`, so every byte is decoded once.
/// Returns `true` once the last chunk and the trailers are in, with
/// `progress.pos` covering the whole framed body.
fn decode_chunked(buf: &[u8], progress: &mut ChunkedProgress) -> Result<bool, ReadError> {
    loop {
        let pos = progress.pos;
        let (size_len, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(httparse::Status::Complete(parsed)) => parsed,
            Ok(httparse::Status::Partial) => return Ok(false),
            Err(_) => return Err(ReadError::Framing("invalid chunk size")),
        };
        let data = pos + size_len;

        if size == 0 {
            let mut trailers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            return match httparse::parse_headers(&buf[data..], &mut trailers)? {
                httparse::Status::Complete((trailer_len, _)) => {
                    progress.pos = data + trailer_len;
                    Ok(true)
                }
                httparse::Status::Partial => Ok(false),
            };
        }

        let end = usize::try_from(size)
            .ok()
            .and_then(|size| data.checked_add(size))
            .ok_or(ReadError::Framing("chunk size overflow"))?;
        if buf.len().saturating_sub(end) < 2 {
            return Ok(false);
        }
        if &buf[end..end + 2] != b"\r\n" {
            return Err(ReadError::Framing("missing chunk terminator"));
        }
        progress.body.extend_from_slice(&buf[data..end]);
        progress.pos = end + 2;
    }
}

/// Whether a response with this status may carry a body.
#[inline]
pub fn body_allowed(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Serialize a response exactly as [`write_response`] puts it on the wire.
pub fn encode_response(response: &Response<Bytes>) -> Vec<u8> {
    let version = match response.version() {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let status = response.status();
    let body = response.body();

    let mut out = Vec::with_capacity(128 + body.len());
    out.extend_from_slice(version.as_bytes());
    out.push(b' ');
    out.extend_from_slice(status.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in response.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    if body_allowed(status) {
        out.extend_from_slice(body);
    }
    out
}

/// Write one response. Returns the number of bytes written.
pub async fn write_response<S: AsyncWriteRent>(
    stream: &mut S,
    response: &Response<Bytes>,
) -> io::Result<usize> {
    let (res, _) = stream.write_all(encode_response(response)).await;
    let written = res?;
    stream.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use http::{header, HeaderValue, Method};

    use super::*;
    use crate::testing::MockStream;

    #[monoio::test]
    async fn test_read_get() {
        const RAW: &[u8] = b"GET /health?x=1 HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let mut stream = MockStream::new(3).with_read(RAW);
        let mut reader = RequestReader::new(1024);

        let (req, consumed) = reader.read(&mut stream).await.unwrap().unwrap();
        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.uri().path(), "/health");
        assert_eq!(req.version(), Version::HTTP_11);
        assert_eq!(req.headers()[header::HOST], "localhost");
        assert!(req.body().is_empty());
        assert_eq!(consumed, RAW.len());

        assert!(reader.read(&mut stream).await.unwrap().is_none());
    }

    #[monoio::test]
    async fn test_read_body_across_reads() {
        const RAW: &[u8] = b"POST /echo HTTP/1.0\r\nContent-Length: 11\r\n\r\nhello world";
        let mut stream = MockStream::new(3).with_read_chunk_size(5).with_read(RAW);
        let mut reader = RequestReader::new(1024);

        let (req, consumed) = reader.read(&mut stream).await.unwrap().unwrap();
        assert_eq!(req.version(), Version::HTTP_10);
        assert_eq!(req.body(), "hello world");
        assert_eq!(consumed, RAW.len());
    }

    #[monoio::test]
    async fn test_read_pipelined_requests() {
        let mut stream =
            MockStream::new(3).with_read(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        let mut reader = RequestReader::new(1024);

        let (first, _) = reader.read(&mut stream).await.unwrap().unwrap();
        let (second, consumed) = reader.read(&mut stream).await.unwrap().unwrap();
        assert_eq!(first.uri(), "/a");
        assert_eq!(second.uri(), "/b");
        assert_eq!(consumed, 19);
    }

    #[monoio::test]
    async fn test_read_chunked() {
        const RAW: &[u8] = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
            5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let mut stream = MockStream::new(3).with_read_chunk_size(7).with_read(RAW);
        let mut reader = RequestReader::new(1024);

        let (req, consumed) = reader.read(&mut stream).await.unwrap().unwrap();
        assert_eq!(req.body(), "hello world");
        assert_eq!(consumed, RAW.len());
    }

    #[monoio::test]
    async fn test_read_malformed() {
        let mut stream = MockStream::new(3).with_read(b"GET / xxx HTTP/1.0\r\n\r\n");
        let mut reader = RequestReader::new(1024);
        assert!(matches!(
            reader.read(&mut stream).await,
            Err(ReadError::Parse(_))
        ));
    }

    #[monoio::test]
    async fn test_read_declared_body_too_large() {
        let mut stream =
            MockStream::new(3).with_read(b"POST / HTTP/1.1\r\nContent-Length: 2000\r\n\r\n");
        let mut reader = RequestReader::new(1024);
        assert!(matches!(
            reader.read(&mut stream).await,
            Err(ReadError::TooLarge { limit: 1024 })
        ));
    }

    #[monoio::test]
    async fn test_read_unterminated_head_too_large() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        raw.resize(4096, b'a');
        let mut stream = MockStream::new(3).with_read(raw);
        let mut reader = RequestReader::new(1024);
        assert!(matches!(
            reader.read(&mut stream).await,
            Err(ReadError::TooLarge { .. })
        ));
    }

    #[monoio::test]
    async fn test_read_eof_mid_request() {
        let mut stream = MockStream::new(3).with_read(b"GET / HTTP/1.1\r\nHost");
        let mut reader = RequestReader::new(1024);
        assert!(matches!(
            reader.read(&mut stream).await,
            Err(ReadError::UnexpectedEof(20))
        ));
    }

    #[monoio::test]
    async fn test_read_conflicting_framing() {
        let mut stream = MockStream::new(3).with_read(
            b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        let mut reader = RequestReader::new(1024);
        assert!(matches!(
            reader.read(&mut stream).await,
            Err(ReadError::Framing(_))
        ));
    }

    #[monoio::test]
    async fn test_read_signed_content_length() {
        for raw in [
            &b"POST / HTTP/1.1\r\nContent-Length: +5\r\nContent-Length: 5\r\n\r\nhello"[..],
            b"POST / HTTP/1.1\r\nContent-Length: -0\r\n\r\n",
            b"POST / HTTP/1.1\r\nContent-Length: 1 2\r\n\r\n",
            b"POST / HTTP/1.1\r\nContent-Length: \r\n\r\n",
        ] {
            let mut stream = MockStream::new(3).with_read(raw);
            let mut reader = RequestReader::new(1024);
            assert!(matches!(
                reader.read(&mut stream).await,
                Err(ReadError::Framing("invalid content-length"))
            ));
        }
    }

    #[monoio::test]
    async fn test_read_chunked_body_too_large() {
        let mut raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        for _ in 0..16 {
            raw.extend_from_slice(b"10\r\n0123456789abcdef\r\n");
        }
        // still growing when the limit is hit
        let mut stream = MockStream::new(3).with_read_chunk_size(9).with_read(&raw);
        let mut reader = RequestReader::new(256);
        assert!(matches!(
            reader.read(&mut stream).await,
            Err(ReadError::TooLarge { limit: 256 })
        ));

        // complete in a single read but over the limit
        raw.extend_from_slice(b"0\r\n\r\n");
        let mut stream = MockStream::new(3).with_read(&raw);
        let mut reader = RequestReader::new(256);
        assert!(matches!(
            reader.read(&mut stream).await,
            Err(ReadError::TooLarge { limit: 256 })
        ));
    }

    #[monoio::test]
    async fn test_read_chunked_then_pipelined() {
        const RAW: &[u8] = b"POST /a HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
            3\r\nabc\r\n0\r\n\r\nPOST /b HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
            2\r\nxy\r\n0\r\n\r\n";
        let mut stream = MockStream::new(3).with_read_chunk_size(4).with_read(RAW);
        let mut reader = RequestReader::new(1024);

        let (first, first_len) = reader.read(&mut stream).await.unwrap().unwrap();
        let (second, second_len) = reader.read(&mut stream).await.unwrap().unwrap();
        assert_eq!(first.body(), "abc");
        assert_eq!(second.body(), "xy");
        assert_eq!(first_len + second_len, RAW.len());
    }

    #[monoio::test]
    async fn test_write_response() {
        let mut response = Response::new(Bytes::from_static(b"{}"));
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(2usize));
        let mut stream = MockStream::new(3);
        let written = stream.written();

        let n = write_response(&mut stream, &response).await.unwrap();
        let expected = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\n{}";
        assert_eq!(n, expected.len());
        assert_eq!(written.bytes(), expected);
    }

    #[test]
    fn test_encode_skips_body_for_no_content() {
        let mut response = Response::new(Bytes::from_static(b"ignored"));
        *response.status_mut() = StatusCode::NO_CONTENT;
        *response.version_mut() = Version::HTTP_10;
        assert_eq!(encode_response(&response), b"HTTP/1.0 204 No Content\r\n\r\n");
    }
}
