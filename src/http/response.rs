//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses and
//! serializing them for transmission over TCP. A response body is either fully
//! buffered or streamed chunk-by-chunk from a channel; the latter backs the
//! `text/event-stream` replies the chat page listens to.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::mpsc;

use super::{Headers, StatusCode};

/// Response payload.
#[derive(Debug)]
pub enum Body {
    /// Buffered body written with `Content-Length`.
    Full(Vec<u8>),
    /// Body produced incrementally and written with `Transfer-Encoding: chunked`.
    /// The stream ends when every sender is dropped.
    Stream(mpsc::Receiver<Bytes>),
}

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use cotbot::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"pending":false}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 17\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Full(Vec::new()),
            keep_alive: true,
        }
    }

    /// Serializes `value` as the JSON body of a response with `status`.
    ///
    /// Falls back to a bare `500` if serialization fails.
    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(status)
                .header("Content-Type", "application/json")
                .body_bytes(body),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize JSON response body");
                Self::new(StatusCode::InternalServerError)
            }
        }
    }

    /// A `200 OK` HTML page.
    pub fn html(body: impl Into<String>) -> Self {
        Self::new(StatusCode::Ok)
            .header("Content-Type", "text/html; charset=utf-8")
            .body(body)
    }

    /// A streamed response whose chunks arrive on `chunks`.
    ///
    /// Streamed responses always close the connection once the stream ends.
    pub fn stream(status: StatusCode, content_type: &str, chunks: mpsc::Receiver<Bytes>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Stream(chunks),
            keep_alive: false,
        }
        .header("Content-Type", content_type)
        .header("Cache-Control", "no-cache")
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for middleware that receives a
    /// `Response` from downstream and needs to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Full(body.into().into_bytes());
        self
    }

    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header
    /// is written. Ignored for streamed bodies, which always close.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive && matches!(self.body, Body::Full(_));
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the buffered body, or `None` for a streamed response.
    pub fn full_body(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Full(bytes) => Some(bytes),
            Body::Stream(_) => None,
        }
    }

    /// Returns `true` when the connection must be closed after this response.
    pub fn closes_connection(&self) -> bool {
        !self.keep_alive
    }

    /// Consumes the response, returning the streamed body receiver if there is one.
    pub fn into_stream(self) -> Option<mpsc::Receiver<Bytes>> {
        match self.body {
            Body::Stream(rx) => Some(rx),
            Body::Full(_) => None,
        }
    }

    /// Splits the response into its serialized head (plus the body, when buffered)
    /// and the chunk receiver of a streamed body.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if a buffered body is non-empty
    ///   and no `Content-Type` header was set.
    /// - `Content-Length: <n>` for buffered bodies, `Transfer-Encoding: chunked`
    ///   for streamed ones.
    /// - `Connection: keep-alive` or `Connection: close`.
    pub fn into_parts(mut self) -> (BytesMut, Option<mpsc::Receiver<Bytes>>) {
        let (framing, payload, stream) = match self.body {
            Body::Full(body) => {
                if !body.is_empty() && !self.headers.contains("content-type") {
                    self.headers
                        .insert("Content-Type", "text/plain; charset=utf-8");
                }
                (format!("Content-Length: {}", body.len()), body, None)
            }
            Body::Stream(rx) => ("Transfer-Encoding: chunked".to_owned(), Vec::new(), Some(rx)),
        };

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.insert("Connection", connection);

        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64 + payload.len());
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }
        // Framing header is always the last one before the blank line
        buf.put(framing.as_bytes());
        buf.put(&b"\r\n\r\n"[..]);
        buf.put(payload.as_slice());

        (buf, stream)
    }

    /// Serializes the response head and buffered body.
    ///
    /// A streamed body is not included; use [`into_parts`](Self::into_parts) to
    /// obtain its receiver.
    pub fn into_bytes(self) -> BytesMut {
        self.into_parts().0
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

/// Frames one chunk of a `Transfer-Encoding: chunked` body.
///
/// Empty input yields an empty buffer, since a zero-length chunk would end the body.
pub fn encode_chunk(data: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(data.len() + 12);
    if data.is_empty() {
        return buf;
    }
    buf.put(format!("{:x}\r\n", data.len()).as_bytes());
    buf.put(data);
    buf.put(&b"\r\n"[..]);
    buf
}

/// Terminating chunk of a chunked body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";
