//! HTTP response types and serializer.
//!
//! Responses are written once per connection. The HTTP phase always answers
//! with an `HTTP/1.0` status line and `Connection: close`; the only
//! `HTTP/1.1` response this server emits is `101 Switching Protocols`.

use std::time::SystemTime;

/// `Server` header value.
pub const SERVER_BANNER: &str = concat!("wharf/", env!("CARGO_PKG_VERSION"));

/// An HTTP response produced by a handler.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    reason: String,
    content_type: String,
    extra_headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    /// Create a response with the canonical reason phrase for `status`.
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: canonical_reason(status).to_string(),
            content_type: "text/html".to_string(),
            extra_headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// 200 response with a `text/plain` body.
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self::new(200)
            .with_content_type("text/plain")
            .with_body(body.into().into_bytes())
    }

    /// 200 response with a `text/html` body.
    #[must_use]
    pub fn html(body: impl Into<String>) -> Self {
        Self::new(200).with_body(body.into().into_bytes())
    }

    /// 404 response with a short text body.
    #[must_use]
    pub fn not_found() -> Self {
        Self::new(404)
            .with_content_type("text/plain")
            .with_body(b"Not Found".to_vec())
    }

    /// 400 response carrying `message` as a text body.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400)
            .with_content_type("text/plain")
            .with_body(message.into().into_bytes())
    }

    /// 500 response carrying `message` as a text body.
    #[must_use]
    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(500)
            .with_content_type("text/plain")
            .with_body(message.into().into_bytes())
    }

    /// Replace the reason phrase.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Replace the content type (without charset suffix).
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Append an extra header. Insertion order is preserved on the wire.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Reason phrase.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Body bytes.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Reason phrase for the status codes this server emits itself; handlers may
/// override via [`Response::with_reason`].
fn canonical_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Serializes responses into a reusable buffer.
pub struct ResponseWriter {
    buffer: Vec<u8>,
}

impl ResponseWriter {
    /// Create a writer with a pre-allocated buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
        }
    }

    /// Serialize `response`. With `head` set the body bytes are suppressed
    /// while `Content-Length` still reflects them.
    pub fn write(&mut self, response: &Response, head: bool) -> &[u8] {
        self.buffer.clear();
        self.buffer.extend_from_slice(b"HTTP/1.0 ");
        self.buffer
            .extend_from_slice(response.status.to_string().as_bytes());
        self.buffer.push(b' ');
        self.buffer.extend_from_slice(response.reason.as_bytes());
        self.buffer.extend_from_slice(b"\r\n");

        self.header("Server", SERVER_BANNER);
        let content_type = if response.content_type.contains("charset") {
            response.content_type.clone()
        } else {
            format!("{}; charset=UTF-8", response.content_type)
        };
        self.header("Content-Type", &content_type);
        self.header("Content-Length", &response.body.len().to_string());
        self.header("Date", &httpdate::fmt_http_date(SystemTime::now()));
        self.header("Connection", "close");
        for (name, value) in &response.extra_headers {
            self.header(name, value);
        }
        self.buffer.extend_from_slice(b"\r\n");

        if !head {
            self.buffer.extend_from_slice(&response.body);
        }
        &self.buffer
    }

    /// Serialize the `101 Switching Protocols` upgrade response.
    pub fn write_switching_protocols(&mut self, accept_key: &str) -> &[u8] {
        self.buffer.clear();
        self.buffer
            .extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
        self.header("Server", SERVER_BANNER);
        self.header("Date", &httpdate::fmt_http_date(SystemTime::now()));
        self.header("Upgrade", "websocket");
        self.header("Connection", "Upgrade");
        self.header("Sec-WebSocket-Accept", accept_key);
        self.buffer.extend_from_slice(b"\r\n");
        &self.buffer
    }

    fn header(&mut self, name: &str, value: &str) {
        self.buffer.extend_from_slice(name.as_bytes());
        self.buffer.extend_from_slice(b": ");
        self.buffer.extend_from_slice(value.as_bytes());
        self.buffer.extend_from_slice(b"\r\n");
    }
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self::new()
    }
}
