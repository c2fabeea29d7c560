//! HTTP/1.x request parser.
//!
//! Reads exactly one request off a [`LineReader`]. Parsing is deliberately
//! lenient: the request line is split at its first and last space so extra
//! internal whitespace in the target survives, and the method is any token,
//! uppercased. `Content-Length` is the only supported body framing.

use crate::reader::LineReader;
use crate::request::{Headers, QueryMap, Request};
use asupersync::io::AsyncRead;
use std::borrow::Cow;
use std::io;

/// HTTP parsing error.
#[derive(Debug)]
pub enum ParseError {
    /// Malformed request line (empty, or fewer than two spaces).
    InvalidRequestLine,
    /// Header line without a colon, or an empty header name.
    InvalidHeader,
    /// Content-Length missing an integer value or supplied more than once.
    InvalidContentLength,
    /// Transfer-Encoding declared; chunked bodies are not supported.
    UnsupportedTransferEncoding,
    /// Declared body length exceeds the configured maximum.
    BodyTooLarge { declared: usize, limit: usize },
    /// Peer closed the stream before a full request arrived.
    UnexpectedEof,
    /// Underlying stream failure.
    Io(io::Error),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid Content-Length"),
            Self::UnsupportedTransferEncoding => write!(f, "unsupported Transfer-Encoding"),
            Self::BodyTooLarge { declared, limit } => {
                write!(f, "request body too large: {declared} bytes (limit: {limit})")
            }
            Self::UnexpectedEof => write!(f, "connection closed before request completed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ParseError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::UnexpectedEof
        } else {
            Self::Io(e)
        }
    }
}

impl ParseError {
    /// HTTP status code the worker answers this error with.
    ///
    /// `UnexpectedEof` and `Io` have no peer left to answer; they map to 400
    /// only as a fallback.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BodyTooLarge { .. } => 413,
            _ => 400,
        }
    }
}

/// Read and parse one request.
///
/// `max_body_bytes` bounds the `Content-Length` a client may declare.
/// Residue buffered past the end of the request (for instance WebSocket
/// frames sent together with the upgrade) stays in the reader.
pub async fn parse_request<S: AsyncRead + Unpin>(
    reader: &mut LineReader<S>,
    max_body_bytes: usize,
) -> Result<Request, ParseError> {
    let line = reader
        .read_line(true)
        .await?
        .ok_or(ParseError::UnexpectedEof)?;

    let (method, target, version) = split_request_line(&line)?;

    let mut headers = Headers::new();
    loop {
        let line = reader
            .read_line(true)
            .await?
            .ok_or(ParseError::UnexpectedEof)?;
        if line.is_empty() {
            break;
        }
        let colon = line.find(':').ok_or(ParseError::InvalidHeader)?;
        let name = line[..colon].trim();
        if name.is_empty() {
            return Err(ParseError::InvalidHeader);
        }
        headers.append(name, line[colon + 1..].trim());
    }

    let body = read_body(reader, &headers, max_body_bytes).await?;

    let (path, raw_query, query) = split_target(target);

    Ok(Request::new(
        method.to_ascii_uppercase(),
        path,
        raw_query,
        query,
        version.to_string(),
        headers,
        body,
    ))
}

/// Split at the first and last space. Both must exist and differ, which
/// tolerates spaces inside the target but rejects empty and one-word lines.
fn split_request_line(line: &str) -> Result<(&str, &str, &str), ParseError> {
    let first = line.find(' ').ok_or(ParseError::InvalidRequestLine)?;
    let last = line.rfind(' ').ok_or(ParseError::InvalidRequestLine)?;
    if first == last {
        return Err(ParseError::InvalidRequestLine);
    }
    let method = &line[..first];
    let target = &line[first + 1..last];
    let version = &line[last + 1..];
    if method.is_empty() || version.is_empty() {
        return Err(ParseError::InvalidRequestLine);
    }
    Ok((method, target, version))
}

async fn read_body<S: AsyncRead + Unpin>(
    reader: &mut LineReader<S>,
    headers: &Headers,
    max_body_bytes: usize,
) -> Result<Vec<u8>, ParseError> {
    if headers.contains("transfer-encoding") {
        return Err(ParseError::UnsupportedTransferEncoding);
    }

    let values = headers.get_all("content-length");
    let declared = match values {
        [] => return Ok(Vec::new()),
        [one] => one
            .trim()
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidContentLength)?,
        _ => return Err(ParseError::InvalidContentLength),
    };

    if declared > max_body_bytes {
        return Err(ParseError::BodyTooLarge {
            declared,
            limit: max_body_bytes,
        });
    }
    if declared == 0 {
        return Ok(Vec::new());
    }

    let mut body = Vec::with_capacity(declared);
    while body.len() < declared {
        let chunk = reader.read_remaining().await?;
        if chunk.is_empty() {
            return Err(ParseError::UnexpectedEof);
        }
        body.extend_from_slice(&chunk);
    }
    body.truncate(declared);
    Ok(body)
}

fn split_target(target: &str) -> (String, Option<String>, QueryMap) {
    match target.find('?') {
        Some(pos) => {
            let raw_query = &target[pos + 1..];
            (
                percent_decode(&target[..pos]).into_owned(),
                Some(raw_query.to_string()),
                parse_query(raw_query),
            )
        }
        None => (percent_decode(target).into_owned(), None, QueryMap::new()),
    }
}

fn parse_query(raw: &str) -> QueryMap {
    let mut query = QueryMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.find('=') {
            Some(pos) => (&pair[..pos], &pair[pos + 1..]),
            None => (pair, ""),
        };
        query.push(
            percent_decode(key).into_owned(),
            percent_decode(value).into_owned(),
        );
    }
    query
}

/// Percent-decode a path or query component.
///
/// Invalid percent sequences are left as-is. Plus signs are preserved (no
/// space decoding).
fn percent_decode(s: &str) -> Cow<'_, str> {
    if !s.contains('%') {
        return Cow::Borrowed(s);
    }

    let mut result = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let (Some(hi), Some(lo)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                    result.push(hi << 4 | lo);
                    i += 3;
                } else {
                    result.push(b'%');
                    i += 1;
                }
            }
            b => {
                result.push(b);
                i += 1;
            }
        }
    }

    Cow::Owned(String::from_utf8_lossy(&result).into_owned())
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
