//! WebSocket protocol layer (RFC 6455).
//!
//! Everything below the connection state machine lives here: the handshake
//! (upgrade validation and accept-key derivation), the frame codec, and the
//! close-payload helpers. SHA-1 and base64 are implemented inline; the
//! handshake is their only consumer and neither warrants a dependency.
//!
//! # Layering
//!
//! 1. **Handshake** — [`is_upgrade_request`], [`accept_key`]
//! 2. **Frame codec** — [`read_frame`], [`encode_frame`], [`apply_mask`]
//! 3. **Connection** — message assembly and close tracking, in
//!    [`connection`](crate::connection)

use crate::reader::LineReader;
use crate::request::Request;
use asupersync::io::AsyncRead;
use std::io;

// ============================================================================
// SHA-1 (RFC 3174) — handshake-only, not a general-purpose digest
// ============================================================================

const SHA1_K: [u32; 4] = [0x5A82_7999, 0x6ED9_EBA1, 0x8F1B_BCDC, 0xCA62_C1D6];

/// SHA-1 digest of `data` (20 bytes).
#[allow(clippy::many_single_char_names)]
fn sha1(data: &[u8]) -> [u8; 20] {
    let mut state: [u32; 5] = [
        0x6745_2301,
        0xEFCD_AB89,
        0x98BA_DCFE,
        0x1032_5476,
        0xC3D2_E1F0,
    ];

    // Pad to a 64-byte multiple: 0x80, zeros, 64-bit big-endian bit length.
    let mut message = data.to_vec();
    let bit_len = (data.len() as u64) * 8;
    message.push(0x80);
    while message.len() % 64 != 56 {
        message.push(0);
    }
    message.extend_from_slice(&bit_len.to_be_bytes());

    for block in message.chunks_exact(64) {
        sha1_compress(&mut state, block);
    }

    let mut digest = [0u8; 20];
    for (chunk, word) in digest.chunks_exact_mut(4).zip(state) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    digest
}

#[allow(clippy::many_single_char_names)]
fn sha1_compress(state: &mut [u32; 5], block: &[u8]) {
    let mut w = [0u32; 80];
    for (idx, word) in w.iter_mut().take(16).enumerate() {
        let offset = idx * 4;
        *word = u32::from_be_bytes([
            block[offset],
            block[offset + 1],
            block[offset + 2],
            block[offset + 3],
        ]);
    }
    for idx in 16..80 {
        w[idx] = (w[idx - 3] ^ w[idx - 8] ^ w[idx - 14] ^ w[idx - 16]).rotate_left(1);
    }

    let [mut a, mut b, mut c, mut d, mut e] = *state;
    for (idx, &word) in w.iter().enumerate() {
        let (f, k) = match idx / 20 {
            0 => ((b & c) | (!b & d), SHA1_K[0]),
            1 => (b ^ c ^ d, SHA1_K[1]),
            2 => ((b & c) | (b & d) | (c & d), SHA1_K[2]),
            _ => (b ^ c ^ d, SHA1_K[3]),
        };
        let temp = a
            .rotate_left(5)
            .wrapping_add(f)
            .wrapping_add(e)
            .wrapping_add(k)
            .wrapping_add(word);
        e = d;
        d = c;
        c = b.rotate_left(30);
        b = a;
        a = temp;
    }

    state[0] = state[0].wrapping_add(a);
    state[1] = state[1].wrapping_add(b);
    state[2] = state[2].wrapping_add(c);
    state[3] = state[3].wrapping_add(d);
    state[4] = state[4].wrapping_add(e);
}

// ============================================================================
// Base64 encoding — handshake accept key only
// ============================================================================

const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let mut triple = u32::from(chunk[0]) << 16;
        if let Some(&b) = chunk.get(1) {
            triple |= u32::from(b) << 8;
        }
        if let Some(&b) = chunk.get(2) {
            triple |= u32::from(b);
        }

        out.push(BASE64_ALPHABET[(triple >> 18) as usize & 0x3F] as char);
        out.push(BASE64_ALPHABET[(triple >> 12) as usize & 0x3F] as char);
        out.push(if chunk.len() > 1 {
            BASE64_ALPHABET[(triple >> 6) as usize & 0x3F] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            BASE64_ALPHABET[triple as usize & 0x3F] as char
        } else {
            '='
        });
    }
    out
}

// ============================================================================
// Constants
// ============================================================================

/// Handshake GUID (RFC 6455 §4.2.2).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default maximum frame payload size (16 MiB).
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// Default maximum assembled message size (64 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Largest control-frame payload (RFC 6455 §5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

// ============================================================================
// Types
// ============================================================================

/// Frame opcode (RFC 6455 §5.2).
///
/// Reserved opcodes decode without error and carry their nibble; the
/// connection layer treats them as a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Continuation frame (0x0).
    Continuation,
    /// Text frame (0x1).
    Text,
    /// Binary frame (0x2).
    Binary,
    /// Connection close (0x8).
    Close,
    /// Ping (0x9).
    Ping,
    /// Pong (0xA).
    Pong,
    /// Any opcode outside the set above.
    Reserved(u8),
}

impl Opcode {
    /// Decode from the low 4 bits of the first frame byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    #[must_use]
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(value) => value & 0x0F,
        }
    }

    /// Close, ping, and pong frames.
    #[must_use]
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// Close status code (RFC 6455 §7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal,
    /// Endpoint going away (1001).
    GoingAway,
    /// Protocol error (1002).
    ProtocolError,
    /// Unsupported data type (1003).
    UnsupportedData,
    /// No status present (1005). Never sent in a frame.
    NoStatus,
    /// Abnormal closure (1006). Never sent in a frame.
    Abnormal,
    /// Invalid payload data (1007).
    InvalidPayload,
    /// Policy violation (1008).
    PolicyViolation,
    /// Message too big (1009).
    MessageTooBig,
    /// Missing mandatory extension (1010).
    MandatoryExtension,
    /// Internal server error (1011).
    InternalError,
    /// Application-defined code in 3000..=4999.
    Application(u16),
    /// Any other wire value.
    Reserved(u16),
}

impl CloseCode {
    /// Wire representation.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolError => 1002,
            Self::UnsupportedData => 1003,
            Self::NoStatus => 1005,
            Self::Abnormal => 1006,
            Self::InvalidPayload => 1007,
            Self::PolicyViolation => 1008,
            Self::MessageTooBig => 1009,
            Self::MandatoryExtension => 1010,
            Self::InternalError => 1011,
            Self::Application(code) | Self::Reserved(code) => code,
        }
    }

    /// Decode a wire value.
    #[must_use]
    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::ProtocolError,
            1003 => Self::UnsupportedData,
            1005 => Self::NoStatus,
            1006 => Self::Abnormal,
            1007 => Self::InvalidPayload,
            1008 => Self::PolicyViolation,
            1009 => Self::MessageTooBig,
            1010 => Self::MandatoryExtension,
            1011 => Self::InternalError,
            3000..=4999 => Self::Application(code),
            other => Self::Reserved(other),
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_u16())
    }
}

/// Codes that may legitimately appear inside a close frame on the wire.
fn is_sendable_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// FIN bit.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Whether the payload arrived masked.
    pub masked: bool,
    /// Mask key, present iff `masked`.
    pub mask_key: Option<[u8; 4]>,
    /// Payload, already unmasked.
    pub payload: Vec<u8>,
}

/// An assembled incoming message.
///
/// Text payloads stay as raw bytes; UTF-8 validity is the application's
/// call ([`WsMessage::text`] decodes lossily).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// Text message payload.
    Text(Vec<u8>),
    /// Binary message payload.
    Binary(Vec<u8>),
    /// Close, with the peer's status and reason when supplied.
    Close {
        /// Status from the first two payload bytes; `None` on empty payload.
        status: Option<CloseCode>,
        /// UTF-8 reason, empty when absent.
        reason: String,
    },
}

impl WsMessage {
    /// Text payload decoded lossily; `None` for non-text messages.
    #[must_use]
    pub fn text(&self) -> Option<std::borrow::Cow<'_, str>> {
        match self {
            Self::Text(data) => Some(String::from_utf8_lossy(data)),
            _ => None,
        }
    }
}

/// WebSocket error.
#[derive(Debug)]
pub enum WebSocketError {
    /// Underlying stream failure.
    Io(io::Error),
    /// Protocol violation. Answered on the wire with close 1002.
    Protocol(String),
    /// Peer closed the stream, or the connection is past close.
    ConnectionClosed,
    /// Frame or assembled message over the configured limit. Answered with
    /// close 1009.
    TooLarge {
        /// Observed size in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },
    /// The surrounding task was cancelled.
    Cancelled,
}

impl WebSocketError {
    /// Close code this error is answered with before the connection drops.
    #[must_use]
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::Protocol(_) => CloseCode::ProtocolError,
            Self::TooLarge { .. } => CloseCode::MessageTooBig,
            _ => CloseCode::InternalError,
        }
    }
}

impl std::fmt::Display for WebSocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "WebSocket I/O error: {e}"),
            Self::Protocol(msg) => write!(f, "WebSocket protocol error: {msg}"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::TooLarge { size, limit } => {
                write!(f, "WebSocket payload too large: {size} bytes (limit: {limit})")
            }
            Self::Cancelled => write!(f, "WebSocket operation cancelled"),
        }
    }
}

impl std::error::Error for WebSocketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WebSocketError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::ConnectionClosed
        } else {
            Self::Io(e)
        }
    }
}

/// Limits and strictness knobs shared by the codec and the connection.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum single-frame payload.
    pub max_frame_payload: usize,
    /// Maximum assembled message size across continuation frames.
    pub max_message_size: usize,
    /// Reject unmasked client frames with 1002, as RFC 6455 §5.1 demands.
    /// Off by default; unmasked frames are accepted for interoperability.
    pub strict_masking: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            strict_masking: false,
        }
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Derive the `Sec-WebSocket-Accept` value from the client's
/// `Sec-WebSocket-Key` (RFC 6455 §4.2.2 step 4).
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut input = String::with_capacity(client_key.len() + WS_GUID.len());
    input.push_str(client_key.trim());
    input.push_str(WS_GUID);
    base64_encode(&sha1(input.as_bytes()))
}

/// Whether `request` qualifies as a WebSocket upgrade.
///
/// All of the following must hold:
/// - method is `GET`
/// - version is `HTTP/1.1` or higher
/// - `Connection` contains the token `upgrade` (comma-separated list,
///   case-insensitive)
/// - `Upgrade` equals `websocket` (trimmed, case-insensitive)
/// - `Sec-WebSocket-Key` is present and non-empty
/// - `Sec-WebSocket-Version` is exactly `13`
///
/// A request that fails any check is an ordinary HTTP request, not an error.
#[must_use]
pub fn is_upgrade_request(request: &Request) -> bool {
    if request.method() != "GET" || !request.is_at_least_http11() {
        return false;
    }

    let connection_has_upgrade = request
        .headers()
        .get_all("connection")
        .iter()
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !connection_has_upgrade {
        return false;
    }

    match request.headers().get("upgrade") {
        Some(value) if value.trim().eq_ignore_ascii_case("websocket") => {}
        _ => return false,
    }

    match request.headers().get("sec-websocket-key") {
        Some(key) if !key.trim().is_empty() => {}
        _ => return false,
    }

    matches!(
        request.headers().get("sec-websocket-version"),
        Some(version) if version.trim() == "13"
    )
}

// ============================================================================
// Frame codec
// ============================================================================

/// XOR `data` with the 4-byte mask in place. Involutive.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Read one frame through the residue-aware reader.
///
/// The payload is returned unmasked. Fails with `Protocol` on reserved
/// bits, fragmented or oversized control frames, a 64-bit length with the
/// high bit set, and (under `strict_masking`) unmasked frames.
pub async fn read_frame<S: AsyncRead + Unpin>(
    reader: &mut LineReader<S>,
    config: &WebSocketConfig,
) -> Result<Frame, WebSocketError> {
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let fin = header[0] & 0x80 != 0;
    if header[0] & 0x70 != 0 {
        return Err(WebSocketError::Protocol(
            "reserved bits set without a negotiated extension".into(),
        ));
    }
    let opcode = Opcode::from_u8(header[0]);
    let masked = header[1] & 0x80 != 0;
    let len7 = header[1] & 0x7F;

    if !masked && config.strict_masking {
        return Err(WebSocketError::Protocol(
            "client frames must be masked".into(),
        ));
    }

    let payload_len = match len7 {
        0..=125 => usize::from(len7),
        126 => {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext).await?;
            usize::from(u16::from_be_bytes(ext))
        }
        _ => {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).await?;
            let len = u64::from_be_bytes(ext);
            if len & (1 << 63) != 0 {
                return Err(WebSocketError::Protocol(
                    "64-bit payload length with high bit set".into(),
                ));
            }
            usize::try_from(len).map_err(|_| WebSocketError::TooLarge {
                size: usize::MAX,
                limit: config.max_frame_payload,
            })?
        }
    };

    if opcode.is_control() {
        if !fin {
            return Err(WebSocketError::Protocol(
                "control frames must not be fragmented".into(),
            ));
        }
        if payload_len > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::Protocol(
                "control frame payload exceeds 125 bytes".into(),
            ));
        }
    }

    if payload_len > config.max_frame_payload {
        return Err(WebSocketError::TooLarge {
            size: payload_len,
            limit: config.max_frame_payload,
        });
    }

    let mask_key = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await?;
    }
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Ok(Frame {
        fin,
        opcode,
        masked,
        mask_key,
        payload,
    })
}

/// Encode one server frame. Server frames are never masked (RFC 6455 §5.1).
#[must_use]
pub fn encode_frame(fin: bool, opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + payload.len());
    out.push(if fin { 0x80 } else { 0x00 } | opcode.to_u8());

    let len = payload.len();
    if len <= 125 {
        out.push(len as u8);
    } else if len <= usize::from(u16::MAX) {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    out.extend_from_slice(payload);
    out
}

// ============================================================================
// Close payload
// ============================================================================

/// Decode a close frame payload into status and reason.
///
/// Empty payload means no status. A single byte, a code outside the
/// sendable set, or a non-UTF-8 reason is a protocol error.
pub fn parse_close_payload(
    payload: &[u8],
) -> Result<(Option<CloseCode>, String), WebSocketError> {
    if payload.is_empty() {
        return Ok((None, String::new()));
    }
    if payload.len() < 2 {
        return Err(WebSocketError::Protocol(
            "close payload must be empty or at least 2 bytes".into(),
        ));
    }
    let raw = u16::from_be_bytes([payload[0], payload[1]]);
    if !is_sendable_close_code(raw) {
        return Err(WebSocketError::Protocol(format!(
            "invalid close status: {raw}"
        )));
    }
    let reason = std::str::from_utf8(&payload[2..])
        .map_err(|_| WebSocketError::Protocol("close reason must be valid UTF-8".into()))?
        .to_string();
    Ok((Some(CloseCode::from_u16(raw)), reason))
}

/// Build a close frame payload.
///
/// The reason is truncated at a character boundary so the payload stays
/// within the 125-byte control limit. 1005 and 1006 cannot be sent.
pub fn build_close_payload(
    status: CloseCode,
    reason: &str,
) -> Result<Vec<u8>, WebSocketError> {
    let code = status.to_u16();
    if !is_sendable_close_code(code) {
        return Err(WebSocketError::Protocol(format!(
            "close status {code} cannot be sent in a frame"
        )));
    }
    let mut payload = Vec::with_capacity(2 + reason.len().min(MAX_CONTROL_PAYLOAD - 2));
    payload.extend_from_slice(&code.to_be_bytes());

    let max_reason = MAX_CONTROL_PAYLOAD - 2;
    let mut end = reason.len().min(max_reason);
    while end > 0 && !reason.is_char_boundary(end) {
        end -= 1;
    }
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    Ok(payload)
}

// ============================================================================
// Tests
// ============================================================================
