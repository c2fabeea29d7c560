//! Embeddable HTTP/1.x server with an RFC 6455 WebSocket core.
//!
//! This crate parses one HTTP request off a raw byte stream, decides whether
//! it qualifies as a WebSocket upgrade, performs the handshake, and then
//! owns the connection as a bidirectional message stream with text, binary,
//! and control frames, fragmentation, and graceful shutdown. Plain requests
//! go to an HTTP handler and are answered with a single `Connection: close`
//! response.
//!
//! Built on the `asupersync` runtime; one task per connection.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use wharf::{
//!     http_handler, ws_handler, Response, Server, ServerConfig, WsMessage, WsSelector,
//! };
//!
//! let http = http_handler(|req| async move {
//!     Ok(Response::text(format!("hello from {}", req.path())))
//! });
//!
//! let echo = ws_handler(|_req, conn| async move {
//!     while let Ok(message) = conn.receive_message().await {
//!         match message {
//!             WsMessage::Text(data) => {
//!                 let _ = conn.send_text(&String::from_utf8_lossy(&data)).await;
//!             }
//!             WsMessage::Binary(data) => {
//!                 let _ = conn.send_binary(&data).await;
//!             }
//!             WsMessage::Close { .. } => break,
//!         }
//!     }
//! });
//! let selector: WsSelector =
//!     Arc::new(move |path| (path == "/ws").then(|| Arc::clone(&echo)));
//!
//! let server = Server::bind(ServerConfig::new(8080), http, Some(selector)).await?;
//! let handle = server.handle();
//! server.run(&cx, &runtime_handle).await?;
//! ```

#![deny(unsafe_code)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod connection;
pub mod parser;
pub mod reader;
pub mod request;
pub mod response;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use connection::WebSocketConnection;
pub use parser::ParseError;
pub use reader::LineReader;
pub use request::{Headers, QueryMap, Request};
pub use response::{Response, ResponseWriter, SERVER_BANNER};
pub use server::{
    http_handler, ws_handler, BoxError, HttpHandler, Server, ServerConfig, ServerHandle,
    WsHandler, WsSelector, DEFAULT_HTTP_READ_TIMEOUT, DEFAULT_MAX_REQUEST_BODY,
};
pub use shutdown::ShutdownSignal;
pub use websocket::{
    accept_key, apply_mask, is_upgrade_request, CloseCode, Frame, Opcode, WebSocketConfig,
    WebSocketError, WsMessage, DEFAULT_MAX_FRAME_PAYLOAD, DEFAULT_MAX_MESSAGE_SIZE,
    MAX_CONTROL_PAYLOAD,
};
