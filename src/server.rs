//! TCP server: accept loop and per-connection worker.
//!
//! The accept loop races `accept` against the shutdown signal and spawns one
//! task per connection. Each task serves exactly one request: either the
//! request upgrades and the task runs a WebSocket handler until it returns,
//! or the HTTP handler produces a single `Connection: close` response.

use crate::connection::WebSocketConnection;
use crate::parser::{parse_request, ParseError};
use crate::reader::LineReader;
use crate::request::Request;
use crate::response::{Response, ResponseWriter};
use crate::shutdown::ShutdownSignal;
use crate::websocket::{accept_key, is_upgrade_request, CloseCode, WebSocketConfig};
use asupersync::io::AsyncWriteExt;
use asupersync::net::{OwnedWriteHalf, TcpListener, TcpStream};
use asupersync::runtime::{JoinHandle, RuntimeHandle};
use asupersync::Cx;
use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::{pin, Pin};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

/// Default HTTP-phase read timeout.
pub const DEFAULT_HTTP_READ_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default request body limit (8 MiB).
pub const DEFAULT_MAX_REQUEST_BODY: usize = 8 * 1024 * 1024;

/// Boxed error a handler may fail with; its text becomes the 500 body.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// HTTP request handler.
pub type HttpHandler =
    Arc<dyn Fn(Request) -> BoxFuture<Result<Response, BoxError>> + Send + Sync>;

/// WebSocket session handler. The connection is shared so the handler can
/// hand clones to other tasks; the session ends when the future returns.
pub type WsHandler =
    Arc<dyn Fn(Request, Arc<WebSocketConnection>) -> BoxFuture<()> + Send + Sync>;

/// Maps a request path to the WebSocket handler for it, if any.
pub type WsSelector = Arc<dyn Fn(&str) -> Option<WsHandler> + Send + Sync>;

/// Wrap an async closure as an [`HttpHandler`].
pub fn http_handler<F, Fut>(f: F) -> HttpHandler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, BoxError>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

/// Wrap an async closure as a [`WsHandler`].
pub fn ws_handler<F, Fut>(f: F) -> WsHandler
where
    F: Fn(Request, Arc<WebSocketConnection>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |request, connection| Box::pin(f(request, connection)))
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind. Defaults to all interfaces.
    pub bind_address: String,
    /// Port to bind; 0 picks an ephemeral port reported by
    /// [`Server::port`].
    pub port: u16,
    /// Read budget for the HTTP phase of a connection. The WebSocket phase
    /// runs without a deadline; liveness there is ping/pong at the
    /// application layer.
    pub http_read_timeout: Duration,
    /// Largest request body a client may declare.
    pub max_request_body_bytes: usize,
    /// Largest single WebSocket frame payload.
    pub max_frame_payload_bytes: usize,
    /// Largest assembled WebSocket message.
    pub max_message_bytes: usize,
    /// Reject unmasked client frames with close 1002 instead of accepting
    /// them for interoperability.
    pub strict_masking: bool,
    /// Enable TCP_NODELAY on accepted connections.
    pub tcp_nodelay: bool,
}

impl ServerConfig {
    /// Configuration bound to `port` on all interfaces.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port,
            http_read_timeout: DEFAULT_HTTP_READ_TIMEOUT,
            max_request_body_bytes: DEFAULT_MAX_REQUEST_BODY,
            max_frame_payload_bytes: crate::websocket::DEFAULT_MAX_FRAME_PAYLOAD,
            max_message_bytes: crate::websocket::DEFAULT_MAX_MESSAGE_SIZE,
            strict_masking: false,
            tcp_nodelay: true,
        }
    }

    /// Set the bind interface.
    #[must_use]
    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    /// Set the HTTP-phase read timeout.
    #[must_use]
    pub fn with_http_read_timeout(mut self, timeout: Duration) -> Self {
        self.http_read_timeout = timeout;
        self
    }

    /// Set the request body limit.
    #[must_use]
    pub fn with_max_request_body_bytes(mut self, limit: usize) -> Self {
        self.max_request_body_bytes = limit;
        self
    }

    /// Set the frame payload limit.
    #[must_use]
    pub fn with_max_frame_payload_bytes(mut self, limit: usize) -> Self {
        self.max_frame_payload_bytes = limit;
        self
    }

    /// Set the assembled message limit.
    #[must_use]
    pub fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit;
        self
    }

    /// Require masked client frames.
    #[must_use]
    pub fn with_strict_masking(mut self, strict: bool) -> Self {
        self.strict_masking = strict;
        self
    }

    /// Enable or disable TCP_NODELAY.
    #[must_use]
    pub fn with_tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_frame_payload: self.max_frame_payload_bytes,
            max_message_size: self.max_message_bytes,
            strict_masking: self.strict_masking,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Handle for stopping a running server and reading its bound address.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shutdown: ShutdownSignal,
    addr: SocketAddr,
}

impl ServerHandle {
    /// Request the accept loop to stop.
    pub fn stop(&self) {
        self.shutdown.trigger();
    }

    /// Bound port (resolved when port 0 was requested).
    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Bound socket address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// A bound server, ready to run its accept loop.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    http: HttpHandler,
    ws: Option<WsSelector>,
    shutdown: ShutdownSignal,
}

impl Server {
    /// Bind the configured address and port.
    ///
    /// # Errors
    ///
    /// Returns the bind error from the operating system.
    pub async fn bind(
        config: ServerConfig,
        http: HttpHandler,
        ws: Option<WsSelector>,
    ) -> io::Result<Self> {
        let listener =
            TcpListener::bind(format!("{}:{}", config.bind_address, config.port)).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            config,
            http,
            ws,
            shutdown: ShutdownSignal::new(),
        })
    }

    /// Bound socket address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop/port handle, cloneable across threads.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
            addr: self.local_addr,
        }
    }

    /// Shutdown signal driving this server's accept loop.
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run the accept loop until the shutdown signal or `cx` cancellation.
    ///
    /// One task per connection is spawned on `runtime`; cancellation of `cx`
    /// propagates to every connection task. Transient accept errors are
    /// retried, anything else is logged and the loop continues.
    ///
    /// # Errors
    ///
    /// Currently only fails on spawn failure surfaced as an I/O error.
    pub async fn run(self, cx: &Cx, runtime: &RuntimeHandle) -> io::Result<()> {
        cx.trace(&format!("listening on {}", self.local_addr));
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        loop {
            if self.shutdown.is_shutting_down() || cx.is_cancel_requested() {
                break;
            }

            let outcome = {
                let accept_fut = self.listener.accept();
                let stop_fut = self.shutdown.triggered();
                let mut accept_fut = pin!(accept_fut);
                let mut stop_fut = pin!(stop_fut);

                poll_fn(|task_cx| {
                    if self.shutdown.is_shutting_down() || cx.is_cancel_requested() {
                        return Poll::Ready(AcceptOrShutdown::Shutdown);
                    }
                    if stop_fut.as_mut().poll(task_cx).is_ready() {
                        return Poll::Ready(AcceptOrShutdown::Shutdown);
                    }
                    if let Poll::Ready(result) = accept_fut.as_mut().poll(task_cx) {
                        return Poll::Ready(AcceptOrShutdown::Accept(result));
                    }
                    Poll::Pending
                })
                .await
            };

            let (stream, peer_addr) = match outcome {
                AcceptOrShutdown::Shutdown => break,
                AcceptOrShutdown::Accept(Ok(conn)) => conn,
                AcceptOrShutdown::Accept(Err(ref e)) if is_transient_accept_error(e) => continue,
                AcceptOrShutdown::Accept(Err(e)) => {
                    cx.trace(&format!("accept error: {e}"));
                    continue;
                }
            };

            if self.config.tcp_nodelay {
                let _ = stream.set_nodelay(true);
            }
            cx.trace(&format!("accepted connection from {peer_addr}"));

            let conn_cx = cx.clone();
            let config = self.config.clone();
            let http = Arc::clone(&self.http);
            let ws = self.ws.clone();
            tasks.push(runtime.spawn(async move {
                if let Err(e) =
                    serve_connection(stream, &conn_cx, &config, &http, ws.as_ref()).await
                {
                    conn_cx.trace(&format!("connection error from {peer_addr}: {e}"));
                }
            }));
            tasks.retain(|task| !task.is_finished());
        }

        cx.trace("accept loop stopped");
        for task in tasks {
            task.await;
        }
        Ok(())
    }
}

enum AcceptOrShutdown {
    Accept(io::Result<(TcpStream, SocketAddr)>),
    Shutdown,
}

/// Accept errors worth retrying silently.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Serve one connection: parse a request, then either run the WebSocket
/// session or answer with a single HTTP response.
async fn serve_connection(
    stream: TcpStream,
    cx: &Cx,
    config: &ServerConfig,
    http: &HttpHandler,
    ws: Option<&WsSelector>,
) -> io::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = LineReader::new(read_half);
    let mut writer = write_half;
    let mut response_writer = ResponseWriter::new();

    let request = match parse_request(&mut reader, config.max_request_body_bytes).await {
        Ok(request) => request,
        Err(ParseError::UnexpectedEof) => return Ok(()),
        Err(e) => {
            cx.trace(&format!("request rejected: {e}"));
            let response = match e.status_code() {
                413 => Response::new(413).with_body(e.to_string().into_bytes()),
                _ => Response::bad_request(e.to_string()),
            };
            return write_and_close(&mut writer, response_writer.write(&response, false)).await;
        }
    };
    cx.trace(&format!("{request}"));

    if let Some(selector) = ws {
        if let Some(handler) = selector(request.path()) {
            if is_upgrade_request(&request) {
                let key = request
                    .headers()
                    .get("sec-websocket-key")
                    .unwrap_or_default()
                    .to_string();
                let accept = accept_key(&key);
                writer
                    .write_all(response_writer.write_switching_protocols(&accept))
                    .await?;
                writer.flush().await?;

                let connection = Arc::new(WebSocketConnection::new(
                    reader,
                    writer,
                    cx.clone(),
                    config.websocket_config(),
                ));
                handler(request, Arc::clone(&connection)).await;

                // Best effort: a close frame if the handler left the
                // connection open, then a write half-close.
                let _ = connection.close(CloseCode::Normal, "").await;
                connection.shutdown_write().await;
                return Ok(());
            }
        }
    }

    let head = request.is_head();
    let response = match http(request).await {
        Ok(response) => response,
        Err(e) => {
            cx.trace(&format!("handler error: {e}"));
            Response::server_error(e.to_string())
        }
    };
    write_and_close(&mut writer, response_writer.write(&response, head)).await
}

async fn write_and_close(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    let _ = writer.shutdown().await;
    Ok(())
}
