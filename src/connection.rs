//! WebSocket connection state machine.
//!
//! A [`WebSocketConnection`] owns an upgraded TCP stream and turns the frame
//! stream into whole messages. Sends from any number of tasks are serialized
//! by a single send mutex; each frame is written and flushed as one unit
//! under the lock. Receiving is single-reader by contract.
//!
//! Close handling is a small half-state machine: `close_sent` flips when we
//! write a close frame, `close_received` when the peer's close arrives. Data
//! sends are rejected once either flag is set; `close` itself stays callable
//! after the peer closes so the handler can reciprocate.

use crate::reader::LineReader;
use crate::websocket::{
    build_close_payload, encode_frame, parse_close_payload, read_frame, CloseCode, Frame, Opcode,
    WebSocketConfig, WebSocketError, WsMessage, MAX_CONTROL_PAYLOAD,
};
use asupersync::io::AsyncWriteExt;
use asupersync::net::{OwnedReadHalf, OwnedWriteHalf};
use asupersync::sync::{LockError, Mutex};
use asupersync::Cx;
use std::sync::atomic::{AtomicBool, Ordering};

type ControlHook = Box<dyn Fn(&[u8]) + Send + Sync>;

/// A server-side WebSocket connection.
///
/// Created by the server after the 101 response is on the wire. All methods
/// take `&self`; wrap the connection in an `Arc` to send from several tasks
/// while one task receives.
pub struct WebSocketConnection {
    reader: Mutex<LineReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    cx: Cx,
    config: WebSocketConfig,
    close_sent: AtomicBool,
    close_received: AtomicBool,
    on_ping: std::sync::Mutex<Option<ControlHook>>,
    on_pong: std::sync::Mutex<Option<ControlHook>>,
}

impl WebSocketConnection {
    /// The reader carries any bytes the client sent together with its
    /// upgrade request; frame reads start from that residue.
    pub(crate) fn new(
        reader: LineReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        cx: Cx,
        config: WebSocketConfig,
    ) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            cx,
            config,
            close_sent: AtomicBool::new(false),
            close_received: AtomicBool::new(false),
            on_ping: std::sync::Mutex::new(None),
            on_pong: std::sync::Mutex::new(None),
        }
    }

    /// Whether the connection can still carry data: no close frame has been
    /// sent or received.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.close_sent.load(Ordering::Acquire) && !self.close_received.load(Ordering::Acquire)
    }

    /// Install a hook observing every received ping payload.
    pub fn on_ping(&self, hook: impl Fn(&[u8]) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.on_ping.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    /// Install a hook observing every received pong payload.
    pub fn on_pong(&self, hook: impl Fn(&[u8]) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.on_pong.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    /// Receive the next message.
    ///
    /// Pings are answered with a pong automatically and pongs are swallowed;
    /// both fire their hooks. A close frame marks the connection
    /// remote-closed and is returned immediately. Single-reader: do not call
    /// from two tasks at once.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` after the peer's close or mid-frame end of input,
    /// `Protocol` on malformed frame sequences, `TooLarge` when an assembled
    /// message exceeds the limit, `Cancelled` on task cancellation.
    /// `Protocol` and `TooLarge` are answered on the wire with a close frame
    /// (1002 or 1009) before the error is returned.
    pub async fn receive_message(&self) -> Result<WsMessage, WebSocketError> {
        if self.close_received.load(Ordering::Acquire) {
            return Err(WebSocketError::ConnectionClosed);
        }

        match self.receive_inner().await {
            Ok(message) => Ok(message),
            Err(e) => {
                // Answer malformed input on the wire (1002/1009) before
                // surfacing the error. Best effort.
                if matches!(
                    e,
                    WebSocketError::Protocol(_) | WebSocketError::TooLarge { .. }
                ) {
                    let _ = self.close(e.close_code(), "").await;
                }
                Err(e)
            }
        }
    }

    async fn receive_inner(&self) -> Result<WsMessage, WebSocketError> {
        let mut reader = self.reader.lock(&self.cx).await.map_err(lock_error)?;
        let mut assembler = MessageAssembler::new(self.config.max_message_size);

        loop {
            if self.cx.is_cancel_requested() {
                return Err(WebSocketError::Cancelled);
            }

            let frame = read_frame(&mut *reader, &self.config).await?;
            match frame.opcode {
                Opcode::Close => {
                    self.close_received.store(true, Ordering::Release);
                    let (status, reason) = parse_close_payload(&frame.payload)?;
                    return Ok(WsMessage::Close { status, reason });
                }
                Opcode::Ping => {
                    self.fire_hook(&self.on_ping, &frame.payload);
                    self.send_pong(&frame.payload).await?;
                }
                Opcode::Pong => {
                    self.fire_hook(&self.on_pong, &frame.payload);
                }
                _ => {
                    if let Some(message) = assembler.push(frame)? {
                        return Ok(message);
                    }
                }
            }
        }
    }

    /// Send one text message as a single final frame.
    pub async fn send_text(&self, text: &str) -> Result<(), WebSocketError> {
        self.ensure_open()?;
        self.send_raw(&encode_frame(true, Opcode::Text, text.as_bytes()))
            .await
    }

    /// Send one binary message as a single final frame.
    pub async fn send_binary(&self, data: &[u8]) -> Result<(), WebSocketError> {
        self.ensure_open()?;
        self.send_raw(&encode_frame(true, Opcode::Binary, data)).await
    }

    /// Send a ping with up to 125 bytes of payload.
    pub async fn send_ping(&self, data: &[u8]) -> Result<(), WebSocketError> {
        self.ensure_open()?;
        if data.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::Protocol(
                "ping payload exceeds 125 bytes".into(),
            ));
        }
        self.send_raw(&encode_frame(true, Opcode::Ping, data)).await
    }

    /// Close the connection.
    ///
    /// The first call sends a close frame and marks the connection closed
    /// for sending; every later call is a no-op that writes nothing.
    /// Callable after the peer's close to reciprocate.
    pub async fn close(&self, status: CloseCode, reason: &str) -> Result<(), WebSocketError> {
        if self.close_sent.load(Ordering::Acquire) {
            return Ok(());
        }
        let payload = build_close_payload(status, reason)?;
        if self.close_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.send_raw(&encode_frame(true, Opcode::Close, &payload))
            .await
    }

    /// Half-close the write side once the handler is done. Best effort.
    pub(crate) async fn shutdown_write(&self) {
        if let Ok(mut writer) = self.writer.lock(&self.cx).await {
            let _ = writer.shutdown().await;
        }
    }

    /// Auto-response to a received ping. Not part of the public surface.
    async fn send_pong(&self, data: &[u8]) -> Result<(), WebSocketError> {
        self.send_raw(&encode_frame(true, Opcode::Pong, data)).await
    }

    /// Write and flush one encoded frame under the send mutex.
    async fn send_raw(&self, bytes: &[u8]) -> Result<(), WebSocketError> {
        let mut writer = self.writer.lock(&self.cx).await.map_err(lock_error)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), WebSocketError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(WebSocketError::ConnectionClosed)
        }
    }

    fn fire_hook(&self, slot: &std::sync::Mutex<Option<ControlHook>>, payload: &[u8]) {
        if let Ok(guard) = slot.lock() {
            if let Some(hook) = guard.as_ref() {
                hook(payload);
            }
        }
    }
}

fn lock_error(e: LockError) -> WebSocketError {
    match e {
        LockError::Cancelled => WebSocketError::Cancelled,
        _ => WebSocketError::ConnectionClosed,
    }
}

/// Reassembles data frames into whole messages.
///
/// The first frame of a message fixes the kind; continuations append until
/// one carries FIN.
#[derive(Debug)]
pub(crate) struct MessageAssembler {
    kind: Option<Opcode>,
    data: Vec<u8>,
    max_message_size: usize,
}

impl MessageAssembler {
    pub(crate) fn new(max_message_size: usize) -> Self {
        Self {
            kind: None,
            data: Vec::new(),
            max_message_size,
        }
    }

    /// Feed one data or continuation frame. Returns the finished message
    /// when `frame.fin` completes it.
    pub(crate) fn push(&mut self, frame: Frame) -> Result<Option<WsMessage>, WebSocketError> {
        match frame.opcode {
            Opcode::Continuation => {
                if self.kind.is_none() {
                    return Err(WebSocketError::Protocol(
                        "continuation frame without a message in progress".into(),
                    ));
                }
            }
            Opcode::Text | Opcode::Binary => {
                if self.kind.is_some() {
                    return Err(WebSocketError::Protocol(
                        "data frame while a fragmented message is in progress".into(),
                    ));
                }
                self.kind = Some(frame.opcode);
            }
            Opcode::Reserved(op) => {
                return Err(WebSocketError::Protocol(format!(
                    "unknown opcode: 0x{op:X}"
                )));
            }
            // Control frames are handled before assembly.
            Opcode::Close | Opcode::Ping | Opcode::Pong => {
                return Err(WebSocketError::Protocol(
                    "control frame fed to message assembly".into(),
                ));
            }
        }

        let size = self.data.len() + frame.payload.len();
        if size > self.max_message_size {
            return Err(WebSocketError::TooLarge {
                size,
                limit: self.max_message_size,
            });
        }
        self.data.extend_from_slice(&frame.payload);

        if !frame.fin {
            return Ok(None);
        }

        let data = std::mem::take(&mut self.data);
        let message = match self.kind.take() {
            Some(Opcode::Text) => WsMessage::Text(data),
            _ => WsMessage::Binary(data),
        };
        Ok(Some(message))
    }
}
