//! Buffered line and bulk reads over an unbuffered byte stream.
//!
//! [`LineReader`] keeps a single fixed-size residue buffer of bytes that were
//! read from the stream but not yet handed out. The same residue survives
//! every boundary on a connection: request line to headers, headers to body,
//! and the HTTP phase to the WebSocket frame stream after an upgrade. Losing
//! it would drop bytes the peer sent in the same packet as an earlier line.

use asupersync::io::{AsyncRead, ReadBuf};
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::Poll;

/// Residue buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Incremental reader with single-slot residue.
///
/// Lines terminate at CR, LF, or CRLF. A CRLF split across two reads is
/// consumed as one terminator: a CR seen at the end of the residue marks a
/// pending LF that is discarded when the next byte arrives, whichever
/// operation observes it.
#[derive(Debug)]
pub struct LineReader<S> {
    stream: S,
    buf: Vec<u8>,
    start: usize,
    len: usize,
    pending_lf: bool,
    eof: bool,
}

impl<S: AsyncRead + Unpin> LineReader<S> {
    /// Wrap a stream with the default residue buffer.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: vec![0; DEFAULT_BUFFER_SIZE],
            start: 0,
            len: 0,
            pending_lf: false,
            eof: false,
        }
    }

    /// Read one line.
    ///
    /// Returns `Ok(None)` on end of input before any byte of a line. If the
    /// input ends mid-line, the accumulated bytes are returned verbatim.
    /// Line bytes are decoded as UTF-8 lossily.
    ///
    /// With `force_read` set, reads block until data or end of input. Without
    /// it, the stream is only read while it has data immediately available,
    /// and "no data right now" behaves like end of input for this call.
    pub async fn read_line(&mut self, force_read: bool) -> io::Result<Option<String>> {
        let mut acc: Vec<u8> = Vec::new();
        loop {
            self.discard_pending_lf();
            let residue = &self.buf[self.start..self.start + self.len];
            if let Some(pos) = residue.iter().position(|&b| b == b'\r' || b == b'\n') {
                let terminator = residue[pos];
                acc.extend_from_slice(&residue[..pos]);
                self.advance(pos + 1);
                if terminator == b'\r' {
                    if self.len > 0 {
                        if self.buf[self.start] == b'\n' {
                            self.advance(1);
                        }
                    } else {
                        self.pending_lf = true;
                    }
                }
                return Ok(Some(String::from_utf8_lossy(&acc).into_owned()));
            }

            acc.extend_from_slice(residue);
            self.len = 0;

            if self.fill(force_read).await? == 0 {
                if acc.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(String::from_utf8_lossy(&acc).into_owned()));
            }
        }
    }

    /// Drain the residue plus whatever the stream can deliver without
    /// blocking.
    ///
    /// When the residue is empty one blocking read is performed first, so a
    /// caller waiting on a body is woken by the next packet; after that only
    /// immediately-available bytes are taken.
    pub async fn read_remaining(&mut self) -> io::Result<Vec<u8>> {
        self.discard_pending_lf();
        let mut out = Vec::new();
        out.extend_from_slice(&self.buf[self.start..self.start + self.len]);
        self.len = 0;

        if out.is_empty() && self.fill(true).await? > 0 {
            self.discard_pending_lf();
            out.extend_from_slice(&self.buf[self.start..self.start + self.len]);
            self.len = 0;
        }

        while self.fill(false).await? > 0 {
            self.discard_pending_lf();
            out.extend_from_slice(&self.buf[self.start..self.start + self.len]);
            self.len = 0;
        }
        Ok(out)
    }

    /// Fill `buf` exactly, consuming residue first.
    ///
    /// Fails with [`io::ErrorKind::UnexpectedEof`] if the stream ends before
    /// `buf` is full.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            self.discard_pending_lf();
            if self.len == 0 {
                if self.fill(true).await? == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed mid-read",
                    ));
                }
                continue;
            }
            let take = self.len.min(buf.len() - filled);
            buf[filled..filled + take]
                .copy_from_slice(&self.buf[self.start..self.start + take]);
            self.advance(take);
            filled += take;
        }
        Ok(())
    }

    /// Bytes currently buffered but not yet returned.
    #[must_use]
    pub fn residue_len(&self) -> usize {
        self.len
    }

    fn advance(&mut self, n: usize) {
        self.start += n;
        self.len -= n;
    }

    /// Drop the LF half of a CRLF that was split across reads.
    fn discard_pending_lf(&mut self) {
        if self.pending_lf && self.len > 0 {
            if self.buf[self.start] == b'\n' {
                self.advance(1);
            }
            self.pending_lf = false;
        }
    }

    /// Refill the (empty) residue buffer. Returns the byte count, 0 on end
    /// of input or, for non-forced fills, when nothing is ready.
    async fn fill(&mut self, force: bool) -> io::Result<usize> {
        debug_assert_eq!(self.len, 0);
        if self.eof {
            return Ok(0);
        }
        self.start = 0;
        let n = if force {
            read_some(&mut self.stream, &mut self.buf).await?
        } else {
            match read_now_or_never(&mut self.stream, &mut self.buf)? {
                Some(n) => n,
                None => return Ok(0),
            }
        };
        if n == 0 {
            self.eof = true;
        }
        self.len = n;
        Ok(n)
    }
}

/// One read into `buf`, waiting for data. 0 means end of input.
async fn read_some<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut [u8]) -> io::Result<usize> {
    poll_fn(|cx| {
        let mut read_buf = ReadBuf::new(buf);
        match Pin::new(&mut *stream).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    })
    .await
}

/// Single poll read. `Ok(None)` when the stream has nothing ready.
fn read_now_or_never<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut [u8],
) -> io::Result<Option<usize>> {
    let waker = std::task::Waker::from(std::sync::Arc::new(NoopWake));
    let mut cx = std::task::Context::from_waker(&waker);
    let mut read_buf = ReadBuf::new(buf);
    match Pin::new(stream).poll_read(&mut cx, &mut read_buf) {
        Poll::Ready(Ok(())) => Ok(Some(read_buf.filled().len())),
        Poll::Ready(Err(e)) => Err(e),
        Poll::Pending => Ok(None),
    }
}

struct NoopWake;

impl std::task::Wake for NoopWake {
    fn wake(self: std::sync::Arc<Self>) {}
}
