//! In-memory byte pipe with error-carrying close.
//!
//! Filters and exporter streams are stitched together with these pipes. The
//! writer side implements [`AsyncWrite`] with backpressure through a bounded
//! channel; closing it with [`PipeWriter::close_with_error`] delivers the
//! error to the reader in place of end-of-stream. A delivered error is
//! sticky: every subsequent read reproduces it.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

const PIPE_CAPACITY: usize = 8;

type Chunk = Result<Bytes, io::Error>;

/// Create a connected pipe pair.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
    (
        PipeWriter {
            tx: PollSender::new(tx.clone()),
            spare: Some(tx),
        },
        PipeReader {
            rx,
            buf: Bytes::new(),
            err: None,
        },
    )
}

/// Write half of a pipe.
///
/// Shutting down (or dropping) the writer produces end-of-stream on the
/// reader; [`close_with_error`](PipeWriter::close_with_error) produces the
/// given error instead.
pub struct PipeWriter {
    tx: PollSender<Chunk>,
    spare: Option<mpsc::Sender<Chunk>>,
}

impl PipeWriter {
    /// Terminal close that hands `err` to the reader.
    pub async fn close_with_error(mut self, err: io::Error) {
        if let Some(tx) = self.spare.take() {
            let _ = tx.send(Err(err)).await;
        }
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        match self.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let chunk = Bytes::copy_from_slice(buf);
                if self.tx.send_item(Ok(chunk)).is_err() {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close();
        self.spare = None;
        Poll::Ready(Ok(()))
    }
}

/// Read half of a pipe.
pub struct PipeReader {
    rx: mpsc::Receiver<Chunk>,
    buf: Bytes,
    err: Option<(io::ErrorKind, String)>,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.buf.is_empty() {
                let n = self.buf.len().min(out.remaining());
                out.put_slice(&self.buf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if let Some((kind, msg)) = &self.err {
                return Poll::Ready(Err(io::Error::new(*kind, msg.clone())));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    if !chunk.is_empty() {
                        self.buf = chunk;
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.err = Some((e.kind(), e.to_string()));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
