//! A byte stream wrapper that lets the Tunnel Engine look ahead without
//! consuming what it saw — used to tell a WS-before-TLS upgrade apart from a
//! TLS client hello on the same accepted socket, and later to check for
//! `Upgrade: websocket` before committing to forwarding a decrypted request
//! to the app.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub struct PeekStream<S> {
    inner: S,
    peeked: BytesMut,
}

impl<S: AsyncRead + Unpin> PeekStream<S> {
    pub fn new(inner: S) -> Self {
        PeekStream { inner, peeked: BytesMut::new() }
    }

    /// Ensures at least `n` bytes (or EOF) are buffered and returns every
    /// byte buffered so far, without removing them from the stream.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.peeked.len() < n {
            let mut chunk = [0u8; 4096];
            let mut buf = ReadBuf::new(&mut chunk);
            let read = std::future::poll_fn(|cx| Pin::new(&mut self.inner).poll_read(cx, &mut buf)).await;
            read?;
            let filled = buf.filled().len();
            if filled == 0 {
                break;
            }
            self.peeked.extend_from_slice(&chunk[..filled]);
        }
        Ok(&self.peeked)
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.peeked.is_empty() {
            let take = self.peeked.len().min(buf.remaining());
            let chunk = self.peeked.split_to(take);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
