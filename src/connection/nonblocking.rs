//! Async connections over tokio streams.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use uuid::Uuid;

use crate::error::ConnectionError;

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T, ConnectionError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(|e| ConnectionError::from_io(e, timeout)),
        Err(_) => Err(ConnectionError::Timeout { timeout }),
    }
}

/// Async counterpart of [`super::Connection`].
///
/// The poll-level `AsyncRead`/`AsyncWrite` surface is what stream upgrades layer over; the
/// timed methods are what the handshake drivers call. An operation whose data is already
/// available completes on its first poll.
#[async_trait]
pub trait AsyncConnection: AsyncRead + AsyncWrite + Send + Unpin {
    fn connection_id(&self) -> Uuid;

    /// Tear the connection down immediately. Idempotent.
    fn abort(&mut self);

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ConnectionError> {
        with_timeout(timeout, AsyncReadExt::read(self, buf)).await
    }

    async fn write(
        &mut self,
        buf: &[u8],
        flush: bool,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        with_timeout(timeout, async {
            self.write_all(buf).await?;
            if flush {
                self.flush().await?;
            }
            Ok::<(), io::Error>(())
        })
        .await
    }

    /// Half-close the write direction.
    async fn shutdown(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        with_timeout(timeout, AsyncWriteExt::shutdown(self)).await
    }

    async fn validate(&mut self, _via: &str) -> bool {
        true
    }

    fn try_prepend(&mut self, _bytes: &[u8]) -> bool {
        false
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection aborted")
}

/// [`AsyncConnection`] over an exclusively owned tokio stream.
pub struct AsyncStreamConnection<S> {
    id: Uuid,
    stream: Option<S>,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> AsyncStreamConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream: Some(stream),
        }
    }

    /// Keep the id of the connection this stream was layered over.
    pub fn with_id(stream: S, id: Uuid) -> Self {
        Self {
            id,
            stream: Some(stream),
        }
    }

    pub fn get_ref(&self) -> Option<&S> {
        self.stream.as_ref()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AsyncStreamConnection<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.stream.as_mut() {
            Some(s) => Pin::new(s).poll_read(cx, buf),
            None => Poll::Ready(Err(aborted())),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AsyncStreamConnection<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.stream.as_mut() {
            Some(s) => Pin::new(s).poll_write(cx, buf),
            None => Poll::Ready(Err(aborted())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stream.as_mut() {
            Some(s) => Pin::new(s).poll_flush(cx),
            None => Poll::Ready(Err(aborted())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stream.as_mut() {
            Some(s) => Pin::new(s).poll_shutdown(cx),
            None => Poll::Ready(Err(aborted())),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + Unpin> AsyncConnection for AsyncStreamConnection<S> {
    fn connection_id(&self) -> Uuid {
        self.id
    }

    fn abort(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(connection_id = %self.id, "aborting connection");
        }
    }
}

/// Async pre-read wrapper; see [`super::PreReadConnection`].
pub struct AsyncPreReadConnection {
    inner: Box<dyn AsyncConnection>,
    buffer: Vec<u8>,
    offset: usize,
}

impl AsyncPreReadConnection {
    pub fn new(inner: Box<dyn AsyncConnection>, bytes: &[u8]) -> Self {
        Self {
            inner,
            buffer: bytes.to_vec(),
            offset: 0,
        }
    }

    pub fn wrap(mut conn: Box<dyn AsyncConnection>, bytes: &[u8]) -> Box<dyn AsyncConnection> {
        if bytes.is_empty() || conn.try_prepend(bytes) {
            return conn;
        }
        Box::new(Self::new(conn, bytes))
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer[self.offset..]
    }
}

impl AsyncRead for AsyncPreReadConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.offset == this.buffer.len() {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
        let pending = &this.buffer[this.offset..];
        let n = pending.len().min(buf.remaining());
        buf.put_slice(&pending[..n]);
        this.offset += n;
        if this.offset == this.buffer.len() {
            this.buffer = Vec::new();
            this.offset = 0;
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for AsyncPreReadConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl AsyncConnection for AsyncPreReadConnection {
    fn connection_id(&self) -> Uuid {
        self.inner.connection_id()
    }

    fn abort(&mut self) {
        self.buffer = Vec::new();
        self.offset = 0;
        self.inner.abort();
    }

    async fn validate(&mut self, via: &str) -> bool {
        self.inner.validate(via).await
    }

    fn try_prepend(&mut self, bytes: &[u8]) -> bool {
        let mut joined = Vec::with_capacity(bytes.len() + self.buffered().len());
        joined.extend_from_slice(bytes);
        joined.extend_from_slice(self.buffered());
        self.buffer = joined;
        self.offset = 0;
        true
    }
}

/// An [`AsyncConnection`] exposed as a plain tokio stream for upgrade providers.
pub struct AsyncConnectionStream {
    inner: Box<dyn AsyncConnection>,
}

impl AsyncConnectionStream {
    pub fn new(inner: Box<dyn AsyncConnection>) -> Self {
        Self { inner }
    }

    pub fn connection_id(&self) -> Uuid {
        self.inner.connection_id()
    }

    pub fn abort(&mut self) {
        self.inner.abort();
    }

    pub fn into_inner(self) -> Box<dyn AsyncConnection> {
        self.inner
    }
}

impl AsyncRead for AsyncConnectionStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for AsyncConnectionStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
