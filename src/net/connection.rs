//! Accepted connections and their lifecycle signals.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Own the byte stream until an RPC session takes it
//! - Let a second party abort the connection and unblock pending I/O
//! - Announce when the connection has fully closed

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One accepted connection.
///
/// The session runner owns this value; the registry only keeps a
/// [`ConnectionHandle`] so shutdown can abort it.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    transport: Option<Transport>,
    abort: CancellationToken,
    closed: CancellationToken,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Connection {
    /// Wrap an accepted stream.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let abort = CancellationToken::new();
        let closed = CancellationToken::new();
        let transport = Transport::new(stream, abort.clone(), closed.clone());

        Self {
            id: ConnectionId::next(),
            peer_addr,
            transport: Some(transport),
            abort,
            closed,
            _permit: None,
        }
    }

    /// Hold a connection-limit slot until this connection is disposed.
    pub(crate) fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self._permit = Some(permit);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Take the byte stream. Returns `None` once it has been taken.
    pub fn take_transport(&mut self) -> Option<Transport> {
        self.transport.take()
    }

    /// Non-owning reference used to abort this connection from elsewhere.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            id: self.id,
            peer_addr: self.peer_addr,
            abort: self.abort.clone(),
        }
    }

    /// Forcibly terminate the connection.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Resolves once the connection has closed or been aborted.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.closed.cancelled() => {}
            _ = self.abort.cancelled() => {}
        }
    }

    /// Release everything this connection still holds.
    pub fn dispose(mut self) {
        // Dropping the transport closes the socket if no session took it.
        self.transport.take();
        self.closed.cancel();
        tracing::trace!(connection_id = %self.id, "Connection disposed");
    }
}

/// Cloneable, non-owning reference to a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer_addr: SocketAddr,
    abort: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Forcibly terminate the connection, failing any pending read or write.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }
}

/// The duplex byte stream of a connection.
///
/// Once the owning connection is aborted every pending and future read or
/// write fails with [`io::ErrorKind::ConnectionAborted`]. End of stream, I/O
/// errors, aborts and dropping the transport all mark the connection closed.
pub struct Transport {
    stream: TcpStream,
    aborted: Pin<Box<WaitForCancellationFutureOwned>>,
    closed: CancellationToken,
}

impl Transport {
    fn new(stream: TcpStream, abort: CancellationToken, closed: CancellationToken) -> Self {
        Self {
            stream,
            aborted: Box::pin(abort.cancelled_owned()),
            closed,
        }
    }

    fn poll_aborted(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        match self.aborted.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.closed.cancel();
                Poll::Ready(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection aborted",
                ))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn observe<T>(&self, result: &Poll<io::Result<T>>) {
        if let Poll::Ready(Err(_)) = result {
            self.closed.cancel();
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("stream", &self.stream)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(err) = this.poll_aborted(cx) {
            return Poll::Ready(Err(err));
        }

        let before = buf.filled().len();
        let result = Pin::new(&mut this.stream).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            if buf.filled().len() == before && buf.remaining() > 0 {
                this.closed.cancel();
            }
        }
        this.observe(&result);
        result
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(err) = this.poll_aborted(cx) {
            return Poll::Ready(Err(err));
        }
        let result = Pin::new(&mut this.stream).poll_write(cx, buf);
        this.observe(&result);
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(err) = this.poll_aborted(cx) {
            return Poll::Ready(Err(err));
        }
        let result = Pin::new(&mut this.stream).poll_flush(cx);
        this.observe(&result);
        result
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.stream).poll_shutdown(cx);
        this.observe(&result);
        result
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}
