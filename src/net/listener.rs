//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections until closed or cancelled
//! - Enforce max_connections limit via semaphore
//! - Graceful handling of accept errors

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::ListenerConfig;
use crate::net::connection::Connection;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    Bind(io::Error),
    /// Failed to accept connection.
    #[error("Failed to accept: {0}")]
    Accept(io::Error),
}

impl ListenerError {
    /// Whether the error concerns a single client that went away before it
    /// could be accepted, leaving the listener itself healthy.
    pub fn is_transient(&self) -> bool {
        match self {
            ListenerError::Accept(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
            ),
            ListenerError::Bind(_) => false,
        }
    }
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
#[derive(Debug)]
pub struct Listener {
    /// The underlying TCP listener.
    inner: TcpListener,
    /// Address actually bound (resolves port 0).
    local_addr: SocketAddr,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
    /// Configured maximum connections.
    max_connections: usize,
    /// Cancelled by [`Listener::close`].
    closed: CancellationToken,
}

impl Listener {
    /// Bind to the configured address with connection limits.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|e| ListenerError::Bind(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let listener = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(
            address = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            local_addr,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            closed: CancellationToken::new(),
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached. Returns
    /// `Ok(None)` once the listener is closed or `cancel` fires; no more
    /// connections are coming after that.
    pub async fn accept(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Connection>, ListenerError> {
        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            _ = self.closed.cancelled() => Ok(None),
            accepted = self.accept_bounded() => accepted.map(Some),
        }
    }

    async fn accept_bounded(&self) -> Result<Connection, ListenerError> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Accept(io::Error::other("connection limit closed")))?;

        // Then accept the connection
        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok(Connection::new(stream, addr).with_permit(permit))
    }

    /// Stop accepting. The socket is released once the last reference drops.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            tracing::info!(address = %self.local_addr, "Listener closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn loopback(max_connections: usize) -> ListenerConfig {
        ListenerConfig {
            bind_address: "127.0.0.1:0".into(),
            max_connections,
        }
    }

    #[tokio::test]
    async fn bind_rejects_bad_address() {
        let config = ListenerConfig {
            bind_address: "not an address".into(),
            max_connections: 1,
        };
        assert!(matches!(
            Listener::bind(&config).await,
            Err(ListenerError::Bind(_))
        ));
    }

    #[tokio::test]
    async fn bind_fails_when_port_taken() {
        let first = Listener::bind(&loopback(1)).await.unwrap();
        let config = ListenerConfig {
            bind_address: first.local_addr().to_string(),
            max_connections: 1,
        };
        assert!(matches!(
            Listener::bind(&config).await,
            Err(ListenerError::Bind(_))
        ));
    }

    #[tokio::test]
    async fn accept_returns_none_when_cancelled() {
        let listener = Listener::bind(&loopback(4)).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(listener.accept(&cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn accept_returns_none_after_close() {
        let listener = Arc::new(Listener::bind(&loopback(4)).await.unwrap());
        let cancel = CancellationToken::new();

        let waiting = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.close();

        let accepted = waiting.await.unwrap().unwrap();
        assert!(accepted.is_none());
        assert!(listener.is_closed());
    }

    #[tokio::test]
    async fn permits_are_held_until_dispose() {
        let listener = Listener::bind(&loopback(1)).await.unwrap();
        let addr = listener.local_addr();
        let cancel = CancellationToken::new();

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let first = listener.accept(&cancel).await.unwrap().unwrap();
        assert_eq!(listener.available_permits(), 0);

        let _c2 = TcpStream::connect(addr).await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), listener.accept(&cancel)).await;
        assert!(blocked.is_err(), "second accept should wait for a slot");

        first.dispose();
        assert_eq!(listener.available_permits(), 1);
        let second = listener.accept(&cancel).await.unwrap();
        assert!(second.is_some());
    }
}
