//! Service lifecycle controller.
//!
//! ```text
//! Created → Binding → Accepting → Draining → Stopped
//! ```
//!
//! The accept loop registers every connection and spawns its runner without
//! waiting on it. A stop request cancels the pending accept; the listener is
//! then closed before the registry snapshot is taken, so the set of sessions
//! to drain can only shrink.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::lifecycle::Shutdown;
use crate::net::{Connection, Listener, ListenerError};
use crate::observability::metrics;
use crate::rpc::RpcHandler;
use crate::server::registry::{session_task, ConnectionRegistry, RegistryError};
use crate::server::runner::SessionRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceState {
    Created,
    Binding,
    Accepting,
    Draining,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("connection registry invariant violated: {0}")]
    DuplicateConnection(#[from] RegistryError),
    #[error("service has already been started")]
    AlreadyStarted,
}

/// Hosts JSON-RPC sessions for every accepted TCP connection.
pub struct RpcService {
    config: ServerConfig,
    handler: Arc<dyn RpcHandler>,
    registry: ConnectionRegistry,
    shutdown: Shutdown,
    listener: Mutex<Option<Arc<Listener>>>,
    local_addr: OnceLock<SocketAddr>,
    state: watch::Sender<ServiceState>,
}

impl RpcService {
    pub fn new(config: ServerConfig, handler: Arc<dyn RpcHandler>) -> Self {
        let (state, _) = watch::channel(ServiceState::Created);
        Self {
            config,
            handler,
            registry: ConnectionRegistry::new(),
            shutdown: Shutdown::new(),
            listener: Mutex::new(None),
            local_addr: OnceLock::new(),
            state,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Wait until the service has reached `target` or any later state.
    pub async fn wait_for_state(&self, target: ServiceState) -> ServiceState {
        let mut rx = self.state.subscribe();
        if let Ok(state) = rx.wait_for(|state| *state >= target).await {
            return *state;
        }
        // The sender lives as long as `self`.
        self.state()
    }

    /// Address the listener was bound to, once binding succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Bind, accept until stopped, then drain every live session.
    ///
    /// Returns once all sessions have finished cleanup. Stops when `cancel`
    /// fires or [`RpcService::request_stop`] is called.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ServiceError> {
        let claimed = self.state.send_if_modified(|state| {
            if *state != ServiceState::Created {
                return false;
            }
            *state = ServiceState::Binding;
            true
        });
        if !claimed {
            return Err(ServiceError::AlreadyStarted);
        }
        tracing::debug!(to = ?ServiceState::Binding, "Service state changed");

        let listener = match Listener::bind(&self.config.listener).await {
            Ok(listener) => Arc::new(listener),
            Err(e) => {
                tracing::error!(error = %e, "RPC service failed to bind");
                self.transition(ServiceState::Stopped);
                return Err(e.into());
            }
        };
        let _ = self.local_addr.set(listener.local_addr());
        *self.listener_slot() = Some(listener.clone());
        tracing::info!(address = %listener.local_addr(), "RPC service bound");

        let stop = self.shutdown.link(&cancel);
        self.transition(ServiceState::Accepting);
        let outcome = self.accept_loop(&listener, &stop).await;
        if let Err(e) = &outcome {
            tracing::error!(error = %e, "Accept loop aborted");
        }

        stop.cancel();
        drop(listener);
        self.release_listener();

        self.transition(ServiceState::Draining);
        self.drain().await;
        self.transition(ServiceState::Stopped);
        outcome
    }

    /// Ask a running service to stop and release its listening socket.
    pub fn request_stop(&self) {
        tracing::info!("Stop requested");
        self.shutdown.trigger();
        self.release_listener();
    }

    async fn accept_loop(
        &self,
        listener: &Listener,
        stop: &CancellationToken,
    ) -> Result<(), ServiceError> {
        loop {
            tracing::debug!("Waiting for client connections");
            let connection = match listener.accept(stop).await {
                Ok(Some(connection)) => connection,
                Ok(None) => {
                    tracing::info!("No more connections will be accepted");
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "Client vanished before accept");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed, stopping");
                    return Ok(());
                }
            };
            self.start_session(connection)?;
        }
    }

    fn start_session(&self, connection: Connection) -> Result<(), ServiceError> {
        let id = connection.id();
        let handle = connection.handle();
        tracing::info!(
            connection_id = %id,
            peer_addr = %connection.peer_addr(),
            "Client connected"
        );

        let (registered_tx, registered_rx) = oneshot::channel();
        let runner = SessionRunner::new(
            connection,
            self.handler.clone(),
            self.registry.clone(),
            self.config.framing.max_frame_length,
        );
        let task = session_task(runner.spawn(registered_rx));

        // On failure the sender drops and the runner closes the connection
        // without touching the registry.
        self.registry.register(handle, task)?;
        metrics::record_connection_opened();
        let _ = registered_tx.send(());
        Ok(())
    }

    async fn drain(&self) {
        let entries = self.registry.snapshot();
        tracing::info!(count = entries.len(), "Draining RPC sessions");

        let mut tasks = Vec::with_capacity(entries.len());
        for entry in entries {
            tracing::warn!(
                connection_id = %entry.id(),
                peer_addr = %entry.handle.peer_addr(),
                "Aborting connection"
            );
            entry.handle.abort();
            tasks.push(entry.task);
        }

        tracing::info!(count = tasks.len(), "Waiting for sessions to finish");
        join_all(tasks).await;
        tracing::info!("All RPC sessions finished");
    }

    fn release_listener(&self) {
        if let Some(listener) = self.listener_slot().take() {
            listener.close();
        }
    }

    fn listener_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<Listener>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: ServiceState) {
        let previous = self.state.send_replace(next);
        tracing::debug!(from = ?previous, to = ?next, "Service state changed");
    }
}

impl std::fmt::Debug for RpcService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcService")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("connections", &self.registry.len())
            .finish()
    }
}
