//! Per-connection session runner.
//!
//! # Responsibilities
//! - Wait until the accept loop has registered the connection
//! - Run one RPC session over the connection's transport
//! - Classify how the session ended
//! - Dispose the connection and remove its registry entry exactly once
//!
//! Cleanup lives in a drop guard, so it also runs if the runner's own task
//! is cancelled.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::net::{Connection, ConnectionId};
use crate::observability::metrics;
use crate::rpc::{MessageCodec, RpcHandler, RpcSession, SessionError};
use crate::server::registry::ConnectionRegistry;

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the connection or the session was stopped.
    Normal,
    /// The peer reset the connection.
    Reset,
    /// The connection was aborted locally, usually by shutdown.
    Aborted,
    /// Anything else; carries a description for the error report.
    Failed(String),
}

impl DisconnectReason {
    pub fn from_result(result: &Result<(), SessionError>) -> Self {
        let Err(err) = result else {
            return DisconnectReason::Normal;
        };
        match err.io_kind() {
            Some(std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe) => {
                DisconnectReason::Reset
            }
            Some(std::io::ErrorKind::ConnectionAborted) => DisconnectReason::Aborted,
            _ => DisconnectReason::Failed(err.to_string()),
        }
    }

    /// Only failures are reported as errors; the rest are ordinary disconnects.
    pub fn is_error(&self) -> bool {
        matches!(self, DisconnectReason::Failed(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Normal => "normal",
            DisconnectReason::Reset => "reset",
            DisconnectReason::Aborted => "aborted",
            DisconnectReason::Failed(_) => "failed",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Failed(detail) => write!(f, "failed: {detail}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Drives one accepted connection from registration to cleanup.
///
/// Built by the accept loop and spawned with [`SessionRunner::spawn`]. The
/// runner owns the connection; its registry entry is removed when it ends.
pub struct SessionRunner {
    connection: Connection,
    handler: Arc<dyn RpcHandler>,
    registry: ConnectionRegistry,
    max_frame_length: usize,
}

impl SessionRunner {
    pub fn new(
        connection: Connection,
        handler: Arc<dyn RpcHandler>,
        registry: ConnectionRegistry,
        max_frame_length: usize,
    ) -> Self {
        Self {
            connection,
            handler,
            registry,
            max_frame_length,
        }
    }

    /// Run on its own task. The session starts once `registered` fires;
    /// if the sender is dropped instead, the connection is closed untracked.
    pub fn spawn(self, registered: oneshot::Receiver<()>) -> JoinHandle<DisconnectReason> {
        tokio::spawn(self.run(registered))
    }

    pub async fn run(self, registered: oneshot::Receiver<()>) -> DisconnectReason {
        let SessionRunner {
            connection,
            handler,
            registry,
            max_frame_length,
        } = self;

        let id = connection.id();
        if registered.await.is_err() {
            tracing::debug!(connection_id = %id, "Registration withdrawn, closing connection");
            connection.dispose();
            return DisconnectReason::Aborted;
        }

        let mut cleanup = Cleanup {
            id,
            connection: None,
            registry,
            reason: DisconnectReason::Aborted,
        };

        let mut connection = connection;
        let result = drive(&mut connection, handler, max_frame_length).await;
        cleanup.connection = Some(connection);
        let reason = DisconnectReason::from_result(&result);

        match &reason {
            DisconnectReason::Failed(detail) => {
                tracing::error!(connection_id = %id, error = %detail, "Session failed");
            }
            other => {
                tracing::debug!(connection_id = %id, reason = %other, "Session ended");
            }
        }

        cleanup.reason = reason.clone();
        drop(cleanup);
        reason
    }
}

async fn drive(
    connection: &mut Connection,
    handler: Arc<dyn RpcHandler>,
    max_frame_length: usize,
) -> Result<(), SessionError> {
    let id = connection.id();
    let transport = connection.take_transport().ok_or_else(|| {
        SessionError::Task("transport was already taken".to_string())
    })?;

    let session = RpcSession::new(id, transport, MessageCodec::new(max_frame_length), handler);
    tracing::info!(connection_id = %id, "Listening for messages");
    session.start_listening().await?;

    connection.closed().await;
    Ok(())
}

struct Cleanup {
    id: ConnectionId,
    connection: Option<Connection>,
    registry: ConnectionRegistry,
    reason: DisconnectReason,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.dispose();
        }
        self.registry.remove(self.id);
        metrics::record_connection_closed(self.reason.as_str());
        tracing::info!(connection_id = %self.id, reason = %self.reason, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::Framed;
    use tracing::field::{Field, Visit};
    use tracing::subscriber::DefaultGuard;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    use crate::rpc::{CodecError, Request, Response, RpcError};
    use crate::server::registry::session_task;

    /// Records the `connection_id` of every ERROR event.
    #[derive(Clone, Default)]
    struct ErrorEvents {
        events: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl ErrorEvents {
        fn install() -> (Self, DefaultGuard) {
            let recorder = ErrorEvents::default();
            let subscriber = tracing_subscriber::registry().with(recorder.clone());
            (recorder, tracing::subscriber::set_default(subscriber))
        }

        fn connection_ids(&self) -> Vec<Option<String>> {
            self.events.lock().unwrap().clone()
        }
    }

    struct ConnectionIdField(Option<String>);

    impl Visit for ConnectionIdField {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            if field.name() == "connection_id" {
                self.0 = Some(format!("{value:?}"));
            }
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for ErrorEvents {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::ERROR {
                let mut field = ConnectionIdField(None);
                event.record(&mut field);
                self.events.lock().unwrap().push(field.0);
            }
        }
    }

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, _method: &str, params: Option<Value>) -> Result<Value, RpcError> {
            Ok(params.unwrap_or(Value::Null))
        }
    }

    struct Started {
        registry: ConnectionRegistry,
        id: ConnectionId,
        handle: crate::net::ConnectionHandle,
        task: JoinHandle<DisconnectReason>,
        client: TcpStream,
    }

    async fn start() -> Started {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let connection = Connection::new(stream, peer);
        let id = connection.id();
        let handle = connection.handle();

        let registry = ConnectionRegistry::new();
        let (tx, rx) = oneshot::channel();
        let runner = SessionRunner::new(connection, Arc::new(Echo), registry.clone(), 1024);
        let task = runner.spawn(rx);
        let shared = session_task(tokio::spawn(async {}));
        registry.register(handle.clone(), shared).unwrap();
        tx.send(()).unwrap();

        Started {
            registry,
            id,
            handle,
            task,
            client,
        }
    }

    async fn finish(task: JoinHandle<DisconnectReason>) -> DisconnectReason {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("runner did not finish")
            .unwrap()
    }

    #[test]
    fn classification() {
        let io_err = |kind: io::ErrorKind| -> Result<(), SessionError> {
            Err(SessionError::Codec(CodecError::Io(io::Error::from(kind))))
        };
        assert_eq!(DisconnectReason::from_result(&Ok(())), DisconnectReason::Normal);
        assert_eq!(
            DisconnectReason::from_result(&io_err(io::ErrorKind::ConnectionReset)),
            DisconnectReason::Reset
        );
        assert_eq!(
            DisconnectReason::from_result(&io_err(io::ErrorKind::BrokenPipe)),
            DisconnectReason::Reset
        );
        assert_eq!(
            DisconnectReason::from_result(&io_err(io::ErrorKind::ConnectionAborted)),
            DisconnectReason::Aborted
        );
        let failed = DisconnectReason::from_result(&io_err(io::ErrorKind::InvalidData));
        assert!(failed.is_error());
        assert!(!DisconnectReason::Reset.is_error());
        assert!(!DisconnectReason::Aborted.is_error());
    }

    #[tokio::test]
    async fn normal_close_removes_entry() {
        let started = start().await;
        let mut framed = Framed::new(started.client, MessageCodec::new(1024));
        framed
            .send(Request::call(1, "echo", Some(json!("hi"))))
            .await
            .unwrap();
        let reply: Response =
            serde_json::from_value(framed.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply.result, Some(json!("hi")));
        assert!(started.registry.contains(started.id));

        drop(framed);
        assert_eq!(finish(started.task).await, DisconnectReason::Normal);
        assert!(started.registry.is_empty());
    }

    #[tokio::test]
    async fn abort_is_not_an_error() {
        let (errors, _guard) = ErrorEvents::install();
        let started = start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        started.handle.abort();

        let reason = finish(started.task).await;
        assert_eq!(reason, DisconnectReason::Aborted);
        assert!(!reason.is_error());
        assert!(started.registry.is_empty());
        assert!(errors.connection_ids().is_empty());
    }

    #[tokio::test]
    async fn peer_reset_is_not_an_error() {
        let (errors, _guard) = ErrorEvents::install();
        let started = start().await;
        started.client.set_linger(Some(Duration::ZERO)).unwrap();
        drop(started.client);

        let reason = finish(started.task).await;
        assert_eq!(reason, DisconnectReason::Reset);
        assert!(!reason.is_error());
        assert!(started.registry.is_empty());
        assert!(errors.connection_ids().is_empty());
    }

    #[tokio::test]
    async fn garbage_is_reported_once_and_cleaned_up() {
        let (errors, _guard) = ErrorEvents::install();
        let mut started = start().await;
        started.client.write_all(&5u32.to_be_bytes()).await.unwrap();
        started.client.write_all(b"{oops").await.unwrap();

        let reason = finish(started.task).await;
        assert!(matches!(reason, DisconnectReason::Failed(ref d) if d.contains("JSON")));
        assert!(started.registry.is_empty());
        assert_eq!(errors.connection_ids(), vec![Some(started.id.to_string())]);
    }

    #[tokio::test]
    async fn withdrawn_registration_leaves_registry_alone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let connection = Connection::new(stream, peer);
        let id = connection.id();

        let registry = ConnectionRegistry::new();
        // Another live entry with the same id must survive.
        registry
            .register(connection.handle(), session_task(tokio::spawn(async {})))
            .unwrap();

        let (tx, rx) = oneshot::channel::<()>();
        let task = SessionRunner::new(connection, Arc::new(Echo), registry.clone(), 1024).spawn(rx);
        drop(tx);

        assert_eq!(finish(task).await, DisconnectReason::Aborted);
        assert!(registry.contains(id));
    }
}
