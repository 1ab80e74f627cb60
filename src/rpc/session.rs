//! A JSON-RPC session bound to one framed byte stream.
//!
//! The session reads framed messages, dispatches calls to the handler
//! concurrently and writes each response as soon as its call finishes.
//!
//! ```text
//! framed.next() ──► classify ──► JoinSet<handler call> ──► framed.send(response)
//!                        └─ invalid ─► error response
//! ```
//!
//! It ends when the peer closes its side, when the transport or codec fails,
//! when a handler panics, or when its stop handle is cancelled.

use std::any::Any;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::net::ConnectionId;
use crate::observability::metrics;
use crate::rpc::codec::{CodecError, MessageCodec};
use crate::rpc::handler::RpcHandler;
use crate::rpc::message::{Incoming, Request, Response, RpcError};

/// Why a session stopped abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("handler panicked: {0}")]
    HandlerPanicked(String),
    #[error("session task ended unexpectedly: {0}")]
    Task(String),
}

impl SessionError {
    /// The I/O error kind, when the session died on a transport error.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            SessionError::Codec(CodecError::Io(e)) => Some(e.kind()),
            _ => None,
        }
    }

    fn from_join(err: JoinError) -> Self {
        if err.is_panic() {
            SessionError::HandlerPanicked(panic_message(err.into_panic()))
        } else {
            SessionError::Task(err.to_string())
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        SessionError::Codec(CodecError::Io(err))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Serves JSON-RPC calls from one peer over a framed byte stream.
///
/// Calls run concurrently on their own tasks; responses are written in
/// completion order. Create with [`RpcSession::new`], then hand it off with
/// [`RpcSession::start_listening`].
pub struct RpcSession<T> {
    connection_id: ConnectionId,
    framed: Framed<T, MessageCodec>,
    handler: Arc<dyn RpcHandler>,
    stop: CancellationToken,
}

impl<T> RpcSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        connection_id: ConnectionId,
        transport: T,
        codec: MessageCodec,
        handler: Arc<dyn RpcHandler>,
    ) -> Self {
        Self {
            connection_id,
            framed: Framed::new(transport, codec),
            handler,
            stop: CancellationToken::new(),
        }
    }

    /// Cancelling the returned token ends the session cleanly.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Start processing messages in the background.
    pub fn start_listening(self) -> Completion {
        Completion {
            task: tokio::spawn(self.run()),
        }
    }

    async fn run(mut self) -> Result<(), SessionError> {
        let mut inflight: JoinSet<Option<Response>> = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = self.stop.cancelled() => {
                    tracing::debug!(connection_id = %self.connection_id, "Session stopped");
                    return Ok(());
                }

                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    match joined {
                        Ok(Some(response)) => self.framed.send(response).await?,
                        Ok(None) => {}
                        Err(e) => return Err(SessionError::from_join(e)),
                    }
                }

                frame = self.framed.next() => match frame {
                    Some(Ok(value)) => self.dispatch(value, &mut inflight).await?,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        tracing::debug!(
                            connection_id = %self.connection_id,
                            pending_calls = inflight.len(),
                            "Peer closed the stream"
                        );
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn dispatch(
        &mut self,
        value: Value,
        inflight: &mut JoinSet<Option<Response>>,
    ) -> Result<(), SessionError> {
        match Incoming::classify(value) {
            Incoming::Request(request) => {
                tracing::trace!(
                    connection_id = %self.connection_id,
                    method = %request.method,
                    "Dispatching call"
                );
                inflight.spawn(invoke(self.handler.clone(), request));
            }
            Incoming::Response(response) => {
                tracing::debug!(
                    connection_id = %self.connection_id,
                    id = %response.id,
                    "Ignoring response from client"
                );
            }
            Incoming::Invalid { id, reason } => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    reason = %reason,
                    "Invalid JSON-RPC message"
                );
                self.framed
                    .send(Response::failure(id, RpcError::invalid_request(reason)))
                    .await?;
            }
        }
        Ok(())
    }
}

async fn invoke(handler: Arc<dyn RpcHandler>, request: Request) -> Option<Response> {
    let started = Instant::now();
    let outcome = handler.handle(&request.method, request.params).await;
    let error_code = outcome.as_ref().err().map(|e| e.code);
    metrics::record_request(&request.method, error_code, started);

    let id = request.id?;
    Some(match outcome {
        Ok(result) => Response::success(id, result),
        Err(error) => Response::failure(id, error),
    })
}

/// Resolves when the session ends. Dropping it stops the session.
#[derive(Debug)]
pub struct Completion {
    task: JoinHandle<Result<(), SessionError>>,
}

impl Future for Completion {
    type Output = Result<(), SessionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task)
            .poll(cx)
            .map(|joined| joined.unwrap_or_else(|e| Err(SessionError::from_join(e))))
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.task.abort();
    }
}
