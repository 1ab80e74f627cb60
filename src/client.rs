//! Client side of the length-prefixed JSON-RPC protocol.

use std::io;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;

use crate::rpc::{CodecError, Incoming, MessageCodec, Request, RpcError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("server closed the connection")]
    Closed,
}

/// One connection to an RPC server. Calls are issued one at a time.
#[derive(Debug)]
pub struct RpcClient {
    framed: Framed<TcpStream, MessageCodec>,
    next_id: u64,
}

impl RpcClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        Ok(Self::new(stream, MessageCodec::default()))
    }

    pub fn new(stream: TcpStream, codec: MessageCodec) -> Self {
        Self {
            framed: Framed::new(stream, codec),
            next_id: 1,
        }
    }

    /// Call `method` and wait for its response.
    pub async fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        let id = self.next_id;
        self.next_id += 1;
        self.framed.send(Request::call(id, method, params)).await?;

        loop {
            let Some(value) = self.next_message().await? else {
                return Err(ClientError::Closed);
            };
            match Incoming::classify(value) {
                Incoming::Response(response) if response.id == Value::from(id) => {
                    return Ok(response.into_result()?);
                }
                other => {
                    tracing::debug!(expected_id = id, message = ?other, "Skipping unrelated message");
                }
            }
        }
    }

    /// Send a notification; the server does not answer it.
    pub async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        self.send_raw(Request::notification(method, params)).await
    }

    /// Send any JSON value as one frame.
    pub async fn send_raw<T: Serialize>(&mut self, message: T) -> Result<(), ClientError> {
        self.framed.send(message).await?;
        Ok(())
    }

    /// Next frame from the server, `None` once it has closed the connection.
    pub async fn next_message(&mut self) -> Result<Option<Value>, ClientError> {
        self.framed.next().await.transpose().map_err(ClientError::from)
    }

    pub fn stream(&self) -> &TcpStream {
        self.framed.get_ref()
    }

    pub fn into_stream(self) -> TcpStream {
        self.framed.into_inner()
    }
}
