//! Shared utilities for integration testing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tcp_rpc_server::rpc::{RpcError, RpcHandler};
use tcp_rpc_server::server::ServiceError;
use tcp_rpc_server::{Greeter, RpcService, ServerConfig, ServiceState};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Greeter plus a `Wait` method that never returns, to pin a call in flight.
pub struct TestHandler;

#[async_trait]
impl RpcHandler for TestHandler {
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        match method {
            "Wait" => {
                std::future::pending::<()>().await;
                Ok(json!(null))
            }
            _ => Greeter.handle(method, params).await,
        }
    }
}

pub struct RunningService {
    pub service: Arc<RpcService>,
    pub addr: SocketAddr,
    pub task: JoinHandle<Result<(), ServiceError>>,
}

impl RunningService {
    /// Request a stop and wait for the service to report Stopped.
    pub async fn stop(self) -> Result<(), ServiceError> {
        self.service.request_stop();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("service did not drain in time")
            .expect("service task panicked")
    }
}

/// Start a service on an ephemeral loopback port and wait until it accepts.
pub async fn start_service() -> RunningService {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();

    let service = Arc::new(RpcService::new(config, Arc::new(TestHandler)));
    let task = {
        let service = service.clone();
        tokio::spawn(async move { service.run(CancellationToken::new()).await })
    };

    service.wait_for_state(ServiceState::Accepting).await;
    let addr = service.local_addr().expect("service should be bound");
    RunningService { service, addr, task }
}

/// Poll until `check` holds or a deadline passes.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
