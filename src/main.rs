//! TCP JSON-RPC server.
//!
//! Accepts TCP connections on a loopback port and hosts one JSON-RPC session
//! per connection, framed with a 4-byte length header.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────┐
//!                        │                    RPC SERVER                     │
//!                        │                                                   │
//!   Client connection    │  ┌─────────┐    ┌──────────┐    ┌─────────────┐   │
//!   ─────────────────────┼─▶│   net   │───▶│  server  │───▶│   runner    │   │
//!                        │  │listener │    │ registry │    │ (per conn)  │   │
//!                        │  └─────────┘    └──────────┘    └──────┬──────┘   │
//!                        │                                        │          │
//!                        │                                        ▼          │
//!   Framed responses     │                 ┌──────────┐    ┌─────────────┐   │
//!   ◀────────────────────┼─────────────────│   rpc    │◀───│   handler   │   │
//!                        │                 │ session  │    │  (greeter)  │   │
//!                        │                 └──────────┘    └─────────────┘   │
//!                        │                                                   │
//!                        │  config · lifecycle (signals, drain) · observability
//!                        └──────────────────────────────────────────────────┘
//! ```
//!
//! Configuration is read from the TOML file named by `RPC_SERVER_CONFIG`,
//! falling back to built-in defaults.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tcp_rpc_server::config::{self, ServerConfig};
use tcp_rpc_server::lifecycle::shutdown_signal;
use tcp_rpc_server::observability::{logging, metrics};
use tcp_rpc_server::{Greeter, RpcService};

const CONFIG_ENV: &str = "RPC_SERVER_CONFIG";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => config::load_config(&PathBuf::from(path))?,
        None => ServerConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!("rpc-server v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        max_frame_length = config.framing.max_frame_length,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let service = Arc::new(RpcService::new(config, Arc::new(Greeter)));

    let stopper = service.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        stopper.request_stop();
    });

    service.run(CancellationToken::new()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
