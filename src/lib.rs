//! TCP JSON-RPC Server Library

pub mod client;
pub mod config;
pub mod greeter;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod rpc;
pub mod server;

pub use client::RpcClient;
pub use config::schema::ServerConfig;
pub use greeter::Greeter;
pub use lifecycle::Shutdown;
pub use server::{RpcService, ServiceState};
