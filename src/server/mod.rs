//! Connection lifecycle core.
//!
//! # Data Flow
//! ```text
//! service.rs  bind → accept loop ──┬─► registry.rs (id → handle + task)
//!                                  └─► runner.rs (one task per connection)
//!                                          → rpc::RpcSession
//!                                          → cleanup: dispose + registry.remove
//! stop request → cancel accept → close listener → snapshot → abort all → await all
//! ```
//!
//! # Design Decisions
//! - The registry is owned by one service instance, never global
//! - Only a runner removes its own entry; shutdown aborts and waits
//! - A runner starts only after its entry is registered

pub mod registry;
pub mod runner;
pub mod service;

pub use registry::{ConnectionEntry, ConnectionRegistry, RegistryError, SessionTask};
pub use runner::{DisconnectReason, SessionRunner};
pub use service::{RpcService, ServiceError, ServiceState};
