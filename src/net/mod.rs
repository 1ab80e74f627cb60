//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (id, abortable transport, closed notification)
//!     → Hand off to the session runner
//!
//! Connection States:
//!     Accepted → Running → Closed | Aborted → Disposed
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection can be aborted by a party that does not own it
//! - Closing the listener ends the accept stream without an error

pub mod connection;
pub mod listener;

pub use connection::{Connection, ConnectionHandle, ConnectionId, Transport};
pub use listener::{Listener, ListenerError};
