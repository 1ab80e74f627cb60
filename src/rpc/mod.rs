//! JSON-RPC over length-prefixed frames.
//!
//! # Data Flow
//! ```text
//! Transport (byte stream)
//!     → codec.rs (4-byte length header + JSON payload)
//!     → message.rs (classify request / notification / response)
//!     → session.rs (dispatch to the handler, write responses)
//!     → handler.rs (the service object whose methods are invoked)
//! ```

pub mod codec;
pub mod handler;
pub mod message;
pub mod session;

pub use codec::{CodecError, MessageCodec};
pub use handler::{parse_params, RpcHandler};
pub use message::{Incoming, Request, Response, RpcError};
pub use session::{Completion, RpcSession, SessionError};
